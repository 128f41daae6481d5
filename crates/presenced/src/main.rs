use anyhow::{Context, Result};
use presence_core::{
    EmbeddingExtractor, EnrollmentWorkflow, Gallery, GalleryStore, Threshold,
    VerificationWorkflow, WorkflowError,
};
use presence_hw::{CaptureSource, StillImageSource};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod remote;
mod seal;
mod store;

use config::{Config, StoreBackend};

async fn open_store(config: &Config) -> Result<Arc<dyn GalleryStore>> {
    match config.store {
        StoreBackend::Sqlite => {
            let sealer = seal::Sealer::load_or_create(&config.key_path)?;
            let store = store::SqliteGalleryStore::open(&config.db_path, sealer).await?;
            tracing::info!(path = %config.db_path.display(), "SQLite gallery opened");
            Ok(Arc::new(store))
        }
        StoreBackend::Rest => {
            let url = config
                .store_url
                .as_deref()
                .context("PRESENCE_STORE=rest requires PRESENCE_STORE_URL")?;
            let store = remote::RestGalleryStore::new(
                url,
                &config.store_collection,
                config.store_auth.clone(),
            )?;
            tracing::info!(url, collection = %config.store_collection, "REST gallery configured");
            Ok(Arc::new(store))
        }
    }
}

fn capture_source(config: &Config) -> Arc<dyn CaptureSource> {
    if let Some(path) = &config.still_image {
        tracing::info!(path = %path.display(), "serving frames from a still image");
        return Arc::new(StillImageSource::from_path(path.clone()));
    }

    #[cfg(feature = "v4l2")]
    {
        for device in presence_hw::Camera::list_devices() {
            tracing::debug!(path = %device.path, name = %device.name, "video device found");
        }
        Arc::new(presence_hw::Camera::new(
            &config.camera_device,
            config.warmup_frames,
        ))
    }

    #[cfg(not(feature = "v4l2"))]
    {
        tracing::warn!(
            device = %config.camera_device,
            "built without V4L2 support; live capture unavailable"
        );
        Arc::new(presence_hw::UnavailableSource::new("built without the v4l2 feature"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::from_env();
    let threshold = Threshold::new(config.match_threshold)?;

    let store = open_store(&config).await?;
    let gallery = Arc::new(Gallery::new(store).with_ttl(config.gallery_ttl()));

    let extractor: Arc<dyn EmbeddingExtractor> = Arc::new(remote::RemoteExtractor::new(
        &config.extractor_url,
        config.embedding_dim,
    )?);

    let mut enroller = EnrollmentWorkflow::new(Arc::clone(&extractor), Arc::clone(&gallery));
    if let Some(url) = &config.vectorizer_url {
        enroller = enroller.with_vectorizer(Arc::new(remote::RemoteVectorizer::new(url)?));
        tracing::info!(url = %url, "remote enrollment enabled");
    }

    let mut verifier = VerificationWorkflow::new(
        extractor,
        capture_source(&config),
        Arc::clone(&gallery),
        threshold,
    );
    match verifier.start().await {
        Ok(()) => {}
        Err(WorkflowError::Capture(e)) => {
            tracing::warn!(error = %e, "no live feed at startup; OpenCapture retries");
        }
        Err(e) => return Err(e).context("verification engine failed to start"),
    }

    let session_bus = config.session_bus;
    let service = dbus_interface::PresenceService::new(verifier, enroller, gallery, config);
    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let connection = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(
        bus = if session_bus { "session" } else { "system" },
        name = dbus_interface::BUS_NAME,
        "presenced ready"
    );

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    let iface = connection
        .object_server()
        .interface::<_, dbus_interface::PresenceService>(dbus_interface::OBJECT_PATH)
        .await?;
    iface.get().await.release_capture();

    Ok(())
}
