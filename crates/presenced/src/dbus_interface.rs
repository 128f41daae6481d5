use crate::config::Config;
use presence_core::{
    BackfillCandidate, EnrollOptions, EnrollmentWorkflow, Gallery, GalleryEntry, Identity,
    ImageLocator, MatchResult, ReleaseHandle, VerificationWorkflow, WorkflowError, WorkflowState,
};
use presence_hw::Frame;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;

pub const BUS_NAME: &str = "io.presence.Engine1";
pub const OBJECT_PATH: &str = "/io/presence/Engine1";

/// D-Bus interface for the presence engine.
///
/// Bus name: io.presence.Engine1
/// Object path: /io/presence/Engine1
pub struct PresenceService {
    verifier: Mutex<VerificationWorkflow>,
    release: ReleaseHandle,
    enroller: EnrollmentWorkflow,
    gallery: Arc<Gallery>,
    config: Config,
}

impl PresenceService {
    pub fn new(
        verifier: VerificationWorkflow,
        enroller: EnrollmentWorkflow,
        gallery: Arc<Gallery>,
        config: Config,
    ) -> Self {
        let release = verifier.release_handle();
        Self {
            verifier: Mutex::new(verifier),
            release,
            enroller,
            gallery,
            config,
        }
    }

    /// Release the capture source without waiting for a running scan.
    pub fn release_capture(&self) {
        self.release.release();
    }

    async fn status_json(&self) -> serde_json::Value {
        // Never block on a running scan just to report status.
        let (state, live_feed, source, threshold) = match self.verifier.try_lock() {
            Ok(wf) => {
                let state = wf.state();
                let failure = match &state {
                    WorkflowState::Failed(reason) => Some(reason.clone()),
                    _ => None,
                };
                (
                    serde_json::json!({ "name": state_label(&state), "failure": failure }),
                    Some(wf.has_live_feed()),
                    wf.source_description(),
                    wf.threshold().value(),
                )
            }
            // Unknown while busy: a scan may be failing on a lost feed.
            Err(_) => (
                serde_json::json!({ "name": "busy" }),
                None,
                String::new(),
                self.config.match_threshold,
            ),
        };
        let gallery = match self.gallery.stats().await {
            Ok(stats) => serde_json::json!(stats),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };

        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "state": state,
            "live_feed": live_feed,
            "source": source,
            "threshold": threshold,
            "gallery_ttl_secs": self.config.gallery_ttl_secs,
            "gallery": gallery,
        })
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn parse_identity(raw: &str) -> zbus::fdo::Result<Identity> {
    Identity::new(raw).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

/// Bring an idle workflow back up. A missing camera is not an error here.
async fn ensure_started(wf: &mut VerificationWorkflow) -> Result<(), WorkflowError> {
    if wf.state() != WorkflowState::Idle {
        return Ok(());
    }
    match wf.start().await {
        Err(WorkflowError::Capture(e)) => {
            tracing::warn!(error = %e, "continuing without a live feed");
            Ok(())
        }
        other => other,
    }
}

fn state_label(state: &WorkflowState) -> &'static str {
    match state {
        WorkflowState::Idle => "idle",
        WorkflowState::ModelLoading => "model_loading",
        WorkflowState::Ready => "ready",
        WorkflowState::Capturing => "capturing",
        WorkflowState::Scanning => "scanning",
        WorkflowState::Result(_) => "result",
        WorkflowState::Failed(_) => "failed",
    }
}

fn result_json(result: &MatchResult) -> String {
    let mut value = serde_json::to_value(result).unwrap_or_default();
    if let (Some(map), Some(confidence)) = (value.as_object_mut(), result.confidence()) {
        map.insert("confidence".into(), serde_json::json!(confidence));
    }
    value.to_string()
}

fn entry_json(entry: &GalleryEntry) -> serde_json::Value {
    serde_json::json!({
        "id": entry.id,
        "identity": entry.identity,
        "dimension": entry.descriptor.len(),
        "enrolled_at": entry.enrolled_at.to_rfc3339(),
    })
}

#[derive(Deserialize)]
struct BackfillItem {
    identity: String,
    #[serde(default)]
    url: Option<String>,
}

#[interface(name = "io.presence.Engine1")]
impl PresenceService {
    /// Enroll the face in an image file for the given identity.
    async fn enroll(
        &self,
        identity: &str,
        image_path: &str,
        replace: bool,
    ) -> zbus::fdo::Result<String> {
        let identity = parse_identity(identity)?;
        tracing::info!(identity = %identity, image_path, replace, "enroll requested");

        let bytes = tokio::fs::read(image_path)
            .await
            .map_err(|e| failed(format!("{image_path}: {e}")))?;
        self.enroller.prepare().await.map_err(failed)?;
        let entry = self
            .enroller
            .enroll_image(
                &identity,
                &bytes,
                EnrollOptions {
                    replace_existing: replace,
                },
            )
            .await
            .map_err(failed)?;
        Ok(entry_json(&entry).to_string())
    }

    /// Enroll from one frame of the live feed.
    async fn enroll_capture(&self, identity: &str, replace: bool) -> zbus::fdo::Result<String> {
        let identity = parse_identity(identity)?;
        tracing::info!(identity = %identity, replace, "enroll from capture requested");

        let frame = {
            let mut wf = self.verifier.lock().await;
            ensure_started(&mut wf).await.map_err(failed)?;
            tokio::time::timeout(self.config.verify_timeout(), wf.capture_frame())
                .await
                .map_err(|_| failed(WorkflowError::Timeout(self.config.verify_timeout())))?
                .map_err(failed)?
        };

        self.enroller.prepare().await.map_err(failed)?;
        let entry = self
            .enroller
            .enroll_with(
                &identity,
                &frame,
                EnrollOptions {
                    replace_existing: replace,
                },
            )
            .await
            .map_err(failed)?;
        Ok(entry_json(&entry).to_string())
    }

    /// Ask the vectorization service to enroll an identity from an https image URL.
    async fn enroll_remote(&self, identity: &str, url: &str) -> zbus::fdo::Result<String> {
        let identity = parse_identity(identity)?;
        let locator =
            ImageLocator::new(url).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        tracing::info!(identity = %identity, url, "remote enroll requested");
        let vector = self
            .enroller
            .enroll_remote(&identity, &locator)
            .await
            .map_err(failed)?;
        Ok(vector.0)
    }

    /// Vectorize a JSON list of `{"identity", "url"}` records not enrolled yet.
    async fn backfill(&self, candidates_json: &str) -> zbus::fdo::Result<String> {
        let items: Vec<BackfillItem> = serde_json::from_str(candidates_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        let mut candidates = Vec::with_capacity(items.len());
        for item in items {
            let locator = match item.url.as_deref() {
                Some(url) => Some(
                    ImageLocator::new(url)
                        .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?,
                ),
                None => None,
            };
            candidates.push(BackfillCandidate {
                identity: parse_identity(&item.identity)?,
                locator,
            });
        }
        tracing::info!(count = candidates.len(), "backfill requested");

        let report = self.enroller.backfill(candidates).await.map_err(failed)?;
        serde_json::to_string(&report).map_err(failed)
    }

    /// Scan one frame from the live feed.
    async fn verify(&self) -> zbus::fdo::Result<String> {
        tracing::info!("verify requested");
        let mut wf = self.verifier.lock().await;
        ensure_started(&mut wf).await.map_err(failed)?;
        let result = wf
            .scan_within(self.config.verify_timeout())
            .await
            .map_err(failed)?;
        Ok(result_json(&result))
    }

    /// Check one live frame against the descriptors of a claimed identity only.
    async fn verify_identity(&self, identity: &str) -> zbus::fdo::Result<String> {
        let identity = parse_identity(identity)?;
        tracing::info!(identity = %identity, "claim verification requested");
        let mut wf = self.verifier.lock().await;
        ensure_started(&mut wf).await.map_err(failed)?;
        let result = wf
            .verify_claim_within(&identity, self.config.verify_timeout())
            .await
            .map_err(failed)?;
        Ok(result_json(&result))
    }

    /// Check a still image file against the descriptors of a claimed identity.
    async fn verify_identity_image(
        &self,
        identity: &str,
        path: &str,
    ) -> zbus::fdo::Result<String> {
        let identity = parse_identity(identity)?;
        tracing::info!(identity = %identity, path, "claim verification of image requested");
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| failed(format!("{path}: {e}")))?;
        let frame = Frame::decode(&bytes).map_err(failed)?;

        let mut wf = self.verifier.lock().await;
        ensure_started(&mut wf).await.map_err(failed)?;
        let result = wf
            .verify_claim_frame(&identity, frame)
            .await
            .map_err(failed)?;
        Ok(result_json(&result))
    }

    /// Verify a still image file without touching the camera.
    async fn verify_image(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "verify image requested");
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| failed(format!("{path}: {e}")))?;
        let frame = Frame::decode(&bytes).map_err(failed)?;

        let mut wf = self.verifier.lock().await;
        ensure_started(&mut wf).await.map_err(failed)?;
        let result = wf.verify_frame(frame).await.map_err(failed)?;
        Ok(result_json(&result))
    }

    /// List enrolled descriptors (metadata only) for the given identity.
    async fn list_entries(&self, identity: &str) -> zbus::fdo::Result<String> {
        let identity = parse_identity(identity)?;
        let entries = self
            .gallery
            .entries_for(&identity)
            .await
            .map_err(failed)?;
        let list: Vec<_> = entries.iter().map(entry_json).collect();
        Ok(serde_json::Value::Array(list).to_string())
    }

    /// Delete every descriptor of an identity, returning how many went.
    async fn remove_identity(&self, identity: &str) -> zbus::fdo::Result<u32> {
        let identity = parse_identity(identity)?;
        let removed = self.enroller.remove(&identity).await.map_err(failed)?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    /// Open (or retry opening) the capture source.
    async fn open_capture(&self) -> zbus::fdo::Result<()> {
        let mut wf = self.verifier.lock().await;
        if wf.state() == WorkflowState::Idle {
            // start() opens the feed itself; surface its capture error here.
            return wf.start().await.map_err(failed);
        }
        wf.open_capture().await.map_err(failed)
    }

    /// Close the capture source. Any scan in progress ends with "released".
    async fn release(&self) -> zbus::fdo::Result<()> {
        tracing::info!("release requested");
        self.release.release();
        Ok(())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().await.to_string())
    }
}
