use std::path::PathBuf;
use std::time::Duration;

/// Where gallery entries are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Local SQLite file with sealed descriptors.
    Sqlite,
    /// Remote JSON document store (`{base}/{collection}.json`).
    Rest,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f32,
    /// Timeout in seconds for a single verify scan.
    pub verify_timeout_secs: u64,
    /// Gallery snapshot lifetime; zero reloads on every scan.
    pub gallery_ttl_secs: u64,
    /// Number of warmup frames to discard after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Serve frames from this image instead of a camera.
    pub still_image: Option<PathBuf>,
    /// Base URL of the embedding inference service.
    pub extractor_url: String,
    /// Descriptor dimensionality the extractor must produce.
    pub embedding_dim: usize,
    /// Base URL of the vectorization service used by remote enrollment.
    pub vectorizer_url: Option<String>,
    pub store: StoreBackend,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Path to the descriptor sealing key.
    pub key_path: PathBuf,
    pub store_url: Option<String>,
    pub store_auth: Option<String>,
    pub store_collection: String,
    /// Register on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        let db_path = std::env::var("PRESENCE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("gallery.db"));
        let key_path = std::env::var("PRESENCE_KEY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("gallery.key"));

        let store = match std::env::var("PRESENCE_STORE").as_deref() {
            Ok("rest") => StoreBackend::Rest,
            _ => StoreBackend::Sqlite,
        };

        Self {
            match_threshold: env_f32(
                "PRESENCE_MATCH_THRESHOLD",
                presence_core::DEFAULT_THRESHOLD,
            ),
            verify_timeout_secs: env_u64("PRESENCE_VERIFY_TIMEOUT_SECS", 10),
            gallery_ttl_secs: env_u64("PRESENCE_GALLERY_TTL_SECS", 0),
            warmup_frames: env_usize("PRESENCE_WARMUP_FRAMES", 4),
            camera_device: std::env::var("PRESENCE_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            still_image: env_opt("PRESENCE_STILL_IMAGE").map(PathBuf::from),
            extractor_url: std::env::var("PRESENCE_EXTRACTOR_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8500".to_string()),
            embedding_dim: env_usize("PRESENCE_EMBEDDING_DIM", 128),
            vectorizer_url: env_opt("PRESENCE_VECTORIZER_URL"),
            store,
            db_path,
            key_path,
            store_url: env_opt("PRESENCE_STORE_URL"),
            store_auth: env_opt("PRESENCE_STORE_AUTH"),
            store_collection: std::env::var("PRESENCE_STORE_COLLECTION")
                .unwrap_or_else(|_| "image_vectors".to_string()),
            session_bus: std::env::var("PRESENCE_SESSION_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn gallery_ttl(&self) -> Duration {
        Duration::from_secs(self.gallery_ttl_secs)
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
