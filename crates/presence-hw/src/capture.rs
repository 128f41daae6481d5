//! Capture source abstraction: open a stream, read frames, close it.

use crate::frame::{Frame, FrameError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device permission denied: {0}")]
    PermissionDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture source already open")]
    AlreadyOpen,
    #[error("capture stream closed")]
    Closed,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("invalid image: {0}")]
    InvalidImage(#[from] FrameError),
}

/// Something that can hand out a frame stream: a camera, a still image, a test double.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Open the source. Only one stream may be open per source at a time.
    async fn open(&self) -> Result<Arc<dyn CaptureStream>, CaptureError>;

    /// Human-readable description for logs and status output.
    fn describe(&self) -> String;
}

/// An open capture stream.
///
/// `close` may be called from any task, including while `read_frame` is
/// pending; the pending read then resolves to [`CaptureError::Closed`].
#[async_trait]
pub trait CaptureStream: Send + Sync {
    async fn read_frame(&self) -> Result<Frame, CaptureError>;

    /// Release the underlying device. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Exclusive-ownership flag shared between a source and its open stream.
#[derive(Clone, Default)]
pub struct DeviceLease {
    held: Arc<AtomicBool>,
}

impl DeviceLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease, failing with [`CaptureError::AlreadyOpen`] if it is held.
    pub fn acquire(&self) -> Result<LeaseGuard, CaptureError> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CaptureError::AlreadyOpen)?;
        Ok(LeaseGuard {
            held: Arc::clone(&self.held),
            released: AtomicBool::new(false),
        })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Held while a stream is open. Released on `release()` or drop, whichever is first.
pub struct LeaseGuard {
    held: Arc<AtomicBool>,
    released: AtomicBool,
}

impl LeaseGuard {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.held.store(false, Ordering::Release);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Tracks the worker that last owned a device node.
///
/// The lease is released as soon as a stream is closed, but a worker thread
/// may still be inside a blocking dequeue with the node open. A new open
/// waits here until that worker has dropped its [`HandoffToken`].
#[derive(Default)]
pub struct DeviceHandoff {
    previous: Mutex<Option<oneshot::Receiver<()>>>,
}

/// Held by the worker that owns the device; dropping it frees the node.
pub struct HandoffToken {
    _owner: oneshot::Sender<()>,
}

impl DeviceHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for the previous owner to exit.
    ///
    /// On timeout the previous owner stays tracked and the open fails with
    /// [`CaptureError::DeviceBusy`].
    pub async fn wait_previous(&self, timeout: Duration) -> Result<(), CaptureError> {
        let previous = self.previous.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut previous) = previous else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, &mut previous).await {
            // Err(RecvError) is the normal exit: the token was dropped without sending.
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!(?timeout, "previous capture worker still holds the device");
                *self.previous.lock().unwrap_or_else(|e| e.into_inner()) = Some(previous);
                Err(CaptureError::DeviceBusy)
            }
        }
    }

    /// Register a new owner. The device counts as busy until the token is dropped.
    pub fn hand_over(&self) -> HandoffToken {
        let (owner, done) = oneshot::channel();
        *self.previous.lock().unwrap_or_else(|e| e.into_inner()) = Some(done);
        HandoffToken { _owner: owner }
    }

    pub fn is_pending(&self) -> bool {
        self.previous
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
            .is_some_and(|rx| matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)))
    }
}

enum StillOrigin {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

/// A static image presented as a capture source: every read yields the same picture.
pub struct StillImageSource {
    origin: StillOrigin,
    lease: DeviceLease,
}

impl StillImageSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            origin: StillOrigin::Path(path.into()),
            lease: DeviceLease::new(),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            origin: StillOrigin::Bytes(bytes),
            lease: DeviceLease::new(),
        }
    }
}

#[async_trait]
impl CaptureSource for StillImageSource {
    async fn open(&self) -> Result<Arc<dyn CaptureStream>, CaptureError> {
        let guard = self.lease.acquire()?;
        let bytes = match &self.origin {
            StillOrigin::Path(path) => tokio::fs::read(path).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CaptureError::DeviceNotFound(path.display().to_string()),
                std::io::ErrorKind::PermissionDenied => {
                    CaptureError::PermissionDenied(path.display().to_string())
                }
                _ => CaptureError::CaptureFailed(format!("{}: {e}", path.display())),
            })?,
            StillOrigin::Bytes(bytes) => bytes.clone(),
        };
        let frame = Frame::decode(&bytes)?;

        tracing::debug!(
            source = %self.describe(),
            width = frame.width,
            height = frame.height,
            "still image opened"
        );

        Ok(Arc::new(StillImageStream {
            frame,
            sequence: AtomicU32::new(0),
            guard,
        }))
    }

    fn describe(&self) -> String {
        match &self.origin {
            StillOrigin::Path(path) => format!("still:{}", path.display()),
            StillOrigin::Bytes(bytes) => format!("still:<{} bytes>", bytes.len()),
        }
    }
}

struct StillImageStream {
    frame: Frame,
    sequence: AtomicU32,
    guard: LeaseGuard,
}

#[async_trait]
impl CaptureStream for StillImageStream {
    async fn read_frame(&self) -> Result<Frame, CaptureError> {
        if self.guard.is_released() {
            return Err(CaptureError::Closed);
        }
        let mut frame = self.frame.clone();
        frame.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        frame.timestamp = std::time::Instant::now();
        Ok(frame)
    }

    fn close(&self) {
        self.guard.release();
    }

    fn is_closed(&self) -> bool {
        self.guard.is_released()
    }
}

/// Placeholder source for builds or hosts without a capture backend.
/// Every `open` fails, leaving workflows usable for still-image verification only.
pub struct UnavailableSource {
    reason: String,
}

impl UnavailableSource {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CaptureSource for UnavailableSource {
    async fn open(&self) -> Result<Arc<dyn CaptureStream>, CaptureError> {
        Err(CaptureError::DeviceNotFound(self.reason.clone()))
    }

    fn describe(&self) -> String {
        format!("unavailable ({})", self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn png_bytes() -> Vec<u8> {
        Frame::from_raw(vec![90u8; 2 * 2 * 3], 2, 2, PixelFormat::Rgb8, 0)
            .unwrap()
            .to_png()
            .unwrap()
    }

    #[test]
    fn test_lease_is_exclusive() {
        let lease = DeviceLease::new();
        let guard = lease.acquire().unwrap();
        assert!(matches!(lease.acquire(), Err(CaptureError::AlreadyOpen)));
        drop(guard);
        assert!(!lease.is_held());
        assert!(lease.acquire().is_ok());
    }

    #[test]
    fn test_lease_release_is_idempotent() {
        let lease = DeviceLease::new();
        let guard = lease.acquire().unwrap();
        guard.release();
        guard.release();
        // a fresh holder must not be evicted by the stale guard's drop
        let second = lease.acquire().unwrap();
        drop(guard);
        assert!(lease.is_held());
        drop(second);
        assert!(!lease.is_held());
    }

    #[tokio::test]
    async fn test_handoff_without_previous_owner_is_immediate() {
        let handoff = DeviceHandoff::new();
        handoff.wait_previous(Duration::ZERO).await.unwrap();
        assert!(!handoff.is_pending());
    }

    #[tokio::test]
    async fn test_reopen_waits_for_worker_to_drop_device() {
        let lease = DeviceLease::new();
        let handoff = DeviceHandoff::new();

        // first stream: worker owns the node, stream holds the lease
        let guard = lease.acquire().unwrap();
        let token = handoff.hand_over();
        assert!(handoff.is_pending());

        // close releases the lease at once, the worker is still mid-dequeue
        guard.release();
        let second = lease.acquire().unwrap();
        assert!(matches!(
            handoff.wait_previous(Duration::from_millis(20)).await,
            Err(CaptureError::DeviceBusy)
        ));
        // a timed-out wait keeps tracking the same worker
        assert!(handoff.is_pending());

        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            drop(token);
        });
        handoff.wait_previous(Duration::from_secs(5)).await.unwrap();
        worker.join().unwrap();
        assert!(!handoff.is_pending());
        drop(second);
    }

    #[tokio::test]
    async fn test_still_source_reads_and_closes() {
        let source = StillImageSource::from_bytes(png_bytes());
        let stream = source.open().await.unwrap();

        let first = stream.read_frame().await.unwrap();
        let second = stream.read_frame().await.unwrap();
        assert_eq!((first.width, first.height), (2, 2));
        assert_eq!(second.sequence, first.sequence + 1);

        assert!(matches!(source.open().await, Err(CaptureError::AlreadyOpen)));

        stream.close();
        stream.close();
        assert!(stream.is_closed());
        assert!(matches!(stream.read_frame().await, Err(CaptureError::Closed)));
        assert!(source.open().await.is_ok());
    }

    #[tokio::test]
    async fn test_still_source_missing_file() {
        let source = StillImageSource::from_path("/nonexistent/presence/face.jpg");
        assert!(matches!(
            source.open().await,
            Err(CaptureError::DeviceNotFound(_))
        ));
        // failed open must not leave the lease held
        assert!(!source.lease.is_held());
    }

    #[tokio::test]
    async fn test_still_source_invalid_image() {
        let source = StillImageSource::from_bytes(b"nope".to_vec());
        assert!(matches!(
            source.open().await,
            Err(CaptureError::InvalidImage(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_source() {
        let source = UnavailableSource::new("no camera backend");
        assert!(source.open().await.is_err());
        assert!(source.describe().contains("no camera backend"));
    }
}
