//! Test doubles shared by the workflow tests.

use crate::extractor::{EmbeddingExtractor, ExtractionError};
use crate::types::Descriptor;
use async_trait::async_trait;
use presence_hw::{
    CaptureError, CaptureSource, CaptureStream, DeviceLease, Frame, LeaseGuard, PixelFormat,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const DIM: usize = 4;

/// 2x2 grayscale frame; the four pixels become the descriptor.
pub fn face_frame(pixels: [u8; 4]) -> Frame {
    Frame::from_raw(pixels.to_vec(), 2, 2, PixelFormat::Gray8, 0).unwrap()
}

pub fn empty_frame() -> Frame {
    face_frame([0, 0, 0, 0])
}

/// First pixel 255 marks a crowd.
pub fn crowd_frame() -> Frame {
    face_frame([255, 10, 10, 10])
}

/// First pixel 254 makes the extractor itself fail.
pub fn glitch_frame() -> Frame {
    face_frame([254, 10, 10, 10])
}

pub fn descriptor_of(pixels: [u8; 4]) -> Descriptor {
    Descriptor::new(pixels.iter().map(|&p| p as f32 / 255.0).collect()).unwrap()
}

/// Deterministic extractor reading the descriptor straight out of the pixels.
///
/// All-zero frames have no face, a leading 255 means several faces and a
/// leading 254 is an inference failure.
pub struct PixelExtractor {
    loaded: AtomicBool,
    fail_load: bool,
    /// When set, extraction signals `entered` and then waits for `gate`.
    pub gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl PixelExtractor {
    pub fn new() -> Self {
        Self {
            loaded: AtomicBool::new(false),
            fail_load: false,
            gate: None,
        }
    }

    pub fn loaded() -> Self {
        let extractor = Self::new();
        extractor.loaded.store(true, Ordering::SeqCst);
        extractor
    }

    pub fn broken() -> Self {
        Self {
            fail_load: true,
            ..Self::new()
        }
    }

    pub fn gated(entered: Arc<Notify>, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some((entered, gate)),
            ..Self::new()
        }
    }
}

#[async_trait]
impl EmbeddingExtractor for PixelExtractor {
    async fn load(&self) -> Result<(), ExtractionError> {
        if self.fail_load {
            return Err(ExtractionError::ModelUnavailable("weights missing".into()));
        }
        tokio::task::yield_now().await;
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn extract(&self, frame: &Frame) -> Result<Descriptor, ExtractionError> {
        if !self.is_loaded() {
            return Err(ExtractionError::ModelNotLoaded);
        }
        if let Some((entered, gate)) = &self.gate {
            entered.notify_one();
            gate.notified().await;
        }
        if frame.data.iter().all(|&p| p == 0) {
            return Err(ExtractionError::NoFaceDetected);
        }
        match frame.data.first() {
            Some(255) => return Err(ExtractionError::MultipleFacesDetected),
            Some(254) => return Err(ExtractionError::Upstream("inference timed out".into())),
            _ => {}
        }
        let mut pixels = [0u8; DIM];
        for (dst, src) in pixels.iter_mut().zip(frame.data.iter()) {
            *dst = *src;
        }
        Ok(descriptor_of(pixels))
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

/// Capture source whose "scene" can be swapped and whose reads can stall.
pub struct ScriptedSource {
    scene: Arc<Mutex<Frame>>,
    lease: DeviceLease,
    pub fail_open: AtomicBool,
    pub stall: AtomicBool,
    pub read_started: Arc<Notify>,
}

impl ScriptedSource {
    pub fn new(frame: Frame) -> Self {
        Self {
            scene: Arc::new(Mutex::new(frame)),
            lease: DeviceLease::new(),
            fail_open: AtomicBool::new(false),
            stall: AtomicBool::new(false),
            read_started: Arc::new(Notify::new()),
        }
    }

    pub fn show(&self, frame: Frame) {
        *self.scene.lock().unwrap() = frame;
    }

    pub fn is_open(&self) -> bool {
        self.lease.is_held()
    }
}

#[async_trait]
impl CaptureSource for ScriptedSource {
    async fn open(&self) -> Result<Arc<dyn CaptureStream>, CaptureError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied("/dev/video-test".into()));
        }
        let guard = self.lease.acquire()?;
        Ok(Arc::new(ScriptedStream {
            scene: Arc::clone(&self.scene),
            stall: self.stall.load(Ordering::SeqCst),
            read_started: Arc::clone(&self.read_started),
            guard,
            closed: Notify::new(),
        }))
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

struct ScriptedStream {
    scene: Arc<Mutex<Frame>>,
    stall: bool,
    read_started: Arc<Notify>,
    guard: LeaseGuard,
    closed: Notify,
}

#[async_trait]
impl CaptureStream for ScriptedStream {
    async fn read_frame(&self) -> Result<Frame, CaptureError> {
        let closed = self.closed.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if self.guard.is_released() {
            return Err(CaptureError::Closed);
        }
        if self.stall {
            self.read_started.notify_one();
            closed.await;
            return Err(CaptureError::Closed);
        }
        Ok(self.scene.lock().unwrap().clone())
    }

    fn close(&self) {
        self.guard.release();
        self.closed.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.guard.is_released()
    }
}
