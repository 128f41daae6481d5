//! V4L2 camera capture via the `v4l` crate.
//!
//! The device is owned by a dedicated capture thread for the lifetime of an
//! open stream; frame requests travel over a channel and come back on a
//! oneshot, so async callers never block on a dequeue. A reopen waits for
//! the previous thread to close the node before opening it again.

use crate::capture::{
    CaptureError, CaptureSource, CaptureStream, DeviceHandoff, DeviceLease, LeaseGuard,
};
use crate::frame::{self, Frame, PixelFormat};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream as _;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Pixel format negotiated with the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel, native IR camera output).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel, common IR camera format).
    Y16,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Longest a reopen waits for the previous capture thread to let go of the device.
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(3);

/// A V4L2 camera exposed as a [`CaptureSource`].
pub struct Camera {
    device_path: String,
    warmup_frames: usize,
    lease: DeviceLease,
    handoff: DeviceHandoff,
}

impl Camera {
    /// Describe a camera by device path (e.g., "/dev/video0"). Nothing is opened yet.
    pub fn new(device_path: &str, warmup_frames: usize) -> Self {
        Self {
            device_path: device_path.to_string(),
            warmup_frames,
            lease: DeviceLease::new(),
            handoff: DeviceHandoff::new(),
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

type FrameReply = oneshot::Sender<Result<Frame, CaptureError>>;

#[async_trait]
impl CaptureSource for Camera {
    async fn open(&self) -> Result<Arc<dyn CaptureStream>, CaptureError> {
        let guard = self.lease.acquire()?;
        // A released stream's thread may still be inside a dequeue with the node open.
        self.handoff.wait_previous(HANDOFF_TIMEOUT).await?;
        let owner = self.handoff.hand_over();

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CaptureError>>();
        let (tx, mut rx) = mpsc::channel::<FrameReply>(1);
        let device_path = self.device_path.clone();
        let warmup_frames = self.warmup_frames;

        std::thread::Builder::new()
            .name("presence-camera".into())
            .spawn(move || {
                // dropped on every exit path, after the device below is closed
                let _owner = owner;
                let mut device = match CameraDevice::open(&device_path) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Discard warmup frames for camera AGC/AE stabilization
                if warmup_frames > 0 {
                    tracing::info!(count = warmup_frames, "discarding warmup frames");
                    for _ in 0..warmup_frames {
                        let _ = device.capture_frame();
                    }
                }
                let _ = ready_tx.send(Ok(()));

                tracing::debug!(device = %device_path, "capture thread started");
                while let Some(reply) = rx.blocking_recv() {
                    let _ = reply.send(device.capture_frame());
                }
                tracing::debug!(device = %device_path, "capture thread exiting");
            })
            .map_err(|e| CaptureError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| CaptureError::CaptureFailed("capture thread exited during open".into()))??;

        Ok(Arc::new(CameraStream {
            requests: Mutex::new(Some(tx)),
            guard,
            closed: Notify::new(),
        }))
    }

    fn describe(&self) -> String {
        format!("v4l2:{}", self.device_path)
    }
}

/// Open stream over a camera's capture thread.
///
/// Closing drops the request channel and frees the lease at once; the
/// thread finishes any dequeue in progress, then exits and closes the node.
struct CameraStream {
    requests: Mutex<Option<mpsc::Sender<FrameReply>>>,
    guard: LeaseGuard,
    closed: Notify,
}

#[async_trait]
impl CaptureStream for CameraStream {
    async fn read_frame(&self) -> Result<Frame, CaptureError> {
        let closed = self.closed.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();

        let tx = self
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(CaptureError::Closed)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(reply_tx).await.map_err(|_| CaptureError::Closed)?;

        tokio::select! {
            _ = &mut closed => Err(CaptureError::Closed),
            reply = reply_rx => reply.map_err(|_| CaptureError::Closed)?,
        }
    }

    fn close(&self) {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.guard.release();
        self.closed.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.guard.is_released()
    }
}

/// The opened V4L2 device, owned by the capture thread.
struct CameraDevice {
    device: Device,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    format: SensorFormat,
    sequence: u32,
}

impl CameraDevice {
    fn open(device_path: &str) -> Result<Self, CaptureError> {
        if !Path::new(device_path).exists() {
            return Err(CaptureError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CaptureError::PermissionDenied(device_path.to_string())
            }
            _ if e.to_string().contains("busy") || e.to_string().contains("EBUSY") => {
                CaptureError::DeviceBusy
            }
            _ => CaptureError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CaptureError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::StreamingNotSupported);
        }

        // Ask for YUYV at 640x480; IR cameras commonly negotiate GREY or Y16 instead.
        let mut fmt = device.format().map_err(|e| {
            CaptureError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = 640;
        fmt.height = 480;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CaptureError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let format = if fourcc == FourCC::new(b"GREY") {
            SensorFormat::Grey
        } else if fourcc == FourCC::new(b"YUYV") {
            SensorFormat::Yuyv
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            SensorFormat::Y16
        } else {
            return Err(CaptureError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            stream: None,
            width: negotiated.width,
            height: negotiated.height,
            format,
            sequence: 0,
        })
    }

    /// Dequeue one buffer and convert it to a grayscale frame.
    fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
                .map_err(|e| {
                    CaptureError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?;
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(CaptureError::Closed);
        };

        let (buf, meta) = stream
            .next()
            .map_err(|e| CaptureError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let gray = match self.format {
            SensorFormat::Grey => {
                let pixels = (self.width * self.height) as usize;
                if buf.len() < pixels {
                    return Err(CaptureError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                buf[..pixels].to_vec()
            }
            SensorFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height)?,
            SensorFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height)?,
        };

        self.sequence = meta.sequence;
        let frame = Frame::from_raw(gray, self.width, self.height, PixelFormat::Gray8, self.sequence)?;
        if frame.is_dark {
            tracing::debug!(seq = frame.sequence, "dark frame captured");
        }
        Ok(frame)
    }
}
