use anyhow::Result;
use thiserror::Error;

/// Camera acquisition is an external capability: given constraints it
/// yields a live pixel source or fails with a distinguishable error.
#[derive(Debug, Clone, Error)]
pub enum CameraError {
    #[error("Camera access denied. Please allow camera permissions.")]
    PermissionDenied,
    #[error("No camera found on this device.")]
    NotFound,
    #[error("Failed to access camera: {0}")]
    Other(String),
}

/// Requested capture geometry; ideal values, not guaranteed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraConstraints {
    pub rear_facing: bool,
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self {
            rear_facing: true,
            ideal_width: 1920,
            ideal_height: 1080,
        }
    }
}

/// One frozen frame: encoded image bytes plus the logical dimensions the
/// source reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A live camera stream. Stopping it releases the hardware; leaving
/// tracks open leaks the device and keeps the permission indicator on.
#[async_trait::async_trait]
pub trait CameraStream: Send + Sync {
    /// Freeze the current frame into an image buffer.
    async fn capture_frame(&self) -> Result<Frame>;
    /// Stop all media tracks. Must be safe to call more than once.
    async fn stop(&self);
    /// Whether the tracks are still live.
    async fn is_live(&self) -> bool;
}

#[async_trait::async_trait]
pub trait CameraSource: Send + Sync {
    async fn acquire(
        &self,
        constraints: CameraConstraints,
    ) -> Result<Box<dyn CameraStream>, CameraError>;
}

/// Camera double that serves one fixed frame. Used by the CLI (a file on
/// disk stands in for the shutter press) and by tests.
pub struct StillCamera {
    frame: Frame,
}

impl StillCamera {
    pub fn new(frame: Frame) -> Self {
        Self { frame }
    }

    pub fn from_bytes(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            frame: Frame { width, height, data },
        }
    }
}

#[async_trait::async_trait]
impl CameraSource for StillCamera {
    async fn acquire(
        &self,
        constraints: CameraConstraints,
    ) -> Result<Box<dyn CameraStream>, CameraError> {
        log::debug!(
            "acquiring still camera (requested {}x{}, rear: {})",
            constraints.ideal_width,
            constraints.ideal_height,
            constraints.rear_facing
        );
        Ok(Box::new(StillStream {
            frame: self.frame.clone(),
            live: std::sync::atomic::AtomicBool::new(true),
        }))
    }
}

struct StillStream {
    frame: Frame,
    live: std::sync::atomic::AtomicBool,
}

#[async_trait::async_trait]
impl CameraStream for StillStream {
    async fn capture_frame(&self) -> Result<Frame> {
        if !self.live.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("camera stream already stopped");
        }
        Ok(self.frame.clone())
    }

    async fn stop(&self) {
        self.live.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    async fn is_live(&self) -> bool {
        self.live.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Camera double that always fails, for exercising the error surface.
pub struct DeniedCamera {
    pub error: CameraError,
}

#[async_trait::async_trait]
impl CameraSource for DeniedCamera {
    async fn acquire(
        &self,
        _constraints: CameraConstraints,
    ) -> Result<Box<dyn CameraStream>, CameraError> {
        Err(self.error.clone())
    }
}
