//! Local media device abstractions.
//!
//! The session never talks to hardware directly. It goes through these
//! traits so that the same orchestration runs against real devices, files,
//! or in-memory test doubles.
//!
//! # Ownership
//!
//! A [`MediaBackend`] grants access to camera and microphone together (the
//! permission prompt) and hands back a [`MediaDevices`] bundle. The bundle is
//! owned by exactly one session; every handle in it must be released through
//! its `close` method, which is idempotent.
//!
//! # Backends
//!
//! - [`memory`] - controllable in-process devices, used by tests and embedders
//! - [`file`] - WAV/image file devices for headless runs

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod file;
pub mod memory;

pub use file::{FileBackend, ImageFileCamera, WavFileMicrophone, WavFileSpeaker};
pub use memory::{ManualClockSpeaker, MemoryBackend, MemoryMicrophone, StaticFrameSource};

/// Capacity of the sample channel between an input device and its reader.
pub const INPUT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised by local media devices.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The user (or platform) refused camera/microphone access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The device does not exist or could not be opened
    #[error("Device unavailable: {0}")]
    Unavailable(String),

    /// The device is already held by another owner
    #[error("Device busy: {0}")]
    Busy(String),

    /// The device was used after being released
    #[error("Device closed")]
    Closed,

    /// Underlying I/O or encoding failure
    #[error("Device I/O error: {0}")]
    Io(String),
}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

// =============================================================================
// Media types
// =============================================================================

/// A single decoded video frame in packed 8-bit RGB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Packed RGB bytes, `width * height * 3` long
    pub rgb: Vec<u8>,
}

impl VideoFrame {
    /// Build a frame, checking the buffer length against the dimensions.
    pub fn new(width: u32, height: u32, rgb: Vec<u8>) -> DeviceResult<Self> {
        let expected = width as usize * height as usize * 3;
        if rgb.len() != expected {
            return Err(DeviceError::Io(format!(
                "frame buffer is {} bytes, expected {} for {}x{}",
                rgb.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self { width, height, rgb })
    }
}

/// Opaque handle to a buffer scheduled on an output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackHandle(pub u64);

/// Receiving end of a microphone stream: normalized mono f32 samples at the
/// device's native rate.
pub type SampleReceiver = mpsc::Receiver<Vec<f32>>;

// =============================================================================
// Device traits
// =============================================================================

/// Microphone input.
pub trait AudioInputDevice: Send + Sync {
    /// Native sample rate of delivered samples.
    fn sample_rate(&self) -> u32;

    /// Start delivering samples.
    ///
    /// Fails with [`DeviceError::Busy`] if the device is already open.
    fn open(&self) -> DeviceResult<SampleReceiver>;

    /// Stop delivering samples and release the device. Idempotent.
    fn close(&self);
}

/// Speaker output with a monotonic device clock.
///
/// Modeled on scheduled buffer sources: each buffer is started at an absolute
/// device time and can be stopped individually.
pub trait AudioOutputDevice: Send + Sync {
    /// Native sample rate of the output.
    fn sample_rate(&self) -> u32;

    /// Current device clock, in seconds.
    fn current_time(&self) -> f64;

    /// Schedule `samples` to begin playing at device time `start_at`.
    fn schedule(&self, samples: &[i16], start_at: f64) -> DeviceResult<PlaybackHandle>;

    /// Stop a scheduled or playing buffer. Unknown handles are ignored.
    fn stop(&self, handle: PlaybackHandle);

    /// Release the device. Idempotent.
    fn close(&self);
}

/// Live video source.
pub trait FrameSource: Send + Sync {
    /// The most recent frame, or `None` when the camera is not producing yet.
    fn current_frame(&self) -> Option<VideoFrame>;

    /// Release the camera. Idempotent.
    fn close(&self);
}

/// Devices granted for one session.
pub struct MediaDevices {
    pub microphone: Arc<dyn AudioInputDevice>,
    pub speaker: Arc<dyn AudioOutputDevice>,
    pub camera: Arc<dyn FrameSource>,
}

impl MediaDevices {
    /// Release every handle in the bundle.
    pub fn close_all(&self) {
        self.microphone.close();
        self.speaker.close();
        self.camera.close();
    }
}

impl std::fmt::Debug for MediaDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaDevices")
            .field("microphone_rate", &self.microphone.sample_rate())
            .field("speaker_rate", &self.speaker.sample_rate())
            .finish()
    }
}

/// Grants camera + microphone access.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Request access and open the devices.
    ///
    /// Nothing is left open when this fails.
    async fn acquire(&self) -> DeviceResult<MediaDevices>;
}
