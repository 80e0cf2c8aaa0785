//! Microphone capture.
//!
//! [`AudioCaptureEngine`] owns an [`AudioInputDevice`] while it runs and turns
//! whatever the device delivers (f32, any rate) into fixed-size 16 kHz mono
//! i16 [`AudioChunk`]s. Chunks go to the `start` callback in production order
//! and are mirrored onto a broadcast [`CaptureTap`] so other readers (evidence
//! recording) share the same capture path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{INPUT_SAMPLE_RATE, StreamResampler, f32_to_i16};
use crate::devices::{AudioInputDevice, DeviceError, DeviceResult};

/// Buffered chunks per tap subscriber before it starts lagging.
const TAP_CAPACITY: usize = 512;

// =============================================================================
// Audio chunk
// =============================================================================

/// Immutable slice of mono PCM audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub samples: Arc<[i16]>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Callback invoked once per captured chunk.
pub type ChunkCallback =
    Arc<dyn Fn(AudioChunk) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Samples per emitted chunk at 16 kHz.
    /// Default: 1024 (64ms)
    pub chunk_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_samples: 1024,
        }
    }
}

// =============================================================================
// Tap
// =============================================================================

/// Read-only view of the chunks an engine produces.
#[derive(Clone)]
pub struct CaptureTap {
    sender: broadcast::Sender<AudioChunk>,
}

impl CaptureTap {
    /// Receive every chunk produced from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AudioChunk> {
        self.sender.subscribe()
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct AudioCaptureEngine {
    device: Arc<dyn AudioInputDevice>,
    config: CaptureConfig,
    tap: broadcast::Sender<AudioChunk>,
    task: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    /// Cancelled when the device stops delivering while capture is running
    input_lost: CancellationToken,
}

impl AudioCaptureEngine {
    pub fn new(device: Arc<dyn AudioInputDevice>, config: CaptureConfig) -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            device,
            config,
            tap,
            task: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            input_lost: CancellationToken::new(),
        }
    }

    pub fn tap(&self) -> CaptureTap {
        CaptureTap {
            sender: self.tap.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fires if the microphone stream ends without `stop` being called.
    pub fn input_lost(&self) -> CancellationToken {
        self.input_lost.clone()
    }

    /// Open the microphone and start delivering chunks to `on_chunk`.
    ///
    /// Device failures are returned as-is so the session can report them.
    pub fn start(&self, on_chunk: ChunkCallback) -> DeviceResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DeviceError::Busy("capture already running".to_string()));
        }

        let mut input = match self.device.open() {
            Ok(rx) => rx,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let device_rate = self.device.sample_rate();
        let chunk_samples = self.config.chunk_samples.max(1);
        let tap = self.tap.clone();
        let running = self.running.clone();
        let input_lost = self.input_lost.clone();

        info!(
            device_rate,
            chunk_samples, "Audio capture started"
        );

        let handle = tokio::spawn(async move {
            let mut resampler = StreamResampler::new(device_rate, INPUT_SAMPLE_RATE);
            let mut pending: Vec<i16> = Vec::with_capacity(chunk_samples * 2);
            while let Some(block) = input.recv().await {
                let resampled = resampler.process(&block);
                pending.extend(f32_to_i16(&resampled));

                while pending.len() >= chunk_samples {
                    let rest = pending.split_off(chunk_samples);
                    let chunk = AudioChunk::new(std::mem::replace(&mut pending, rest), INPUT_SAMPLE_RATE);
                    // No subscribers is the normal case.
                    let _ = tap.send(chunk.clone());
                    on_chunk(chunk).await;
                }
            }
            if running.load(Ordering::SeqCst) {
                warn!("Microphone stream ended while capturing");
                input_lost.cancel();
            } else {
                debug!("Audio capture input ended");
            }
        });

        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Stop capturing and release the microphone. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.device.close();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        info!("Audio capture stopped");
    }
}

impl Drop for AudioCaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
