//! File-backed media devices for headless runs.
//!
//! - [`WavFileMicrophone`] replays a WAV file in real time, then keeps
//!   delivering silence so the conversation can continue
//! - [`WavFileSpeaker`] renders everything that was actually heard into a WAV
//!   file when it is closed
//! - [`ImageFileCamera`] serves a still image as the live frame

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    AudioInputDevice, AudioOutputDevice, DeviceError, DeviceResult, FrameSource,
    INPUT_CHANNEL_CAPACITY, MediaBackend, MediaDevices, PlaybackHandle, SampleReceiver,
    VideoFrame,
};

/// Length of each block delivered by the file microphone.
const MIC_BLOCK: Duration = Duration::from_millis(20);

fn io_err(path: &Path, err: impl std::fmt::Display) -> DeviceError {
    DeviceError::Io(format!("{}: {}", path.display(), err))
}

// =============================================================================
// Microphone
// =============================================================================

/// Microphone replaying a WAV file at its own pace.
pub struct WavFileMicrophone {
    samples: Arc<[f32]>,
    sample_rate: u32,
    cancel: Mutex<Option<CancellationToken>>,
}

impl WavFileMicrophone {
    /// Load a WAV file, downmixing to mono.
    pub fn load(path: impl AsRef<Path>) -> DeviceResult<Self> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path).map_err(|e| io_err(path, e))?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| io_err(path, e))?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| io_err(path, e))?
            }
        };

        let mono: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        info!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            seconds = mono.len() as f64 / spec.sample_rate as f64,
            "Loaded microphone input"
        );

        Ok(Self {
            samples: mono.into(),
            sample_rate: spec.sample_rate,
            cancel: Mutex::new(None),
        })
    }
}

impl AudioInputDevice for WavFileMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn open(&self) -> DeviceResult<SampleReceiver> {
        let mut cancel = self.cancel.lock();
        if cancel.is_some() {
            return Err(DeviceError::Busy("file microphone".to_string()));
        }

        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let samples = self.samples.clone();
        let block = (self.sample_rate as u128 * MIC_BLOCK.as_millis() / 1000).max(1) as usize;
        let task_token = token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MIC_BLOCK);
            let mut offset = 0usize;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut out = vec![0.0f32; block];
                        if offset < samples.len() {
                            let end = (offset + block).min(samples.len());
                            out[..end - offset].copy_from_slice(&samples[offset..end]);
                            offset = end;
                            if offset == samples.len() {
                                debug!("Microphone file exhausted, continuing with silence");
                            }
                        }
                        if tx.send(out).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        *cancel = Some(token);
        Ok(rx)
    }

    fn close(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }
}

// =============================================================================
// Speaker
// =============================================================================

struct RenderedBuffer {
    handle: PlaybackHandle,
    start: f64,
    samples: Vec<i16>,
    stopped_at: Option<f64>,
}

/// Speaker that writes its timeline to a WAV file on close.
pub struct WavFileSpeaker {
    path: PathBuf,
    sample_rate: u32,
    epoch: Instant,
    next_handle: AtomicU64,
    buffers: Mutex<Vec<RenderedBuffer>>,
    closed: AtomicBool,
}

impl WavFileSpeaker {
    pub fn new(path: impl Into<PathBuf>, sample_rate: u32) -> Self {
        Self {
            path: path.into(),
            sample_rate,
            epoch: Instant::now(),
            next_handle: AtomicU64::new(1),
            buffers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Mix every buffer into one track, cutting stopped buffers where they
    /// were stopped.
    fn render(&self) -> Vec<i16> {
        let rate = self.sample_rate as f64;
        let buffers = self.buffers.lock();
        let mut track: Vec<i32> = Vec::new();

        for buffer in buffers.iter() {
            let offset = (buffer.start * rate).round().max(0.0) as usize;
            let audible = match buffer.stopped_at {
                Some(stop) if stop <= buffer.start => 0,
                Some(stop) => (((stop - buffer.start) * rate) as usize).min(buffer.samples.len()),
                None => buffer.samples.len(),
            };
            if audible == 0 {
                continue;
            }
            if track.len() < offset + audible {
                track.resize(offset + audible, 0);
            }
            for (i, sample) in buffer.samples[..audible].iter().enumerate() {
                track[offset + i] += *sample as i32;
            }
        }

        track
            .into_iter()
            .map(|s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
            .collect()
    }

    fn write(&self) -> DeviceResult<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let track = self.render();
        let mut writer = hound::WavWriter::create(&self.path, spec).map_err(|e| io_err(&self.path, e))?;
        for sample in &track {
            writer.write_sample(*sample).map_err(|e| io_err(&self.path, e))?;
        }
        writer.finalize().map_err(|e| io_err(&self.path, e))?;
        info!(
            path = %self.path.display(),
            seconds = track.len() as f64 / self.sample_rate as f64,
            "Wrote speaker output"
        );
        Ok(())
    }
}

impl AudioOutputDevice for WavFileSpeaker {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn schedule(&self, samples: &[i16], start_at: f64) -> DeviceResult<PlaybackHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeviceError::Closed);
        }
        let handle = PlaybackHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.buffers.lock().push(RenderedBuffer {
            handle,
            start: start_at,
            samples: samples.to_vec(),
            stopped_at: None,
        });
        Ok(handle)
    }

    fn stop(&self, handle: PlaybackHandle) {
        let now = self.current_time();
        if let Some(buffer) = self.buffers.lock().iter_mut().find(|b| b.handle == handle) {
            buffer.stopped_at.get_or_insert(now);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.write() {
            warn!("Failed to write speaker output: {}", e);
        }
    }
}

// =============================================================================
// Camera
// =============================================================================

/// Camera serving one image file.
pub struct ImageFileCamera {
    frame: Mutex<Option<VideoFrame>>,
    closed: AtomicBool,
}

impl ImageFileCamera {
    pub fn load(path: impl AsRef<Path>) -> DeviceResult<Self> {
        let path = path.as_ref();
        let rgb = image::open(path).map_err(|e| io_err(path, e))?.to_rgb8();
        let (width, height) = rgb.dimensions();
        let frame = VideoFrame::new(width, height, rgb.into_raw())?;
        debug!(path = %path.display(), width, height, "Loaded camera frame");
        Ok(Self {
            frame: Mutex::new(Some(frame)),
            closed: AtomicBool::new(false),
        })
    }
}

impl FrameSource for ImageFileCamera {
    fn current_frame(&self) -> Option<VideoFrame> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.frame.lock().clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.frame.lock().take();
        }
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Backend wiring the file devices together.
#[derive(Debug, Clone)]
pub struct FileBackend {
    pub microphone: PathBuf,
    pub camera: PathBuf,
    pub speaker: PathBuf,
    pub speaker_rate: u32,
}

#[async_trait]
impl MediaBackend for FileBackend {
    async fn acquire(&self) -> DeviceResult<MediaDevices> {
        for input in [&self.microphone, &self.camera] {
            if !input.exists() {
                return Err(DeviceError::Unavailable(format!(
                    "{} does not exist",
                    input.display()
                )));
            }
        }

        let microphone = WavFileMicrophone::load(&self.microphone)?;
        let camera = ImageFileCamera::load(&self.camera)?;
        let speaker = WavFileSpeaker::new(&self.speaker, self.speaker_rate);

        Ok(MediaDevices {
            microphone: Arc::new(microphone),
            speaker: Arc::new(speaker),
            camera: Arc::new(camera),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_wav(path: &Path, rate: u32, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_microphone_replays_then_pads_silence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.wav");
        write_wav(&path, 1000, &[16384; 30]);

        let mic = WavFileMicrophone::load(&path).unwrap();
        let mut rx = mic.open().unwrap();
        assert!(matches!(mic.open(), Err(DeviceError::Busy(_))));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 20);
        assert!((first[0] - 0.5).abs() < 1e-3);

        let second = rx.recv().await.unwrap();
        assert!((second[9] - 0.5).abs() < 1e-3);
        assert_eq!(second[10], 0.0);

        mic.close();
        mic.close();
    }

    #[test]
    fn test_speaker_renders_cut_buffers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.wav");
        let speaker = WavFileSpeaker::new(&path, 100);

        speaker.schedule(&[1000; 50], 0.0).unwrap();
        let late = speaker.schedule(&[2000; 50], 100.0).unwrap();
        speaker.stop(late);
        speaker.close();
        speaker.close();

        let reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 50);
        assert!(samples.iter().all(|s| *s == 1000));
        assert_eq!(speaker.schedule(&[0; 1], 0.0), Err(DeviceError::Closed));
    }

    #[test]
    fn test_camera_loads_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frame.png");
        image::RgbImage::from_pixel(4, 3, image::Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();

        let camera = ImageFileCamera::load(&path).unwrap();
        let frame = camera.current_frame().unwrap();
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(&frame.rgb[..3], &[10, 20, 30]);

        camera.close();
        assert!(camera.current_frame().is_none());
    }

    #[tokio::test]
    async fn test_backend_reports_missing_inputs() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend {
            microphone: dir.path().join("missing.wav"),
            camera: dir.path().join("missing.png"),
            speaker: dir.path().join("out.wav"),
            speaker_rate: 24000,
        };
        assert!(matches!(
            backend.acquire().await,
            Err(DeviceError::Unavailable(_))
        ));
    }
}
