//! In-process media devices.
//!
//! Each device is a cheap clonable handle around shared state, so a test (or
//! an embedding application) can keep one clone to drive or inspect the
//! device while the session owns another.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    AudioInputDevice, AudioOutputDevice, DeviceError, DeviceResult, FrameSource,
    INPUT_CHANNEL_CAPACITY, MediaBackend, MediaDevices, PlaybackHandle, SampleReceiver,
    VideoFrame,
};

// =============================================================================
// Microphone
// =============================================================================

/// Microphone fed by [`MemoryMicrophone::push`].
#[derive(Clone)]
pub struct MemoryMicrophone {
    inner: Arc<MicrophoneInner>,
}

struct MicrophoneInner {
    sample_rate: u32,
    sender: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    open_count: AtomicUsize,
    release_count: AtomicUsize,
}

impl MemoryMicrophone {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(MicrophoneInner {
                sample_rate,
                sender: Mutex::new(None),
                open_count: AtomicUsize::new(0),
                release_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Deliver samples as if they had just been captured.
    ///
    /// Returns `false` when the device is closed or the reader is behind.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        match self.inner.sender.lock().as_ref() {
            Some(tx) => tx.try_send(samples).is_ok(),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.sender.lock().is_some()
    }

    /// End the sample stream as a disconnected device would. Not counted as
    /// a release.
    pub fn unplug(&self) {
        self.inner.sender.lock().take();
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.inner.open_count.load(Ordering::SeqCst)
    }

    /// Number of times an open device was actually released.
    pub fn release_count(&self) -> usize {
        self.inner.release_count.load(Ordering::SeqCst)
    }
}

impl AudioInputDevice for MemoryMicrophone {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    fn open(&self) -> DeviceResult<SampleReceiver> {
        let mut sender = self.inner.sender.lock();
        if sender.is_some() {
            return Err(DeviceError::Busy("memory microphone".to_string()));
        }
        let (tx, rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        *sender = Some(tx);
        self.inner.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    fn close(&self) {
        if self.inner.sender.lock().take().is_some() {
            self.inner.release_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// Speaker
// =============================================================================

/// A buffer as seen by [`ManualClockSpeaker`].
#[derive(Debug, Clone)]
pub struct ScheduledRecord {
    pub handle: PlaybackHandle,
    pub start: f64,
    pub samples: Vec<i16>,
    /// Device time at which the buffer was stopped, if it was.
    pub stopped_at: Option<f64>,
}

impl ScheduledRecord {
    /// Whether any part of the buffer was (or will be) heard.
    pub fn is_audible(&self) -> bool {
        match self.stopped_at {
            Some(stop) => stop > self.start,
            None => true,
        }
    }
}

/// Speaker whose clock only moves when told to.
#[derive(Clone)]
pub struct ManualClockSpeaker {
    inner: Arc<SpeakerInner>,
}

struct SpeakerInner {
    sample_rate: u32,
    now: Mutex<f64>,
    next_handle: AtomicU64,
    buffers: Mutex<Vec<ScheduledRecord>>,
    closed: AtomicBool,
    release_count: AtomicUsize,
    schedule_error: Mutex<Option<DeviceError>>,
}

impl ManualClockSpeaker {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(SpeakerInner {
                sample_rate,
                now: Mutex::new(0.0),
                next_handle: AtomicU64::new(1),
                buffers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                release_count: AtomicUsize::new(0),
                schedule_error: Mutex::new(None),
            }),
        }
    }

    /// Move the device clock forward.
    pub fn advance(&self, seconds: f64) {
        *self.inner.now.lock() += seconds;
    }

    pub fn set_time(&self, seconds: f64) {
        *self.inner.now.lock() = seconds;
    }

    /// Every buffer ever scheduled, in scheduling order.
    pub fn scheduled(&self) -> Vec<ScheduledRecord> {
        self.inner.buffers.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Make every later `schedule` fail with `error`.
    pub fn fail_schedules(&self, error: DeviceError) {
        *self.inner.schedule_error.lock() = Some(error);
    }

    pub fn release_count(&self) -> usize {
        self.inner.release_count.load(Ordering::SeqCst)
    }
}

impl AudioOutputDevice for ManualClockSpeaker {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    fn current_time(&self) -> f64 {
        *self.inner.now.lock()
    }

    fn schedule(&self, samples: &[i16], start_at: f64) -> DeviceResult<PlaybackHandle> {
        if self.is_closed() {
            return Err(DeviceError::Closed);
        }
        if let Some(error) = self.inner.schedule_error.lock().clone() {
            return Err(error);
        }
        let handle = PlaybackHandle(self.inner.next_handle.fetch_add(1, Ordering::SeqCst));
        self.inner.buffers.lock().push(ScheduledRecord {
            handle,
            start: start_at,
            samples: samples.to_vec(),
            stopped_at: None,
        });
        Ok(handle)
    }

    fn stop(&self, handle: PlaybackHandle) {
        let now = self.current_time();
        if let Some(record) = self
            .inner
            .buffers
            .lock()
            .iter_mut()
            .find(|r| r.handle == handle)
        {
            record.stopped_at.get_or_insert(now);
        }
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.release_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// Camera
// =============================================================================

/// Camera showing whatever frame was last set.
#[derive(Clone, Default)]
pub struct StaticFrameSource {
    inner: Arc<CameraInner>,
}

#[derive(Default)]
struct CameraInner {
    frame: Mutex<Option<VideoFrame>>,
    closed: AtomicBool,
    release_count: AtomicUsize,
}

impl StaticFrameSource {
    /// A camera that has not produced a frame yet.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A camera showing a single solid color.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let camera = Self::empty();
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        camera.set_frame(VideoFrame {
            width,
            height,
            rgb: pixels,
        });
        camera
    }

    pub fn set_frame(&self, frame: VideoFrame) {
        *self.inner.frame.lock() = Some(frame);
    }

    pub fn clear(&self) {
        *self.inner.frame.lock() = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.inner.release_count.load(Ordering::SeqCst)
    }
}

impl FrameSource for StaticFrameSource {
    fn current_frame(&self) -> Option<VideoFrame> {
        if self.is_closed() {
            return None;
        }
        self.inner.frame.lock().clone()
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.release_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Backend handing out the in-memory devices above.
pub struct MemoryBackend {
    pub microphone: MemoryMicrophone,
    pub speaker: ManualClockSpeaker,
    pub camera: StaticFrameSource,
    denial: Mutex<Option<DeviceError>>,
    acquisitions: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(
        microphone: MemoryMicrophone,
        speaker: ManualClockSpeaker,
        camera: StaticFrameSource,
    ) -> Self {
        Self {
            microphone,
            speaker,
            camera,
            denial: Mutex::new(None),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Refuse the next acquisitions with `error`.
    pub fn deny_with(&self, error: DeviceError) {
        *self.denial.lock() = Some(error);
    }

    /// Number of successful acquisitions.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(
            MemoryMicrophone::new(crate::core::codec::INPUT_SAMPLE_RATE),
            ManualClockSpeaker::new(crate::core::codec::OUTPUT_SAMPLE_RATE),
            StaticFrameSource::solid(8, 8, [200, 120, 90]),
        )
    }
}

#[async_trait]
impl MediaBackend for MemoryBackend {
    async fn acquire(&self) -> DeviceResult<MediaDevices> {
        if let Some(err) = self.denial.lock().clone() {
            return Err(err);
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(MediaDevices {
            microphone: Arc::new(self.microphone.clone()),
            speaker: Arc::new(self.speaker.clone()),
            camera: Arc::new(self.camera.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_microphone_is_exclusive() {
        let mic = MemoryMicrophone::new(16000);
        let mut rx = mic.open().unwrap();
        assert!(matches!(mic.open(), Err(DeviceError::Busy(_))));

        assert!(mic.push(vec![0.25; 4]));
        assert_eq!(rx.recv().await.unwrap(), vec![0.25; 4]);

        mic.close();
        mic.close();
        assert_eq!(mic.release_count(), 1);
        assert!(!mic.push(vec![0.0]));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_speaker_stop_marks_time() {
        let speaker = ManualClockSpeaker::new(24000);
        let handle = speaker.schedule(&[0; 240], 0.5).unwrap();
        speaker.advance(0.2);
        speaker.stop(handle);

        let records = speaker.scheduled();
        assert_eq!(records[0].stopped_at, Some(0.2));
        assert!(!records[0].is_audible());
    }

    #[tokio::test]
    async fn test_unplugged_microphone_ends_stream() {
        let mic = MemoryMicrophone::new(16000);
        let mut rx = mic.open().unwrap();
        mic.unplug();

        assert!(rx.recv().await.is_none());
        assert!(!mic.is_open());
        assert_eq!(mic.release_count(), 0);
    }

    #[test]
    fn test_speaker_schedule_failure() {
        let speaker = ManualClockSpeaker::new(24000);
        speaker.fail_schedules(DeviceError::Unavailable("speaker unplugged".to_string()));
        assert_eq!(
            speaker.schedule(&[0; 10], 0.0),
            Err(DeviceError::Unavailable("speaker unplugged".to_string()))
        );
        assert!(speaker.scheduled().is_empty());
    }

    #[test]
    fn test_speaker_rejects_after_close() {
        let speaker = ManualClockSpeaker::new(24000);
        speaker.close();
        assert_eq!(speaker.schedule(&[0; 10], 0.0), Err(DeviceError::Closed));
    }

    #[test]
    fn test_camera_hides_frames_after_close() {
        let camera = StaticFrameSource::solid(2, 2, [1, 2, 3]);
        assert_eq!(camera.current_frame().unwrap().rgb.len(), 12);
        camera.close();
        assert!(camera.current_frame().is_none());
    }

    #[tokio::test]
    async fn test_backend_denial_opens_nothing() {
        let backend = MemoryBackend::default();
        backend.deny_with(DeviceError::PermissionDenied("blocked".to_string()));
        assert!(backend.acquire().await.is_err());
        assert_eq!(backend.acquisitions(), 0);
        assert_eq!(backend.microphone.open_count(), 0);
    }
}
