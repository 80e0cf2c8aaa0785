//! Gapless playback with barge-in.
//!
//! Buffers are placed on the output device's clock back to back: each one
//! starts at `max(cursor, now)` and pushes the cursor forward by its own
//! duration. An interrupt stops everything already placed and bumps the
//! generation, so buffers stamped with an older generation that show up
//! afterwards are dropped instead of played.

use std::sync::Arc;

use tracing::{debug, info};

use super::codec::{f32_to_i16, i16_to_f32, resample_linear};
use crate::devices::{AudioOutputDevice, DeviceError, DeviceResult, PlaybackHandle};

/// A buffer placed on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub handle: PlaybackHandle,
    /// Device time the buffer starts at, in seconds
    pub start: f64,
    /// Length in seconds at the device rate
    pub duration: f64,
    pub generation: u64,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

pub struct AudioPlaybackScheduler {
    device: Arc<dyn AudioOutputDevice>,
    cursor: f64,
    generation: u64,
    active: Vec<ScheduledBuffer>,
    stopped: bool,
}

impl AudioPlaybackScheduler {
    pub fn new(device: Arc<dyn AudioOutputDevice>) -> Self {
        let cursor = device.current_time();
        Self {
            device,
            cursor,
            generation: 0,
            active: Vec::new(),
            stopped: false,
        }
    }

    /// Current playback generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Device time at which the next buffer would start if nothing else
    /// were playing.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Buffers that are still playing or waiting to play.
    pub fn pending(&self) -> usize {
        let now = self.device.current_time();
        self.active.iter().filter(|b| b.end() > now).count()
    }

    /// Place `samples` right after whatever is already scheduled.
    ///
    /// Returns `Ok(None)` when the buffer belongs to an interrupted
    /// generation or is empty.
    pub fn enqueue(
        &mut self,
        samples: &[i16],
        sample_rate: u32,
        generation: u64,
    ) -> DeviceResult<Option<ScheduledBuffer>> {
        if self.stopped {
            return Err(DeviceError::Closed);
        }
        if generation < self.generation {
            debug!(
                stale = generation,
                current = self.generation,
                "Dropping buffer from interrupted generation"
            );
            return Ok(None);
        }

        let device_rate = self.device.sample_rate();
        let resampled;
        let samples = if sample_rate != device_rate {
            resampled = f32_to_i16(&resample_linear(
                &i16_to_f32(samples),
                sample_rate,
                device_rate,
            ));
            &resampled[..]
        } else {
            samples
        };
        if samples.is_empty() {
            return Ok(None);
        }

        let now = self.device.current_time();
        self.active.retain(|b| b.end() > now);

        let start = self.cursor.max(now);
        let duration = samples.len() as f64 / device_rate as f64;
        let handle = self.device.schedule(samples, start)?;
        self.cursor = start + duration;

        let buffer = ScheduledBuffer {
            handle,
            start,
            duration,
            generation: self.generation,
        };
        self.active.push(buffer);
        Ok(Some(buffer))
    }

    /// Stop everything placed so far and start a new generation.
    pub fn interrupt(&mut self) -> u64 {
        let dropped = self.active.len();
        for buffer in self.active.drain(..) {
            self.device.stop(buffer.handle);
        }
        self.cursor = self.device.current_time();
        self.generation += 1;
        debug!(
            generation = self.generation,
            dropped, "Playback interrupted"
        );
        self.generation
    }

    /// Stop playback and release the output device. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for buffer in self.active.drain(..) {
            self.device.stop(buffer.handle);
        }
        self.device.close();
        info!("Audio playback stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ManualClockSpeaker;

    fn scheduler() -> (AudioPlaybackScheduler, ManualClockSpeaker) {
        let speaker = ManualClockSpeaker::new(24000);
        (AudioPlaybackScheduler::new(Arc::new(speaker.clone())), speaker)
    }

    #[test]
    fn test_back_to_back_without_gaps() {
        let (mut playback, _speaker) = scheduler();
        let lengths = [2400usize, 480, 7200, 1];
        let mut expected_start = 0.0;

        for len in lengths {
            let buffer = playback
                .enqueue(&vec![0; len], 24000, 0)
                .unwrap()
                .unwrap();
            assert!((buffer.start - expected_start).abs() < 1e-9);
            expected_start += len as f64 / 24000.0;
        }
        assert!((playback.cursor() - expected_start).abs() < 1e-9);
    }

    #[test]
    fn test_late_buffer_starts_now() {
        let (mut playback, speaker) = scheduler();
        playback.enqueue(&[0; 2400], 24000, 0).unwrap();
        speaker.advance(1.0);

        let buffer = playback.enqueue(&[0; 2400], 24000, 0).unwrap().unwrap();
        assert_eq!(buffer.start, 1.0);
        assert_eq!(playback.pending(), 1);
    }

    #[test]
    fn test_interrupt_discards_queue_and_stale_buffers() {
        let (mut playback, speaker) = scheduler();
        for _ in 0..3 {
            playback.enqueue(&[0; 4800], 24000, 0).unwrap();
        }
        speaker.advance(0.05);
        assert_eq!(playback.pending(), 3);

        let generation = playback.interrupt();
        assert_eq!(generation, 1);
        assert_eq!(playback.pending(), 0);
        assert_eq!(playback.cursor(), 0.05);

        for _ in 0..5 {
            assert!(playback.enqueue(&[0; 4800], 24000, 0).unwrap().is_none());
        }

        let fresh = playback.enqueue(&[0; 480], 24000, generation).unwrap().unwrap();
        assert_eq!(fresh.start, 0.05);

        let records = speaker.scheduled();
        assert_eq!(records.len(), 4);
        assert!(records[..3].iter().all(|r| r.stopped_at == Some(0.05)));
        assert!(!records[1].is_audible());
        assert!(!records[2].is_audible());
        assert!(records[3].stopped_at.is_none());
    }

    #[test]
    fn test_resamples_to_device_rate() {
        let (mut playback, speaker) = scheduler();
        let buffer = playback.enqueue(&[100; 1600], 16000, 0).unwrap().unwrap();
        assert!((buffer.duration - 0.1).abs() < 1e-9);
        assert_eq!(speaker.scheduled()[0].samples.len(), 2400);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut playback, speaker) = scheduler();
        playback.enqueue(&[0; 240], 24000, 0).unwrap();
        playback.stop();
        playback.stop();

        assert_eq!(speaker.release_count(), 1);
        assert_eq!(
            playback.enqueue(&[0; 240], 24000, 0),
            Err(DeviceError::Closed)
        );
    }
}
