//! Evidence capture on demand.
//!
//! The remote agent asks for evidence through tool calls; this module does the
//! actual work. Stills come from the camera's current frame and are stored as
//! JPEG. The cough sample is read from the capture tap for a fixed window and
//! stored as 16-bit mono WAV, so recording never competes with streaming for
//! the microphone.
//!
//! Everything lands in one [`EvidenceStore`] keyed by modality. A second
//! capture of the same modality replaces the first. The store is handed out
//! exactly once, at finalize.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::capture::CaptureTap;
use super::codec::INPUT_SAMPLE_RATE;
use crate::devices::{FrameSource, VideoFrame};

pub const JPEG_MEDIA_TYPE: &str = "image/jpeg";
pub const WAV_MEDIA_TYPE: &str = "audio/wav";

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvidenceError {
    /// The camera has no frame to give yet
    #[error("No video frame available")]
    NoVideoFrame,

    /// The modality cannot be captured this way
    #[error("Unsupported modality: {0}")]
    UnsupportedModality(String),

    /// Encoding the captured media failed
    #[error("Encoding failed: {0}")]
    Encoding(String),

    /// The capture path ended before the recording window closed
    #[error("Audio capture stopped during recording")]
    CaptureStopped,
}

pub type EvidenceResult<T> = Result<T, EvidenceError>;

// =============================================================================
// Modalities
// =============================================================================

/// Kinds of evidence the agent can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvidenceModality {
    RashPhoto,
    TonguePhoto,
    EyePhoto,
    PalmPhoto,
    NailPhoto,
    CoughAudio,
    RdtPhoto,
}

impl EvidenceModality {
    pub const ALL: [EvidenceModality; 7] = [
        EvidenceModality::RashPhoto,
        EvidenceModality::TonguePhoto,
        EvidenceModality::EyePhoto,
        EvidenceModality::PalmPhoto,
        EvidenceModality::NailPhoto,
        EvidenceModality::CoughAudio,
        EvidenceModality::RdtPhoto,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceModality::RashPhoto => "rashPhoto",
            EvidenceModality::TonguePhoto => "tonguePhoto",
            EvidenceModality::EyePhoto => "eyePhoto",
            EvidenceModality::PalmPhoto => "palmPhoto",
            EvidenceModality::NailPhoto => "nailPhoto",
            EvidenceModality::CoughAudio => "coughAudio",
            EvidenceModality::RdtPhoto => "rdtPhoto",
        }
    }

    /// Parse the wire name (`"eyePhoto"`, ...).
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }

    /// Whether this modality is a camera still.
    pub fn is_still(&self) -> bool {
        !matches!(self, EvidenceModality::CoughAudio)
    }

    /// Key under which the payload appears in the final record.
    ///
    /// The RDT cassette photo is the record's primary `photo`.
    pub fn payload_key(&self) -> &'static str {
        match self {
            EvidenceModality::RdtPhoto => "photo",
            other => other.as_str(),
        }
    }

    /// Short spoken name, e.g. `eye` for `eyePhoto`.
    pub fn label(&self) -> &'static str {
        let name = self.as_str();
        name.strip_suffix("Photo").unwrap_or(name)
    }
}

impl fmt::Display for EvidenceModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Items and store
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceItem {
    pub modality: EvidenceModality,
    pub payload: Bytes,
    pub media_type: &'static str,
    pub captured_at: OffsetDateTime,
}

impl EvidenceItem {
    pub fn base64(&self) -> String {
        BASE64_STANDARD.encode(&self.payload)
    }
}

/// Modality to item, last write wins.
#[derive(Debug, Clone, Default)]
pub struct EvidenceStore {
    items: HashMap<EvidenceModality, EvidenceItem>,
}

impl EvidenceStore {
    /// Store `item`, returning what it replaced.
    pub fn insert(&mut self, item: EvidenceItem) -> Option<EvidenceItem> {
        self.items.insert(item.modality, item)
    }

    pub fn get(&self, modality: EvidenceModality) -> Option<&EvidenceItem> {
        self.items.get(&modality)
    }

    pub fn contains(&self, modality: EvidenceModality) -> bool {
        self.items.contains_key(&modality)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvidenceItem> {
        self.items.values()
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    /// JPEG quality for stills (1-100).
    /// Default: 80
    pub jpeg_quality: u8,

    /// Length of the cough recording (milliseconds).
    /// Default: 5000ms
    pub cough_duration_ms: u64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            cough_duration_ms: 5000,
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub type RecordingFuture = Pin<Box<dyn Future<Output = EvidenceResult<EvidenceItem>> + Send>>;

pub struct EvidenceCaptureCoordinator {
    camera: Arc<dyn FrameSource>,
    tap: CaptureTap,
    store: Arc<Mutex<Option<EvidenceStore>>>,
    config: EvidenceConfig,
}

impl EvidenceCaptureCoordinator {
    pub fn new(camera: Arc<dyn FrameSource>, tap: CaptureTap, config: EvidenceConfig) -> Self {
        Self {
            camera,
            tap,
            store: Arc::new(Mutex::new(Some(EvidenceStore::default()))),
            config,
        }
    }

    pub fn config(&self) -> &EvidenceConfig {
        &self.config
    }

    /// Grab the current camera frame as a JPEG and store it.
    pub fn capture_still(&self, modality: EvidenceModality) -> EvidenceResult<EvidenceItem> {
        if !modality.is_still() {
            return Err(EvidenceError::UnsupportedModality(modality.to_string()));
        }
        let frame = self.camera.current_frame().ok_or(EvidenceError::NoVideoFrame)?;
        let jpeg = encode_jpeg(frame, self.config.jpeg_quality)?;

        let item = EvidenceItem {
            modality,
            payload: Bytes::from(jpeg),
            media_type: JPEG_MEDIA_TYPE,
            captured_at: OffsetDateTime::now_utc(),
        };
        info!(%modality, bytes = item.payload.len(), "Captured still");
        store_item(&self.store, item.clone());
        Ok(item)
    }

    /// Record the configured cough window.
    pub fn record_cough_sample(&self) -> RecordingFuture {
        self.record_audio_sample(Duration::from_millis(self.config.cough_duration_ms))
    }

    /// Record `duration` of captured audio as WAV and store it as the cough
    /// sample.
    ///
    /// The tap subscription is taken before this returns, so audio captured
    /// between the call and the first poll is not lost. Only the returned
    /// future waits; streaming carries on.
    pub fn record_audio_sample(&self, duration: Duration) -> RecordingFuture {
        let mut rx = self.tap.subscribe();
        let store = self.store.clone();
        let wanted = (duration.as_secs_f64() * INPUT_SAMPLE_RATE as f64).round() as usize;

        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + duration;
            let mut samples: Vec<i16> = Vec::with_capacity(wanted);

            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    chunk = rx.recv() => match chunk {
                        Ok(chunk) => samples.extend_from_slice(&chunk.samples),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Cough recording fell behind capture");
                        }
                        Err(RecvError::Closed) => return Err(EvidenceError::CaptureStopped),
                    },
                }
            }
            samples.truncate(wanted);

            let wav = encode_wav(&samples, INPUT_SAMPLE_RATE)?;
            let item = EvidenceItem {
                modality: EvidenceModality::CoughAudio,
                payload: Bytes::from(wav),
                media_type: WAV_MEDIA_TYPE,
                captured_at: OffsetDateTime::now_utc(),
            };
            info!(
                samples = samples.len(),
                bytes = item.payload.len(),
                "Recorded cough sample"
            );
            store_item(&store, item.clone());
            Ok(item)
        })
    }

    /// Hand over everything collected. Only the first call gets the store;
    /// captures finishing afterwards are discarded.
    pub fn take_store(&self) -> Option<EvidenceStore> {
        self.store.lock().take()
    }
}

fn store_item(store: &Mutex<Option<EvidenceStore>>, item: EvidenceItem) {
    match store.lock().as_mut() {
        Some(store) => {
            if store.insert(item).is_some() {
                debug!("Replaced earlier evidence");
            }
        }
        None => warn!(modality = %item.modality, "Evidence arrived after finalize, discarding"),
    }
}

fn encode_jpeg(frame: VideoFrame, quality: u8) -> EvidenceResult<Vec<u8>> {
    let VideoFrame { width, height, rgb } = frame;
    let image = image::RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| EvidenceError::Encoding("frame buffer does not match its size".to_string()))?;

    let mut out = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    image::DynamicImage::ImageRgb8(image)
        .write_with_encoder(encoder)
        .map_err(|e| EvidenceError::Encoding(e.to_string()))?;
    Ok(out)
}

fn encode_wav(samples: &[i16], sample_rate: u32) -> EvidenceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| EvidenceError::Encoding(e.to_string()))?;
        for sample in samples {
            writer
                .write_sample(*sample)
                .map_err(|e| EvidenceError::Encoding(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| EvidenceError::Encoding(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}
