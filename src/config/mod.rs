//! Configuration for the live-consult binary.
//!
//! Loaded from environment variables (a `.env` file is read in `main.rs`) and
//! an optional YAML file. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Environment variables
//! - `GEMINI_API_KEY` - required to open a Gemini Live channel
//! - `GEMINI_LIVE_MODEL`, `GEMINI_LIVE_VOICE`, `GEMINI_LIVE_URL`
//! - `GEMINI_SETUP_TIMEOUT_MS`, `GEMINI_CONNECT_RETRIES`
//! - `CAPTURE_CHUNK_SAMPLES`, `COUGH_SAMPLE_MS`, `JPEG_QUALITY`
//!
//! # Example
//! ```rust,no_run
//! use live_consult::config::ConsultConfig;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConsultConfig::from_env()?;
//! let config = ConsultConfig::from_file(Path::new("consult.yaml"))?;
//! let gemini = config.gemini_config()?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use thiserror::Error;

mod yaml;

pub use yaml::YamlConfig;

use crate::core::channel::{ConnectRetryConfig, GeminiLiveConfig, GeminiVoice};
use crate::core::channel::gemini::{
    DEFAULT_GEMINI_LIVE_MODEL, DEFAULT_SETUP_TIMEOUT_MS, GEMINI_LIVE_URL,
};
use crate::core::capture::CaptureConfig;
use crate::core::codec::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::core::evidence::EvidenceConfig;
use crate::core::tools::{DEFAULT_GREETING, SYSTEM_INSTRUCTION, tool_declarations};
use crate::session::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("Gemini API key is not configured (set GEMINI_API_KEY)")]
    MissingApiKey,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Consultation configuration
#[derive(Clone)]
pub struct ConsultConfig {
    // Gemini Live
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_voice: GeminiVoice,
    pub gemini_endpoint: String,
    pub setup_timeout_ms: u64,
    pub connect_retry: ConnectRetryConfig,

    // Capture (always 16 kHz mono)
    pub chunk_samples: usize,

    // Evidence
    pub jpeg_quality: u8,
    pub cough_duration_ms: u64,

    // Session
    pub greeting: String,
    pub system_instruction: String,
}

impl Default for ConsultConfig {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        let evidence = EvidenceConfig::default();
        Self {
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_LIVE_MODEL.to_string(),
            gemini_voice: GeminiVoice::default(),
            gemini_endpoint: GEMINI_LIVE_URL.to_string(),
            setup_timeout_ms: DEFAULT_SETUP_TIMEOUT_MS,
            connect_retry: ConnectRetryConfig::default(),
            chunk_samples: capture.chunk_samples,
            jpeg_quality: evidence.jpeg_quality,
            cough_duration_ms: evidence.cough_duration_ms,
            greeting: DEFAULT_GREETING.to_string(),
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

/// Zeroize the API key when the configuration is dropped.
impl Drop for ConsultConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.gemini_api_key {
            key.zeroize();
        }
    }
}

impl std::fmt::Debug for ConsultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsultConfig")
            .field(
                "gemini_api_key",
                &self.gemini_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("gemini_model", &self.gemini_model)
            .field("gemini_voice", &self.gemini_voice)
            .field("gemini_endpoint", &self.gemini_endpoint)
            .field("setup_timeout_ms", &self.setup_timeout_ms)
            .field("connect_retry", &self.connect_retry)
            .field("chunk_samples", &self.chunk_samples)
            .field("jpeg_quality", &self.jpeg_quality)
            .field("cough_duration_ms", &self.cough_duration_ms)
            .field("greeting", &self.greeting)
            .finish()
    }
}

impl ConsultConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load environment variables, then apply overrides from a YAML file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let yaml = YamlConfig::from_file(path)?;
        let mut config = Self::from_lookup_unvalidated(|name| std::env::var(name).ok())?;
        config.apply_yaml(yaml);
        config.validate()?;
        Ok(config)
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self::from_lookup_unvalidated(lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn from_lookup_unvalidated<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("GEMINI_API_KEY") {
            config.gemini_api_key = Some(key);
        }
        if let Some(model) = get("GEMINI_LIVE_MODEL") {
            config.gemini_model = model;
        }
        if let Some(voice) = get("GEMINI_LIVE_VOICE") {
            config.gemini_voice = GeminiVoice::from_str_or_default(&voice);
        }
        if let Some(endpoint) = get("GEMINI_LIVE_URL") {
            config.gemini_endpoint = endpoint;
        }
        if let Some(value) = get("GEMINI_SETUP_TIMEOUT_MS") {
            config.setup_timeout_ms = parse_number("GEMINI_SETUP_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = get("GEMINI_CONNECT_RETRIES") {
            let attempts: u32 = parse_number("GEMINI_CONNECT_RETRIES", &value)?;
            config.connect_retry = ConnectRetryConfig::with_attempts(attempts);
        }
        if let Some(value) = get("CAPTURE_CHUNK_SAMPLES") {
            config.chunk_samples = parse_number("CAPTURE_CHUNK_SAMPLES", &value)?;
        }
        if let Some(value) = get("COUGH_SAMPLE_MS") {
            config.cough_duration_ms = parse_number("COUGH_SAMPLE_MS", &value)?;
        }
        if let Some(value) = get("JPEG_QUALITY") {
            config.jpeg_quality = parse_number("JPEG_QUALITY", &value)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) {
        if let Some(gemini) = yaml.gemini {
            if let Some(key) = gemini.api_key {
                self.gemini_api_key = Some(key);
            }
            if let Some(model) = gemini.model {
                self.gemini_model = model;
            }
            if let Some(voice) = gemini.voice {
                self.gemini_voice = GeminiVoice::from_str_or_default(&voice);
            }
            if let Some(endpoint) = gemini.endpoint {
                self.gemini_endpoint = endpoint;
            }
            if let Some(timeout) = gemini.setup_timeout_ms {
                self.setup_timeout_ms = timeout;
            }
            if let Some(retry) = gemini.connect_retry {
                self.connect_retry = retry;
            }
        }
        if let Some(capture) = yaml.capture {
            if let Some(rate) = capture.sample_rate
                && rate != INPUT_SAMPLE_RATE
            {
                tracing::warn!(rate, "capture.sample_rate is fixed at {INPUT_SAMPLE_RATE}, ignoring");
            }
            if let Some(samples) = capture.chunk_samples {
                self.chunk_samples = samples;
            }
        }
        if let Some(playback) = yaml.playback
            && let Some(rate) = playback.sample_rate
            && rate != OUTPUT_SAMPLE_RATE
        {
            tracing::warn!(rate, "playback.sample_rate is fixed at {OUTPUT_SAMPLE_RATE}, ignoring");
        }
        if let Some(evidence) = yaml.evidence {
            if let Some(quality) = evidence.jpeg_quality {
                self.jpeg_quality = quality;
            }
            if let Some(duration) = evidence.cough_duration_ms {
                self.cough_duration_ms = duration;
            }
        }
        if let Some(session) = yaml.session {
            if let Some(greeting) = session.greeting {
                self.greeting = greeting;
            }
            if let Some(instruction) = session.system_instruction {
                self.system_instruction = instruction;
            }
        }
    }

    /// Check value ranges and the endpoint URL.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.gemini_model.trim().is_empty() {
            return Err(invalid("gemini.model", "must not be empty"));
        }
        let endpoint = url::Url::parse(&self.gemini_endpoint)
            .map_err(|e| invalid("gemini.endpoint", e.to_string()))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(invalid(
                "gemini.endpoint",
                format!("expected a ws:// or wss:// URL, got {}://", endpoint.scheme()),
            ));
        }
        if self.setup_timeout_ms == 0 {
            return Err(invalid("gemini.setup_timeout_ms", "must be positive"));
        }
        if !(160..=16_000).contains(&self.chunk_samples) {
            return Err(invalid(
                "capture.chunk_samples",
                format!("{} is outside 160..=16000", self.chunk_samples),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(invalid(
                "evidence.jpeg_quality",
                format!("{} is outside 1..=100", self.jpeg_quality),
            ));
        }
        if !(1_000..=30_000).contains(&self.cough_duration_ms) {
            return Err(invalid(
                "evidence.cough_duration_ms",
                format!("{} is outside 1000..=30000", self.cough_duration_ms),
            ));
        }
        Ok(())
    }

    /// Settings for a [`crate::session::Session`].
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            capture: CaptureConfig {
                chunk_samples: self.chunk_samples,
            },
            evidence: EvidenceConfig {
                jpeg_quality: self.jpeg_quality,
                cough_duration_ms: self.cough_duration_ms,
            },
            connect_retry: self.connect_retry.clone(),
            greeting: self.greeting.clone(),
        }
    }

    /// Settings for a Gemini Live channel, with the consultation tools.
    pub fn gemini_config(&self) -> ConfigResult<GeminiLiveConfig> {
        let api_key = self
            .gemini_api_key
            .clone()
            .ok_or(ConfigError::MissingApiKey)?;
        Ok(GeminiLiveConfig {
            api_key,
            model: self.gemini_model.clone(),
            voice: self.gemini_voice,
            endpoint: self.gemini_endpoint.clone(),
            system_instruction: Some(self.system_instruction.clone()),
            tools: tool_declarations(),
            setup_timeout_ms: self.setup_timeout_ms,
        })
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        reason: reason.into(),
    }
}

fn parse_number<T>(name: &'static str, value: &str) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(name, format!("{value:?}: {e}")))
}
