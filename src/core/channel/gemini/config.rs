//! Gemini Live API configuration types.

use serde::{Deserialize, Serialize};

use crate::core::channel::base::ToolDeclaration;

/// Gemini Live WebSocket endpoint.
pub const GEMINI_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio model used for consultations.
pub const DEFAULT_GEMINI_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Default time to wait for `setupComplete` (milliseconds).
pub const DEFAULT_SETUP_TIMEOUT_MS: u64 = 10_000;

// =============================================================================
// Voices
// =============================================================================

/// Prebuilt voices available to native-audio models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GeminiVoice {
    #[default]
    Puck,
    Charon,
    Kore,
    Fenrir,
    Aoede,
    Leda,
    Orus,
    Zephyr,
}

impl GeminiVoice {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Puck => "Puck",
            Self::Charon => "Charon",
            Self::Kore => "Kore",
            Self::Fenrir => "Fenrir",
            Self::Aoede => "Aoede",
            Self::Leda => "Leda",
            Self::Orus => "Orus",
            Self::Zephyr => "Zephyr",
        }
    }

    /// Parse from string, with fallback to default.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "puck" => Self::Puck,
            "charon" => Self::Charon,
            "kore" => Self::Kore,
            "fenrir" => Self::Fenrir,
            "aoede" => Self::Aoede,
            "leda" => Self::Leda,
            "orus" => Self::Orus,
            "zephyr" => Self::Zephyr,
            _ => Self::default(),
        }
    }
}

impl std::fmt::Display for GeminiVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Channel configuration
// =============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct GeminiLiveConfig {
    pub api_key: String,
    pub model: String,
    pub voice: GeminiVoice,
    pub endpoint: String,
    pub system_instruction: Option<String>,
    pub tools: Vec<ToolDeclaration>,
    pub setup_timeout_ms: u64,
}

impl Default for GeminiLiveConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_GEMINI_LIVE_MODEL.to_string(),
            voice: GeminiVoice::default(),
            endpoint: GEMINI_LIVE_URL.to_string(),
            system_instruction: None,
            tools: Vec::new(),
            setup_timeout_ms: DEFAULT_SETUP_TIMEOUT_MS,
        }
    }
}

impl GeminiLiveConfig {
    /// Model resource name as the setup message expects it.
    pub fn model_resource(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }
}

impl std::fmt::Debug for GeminiLiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiLiveConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("endpoint", &self.endpoint)
            .field("tools", &self.tools.len())
            .field("setup_timeout_ms", &self.setup_timeout_ms)
            .finish()
    }
}
