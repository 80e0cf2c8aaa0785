//! Gemini Live API channel.
//!
//! Full-duplex native-audio conversation with a Gemini model over WebSocket.
//!
//! # Features
//!
//! - Bidirectional audio streaming
//! - Input and output transcription
//! - Server-side barge-in (`interrupted`)
//! - Function calling with cancellation
//!
//! # Audio Format
//!
//! Input is PCM 16-bit at 16kHz, output is PCM 16-bit at 24kHz, both mono.

mod client;
mod config;
mod messages;

pub use client::GeminiLiveChannel;
pub use config::{
    DEFAULT_GEMINI_LIVE_MODEL, DEFAULT_SETUP_TIMEOUT_MS, GEMINI_LIVE_URL, GeminiLiveConfig,
    GeminiVoice,
};
pub use messages::{ClientMessage, EventTranslator, ServerMessage};
