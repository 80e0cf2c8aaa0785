//! Base traits and types for the conversation channel.
//!
//! The channel is the only way the session talks to the remote agent. It is a
//! capability interface, not a transport: a WebSocket client, a pub/sub pair
//! or two in-process queues all satisfy it as long as inbound events arrive in
//! the order the agent produced them.
//!
//! # Audio Format
//!
//! - Outbound: PCM 16-bit, 16kHz, mono, base64 framed
//! - Inbound: PCM 16-bit, 24kHz, mono, base64 framed

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::capture::AudioChunk;

/// Capacity of the inbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur on the conversation channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel could not be opened
    #[error("Channel open failed: {0}")]
    OpenFailed(String),

    /// The remote side went away while the conversation was running
    #[error("Channel closed unexpectedly: {0}")]
    ClosedUnexpectedly(String),

    /// Send attempted on a channel that is not open
    #[error("Not connected")]
    NotConnected,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Provider-specific error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

// =============================================================================
// Open retry policy
// =============================================================================

/// Bounded retry policy for opening the channel.
///
/// Only the open is retried. A channel lost mid-conversation is never
/// reopened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectRetryConfig {
    /// Retry failed opens at all.
    /// Default: false
    pub enabled: bool,

    /// Retries after the first attempt. Zero means no retries.
    /// Default: 3
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds).
    /// Default: 500ms
    pub initial_delay_ms: u64,

    /// Upper bound on the delay between retries (milliseconds).
    /// Default: 5000ms
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    /// Default: 2.0
    pub backoff_multiplier: f32,

    /// Add up to 25% jitter to each delay.
    /// Default: true
    pub jitter: bool,
}

impl Default for ConnectRetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ConnectRetryConfig {
    /// A policy that retries up to `max_attempts` times.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            enabled: true,
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), in milliseconds.
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        let delay = base_delay * multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_delay_ms as f64);

        if self.jitter {
            let jitter = rand_jitter(delay * 0.25);
            (delay + jitter).max(0.0) as u64
        } else {
            delay as u64
        }
    }

    /// Whether another retry is allowed after `attempt` retries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && attempt < self.max_attempts
    }
}

/// Pseudo-random value in `-range..=range` from a simple LCG.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64;
    (normalized - 0.5) * 2.0 * range
}

// =============================================================================
// Events
// =============================================================================

/// Who said something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The participant in front of the microphone
    Local,
    /// The remote agent
    Remote,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::Local => write!(f, "local"),
            Speaker::Remote => write!(f, "remote"),
        }
    }
}

/// Audio as it travels on the wire, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireAudio {
    /// Base64 of 16-bit little-endian PCM
    pub data: String,
    pub sample_rate: u32,
}

/// Request from the agent to run a local action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Opaque id, echoed back unchanged
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Answer to a [`ToolCallRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub name: String,
    pub result: serde_json::Value,
}

impl ToolCallResponse {
    /// A response carrying a human-readable result string.
    pub fn text(request: &ToolCallRequest, text: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            result: serde_json::json!({ "result": text.into() }),
        }
    }

    /// The result string, if this is a text response.
    pub fn result_text(&self) -> Option<&str> {
        self.result.get("result").and_then(|v| v.as_str())
    }
}

/// Declaration of a tool the agent may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments
    pub parameters: serde_json::Value,
}

/// Everything the remote side can tell us, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Audio(WireAudio),
    TranscriptDelta { speaker: Speaker, text: String },
    TurnComplete(Speaker),
    Interrupted,
    ToolCall(ToolCallRequest),
    /// The agent withdrew these tool calls
    ToolCallCancelled(Vec<String>),
    Closed(String),
    Error(ChannelError),
}

/// Inbound half of an open channel.
pub type EventReceiver = mpsc::Receiver<ChannelEvent>;

// =============================================================================
// Base Trait
// =============================================================================

/// Duplex logical connection to the remote agent.
///
/// All methods take `&self` so the channel can be shared between the capture
/// path (audio out), the dispatcher (tool responses) and teardown.
#[async_trait]
pub trait ConversationChannel: Send + Sync {
    /// Connect and return the inbound event stream.
    async fn open(&self) -> ChannelResult<EventReceiver>;

    /// Stream one captured chunk. Fire-and-forget; order is preserved.
    async fn send_audio(&self, chunk: &AudioChunk) -> ChannelResult<()>;

    /// Send a text turn (used for the begin signal).
    async fn send_text(&self, text: &str) -> ChannelResult<()>;

    /// Answer a tool call.
    async fn send_tool_response(&self, response: ToolCallResponse) -> ChannelResult<()>;

    /// Disconnect. Idempotent.
    async fn close(&self);

    /// Whether the channel is open.
    fn is_open(&self) -> bool;

    /// Provider information.
    fn provider_info(&self) -> serde_json::Value;
}

/// Open `channel`, retrying failures as `policy` allows.
pub async fn open_with_retry(
    channel: &dyn ConversationChannel,
    policy: &ConnectRetryConfig,
) -> ChannelResult<EventReceiver> {
    let mut attempt: u32 = 0;
    loop {
        match channel.open().await {
            Ok(events) => return Ok(events),
            Err(e @ ChannelError::InvalidConfiguration(_)) => return Err(e),
            Err(e) if policy.should_retry(attempt) => {
                attempt += 1;
                let delay_ms = policy.calculate_delay(attempt);
                warn!(
                    "Channel open failed ({}), retry {}/{} in {}ms",
                    e, attempt, policy.max_attempts, delay_ms
                );
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
            Err(e) => {
                if attempt > 0 {
                    info!("Giving up on channel after {} retries", attempt);
                }
                return Err(e);
            }
        }
    }
}
