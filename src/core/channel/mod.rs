//! Conversation channel to the remote agent.
//!
//! # Implementations
//!
//! - **Gemini Live** - native-audio WebSocket API
//! - **Loopback** - two in-process queues, with a [`RemoteAgent`] handle for
//!   the other side
//!
//! The session only depends on [`ConversationChannel`].

mod base;
pub mod gemini;
pub mod loopback;

pub use base::{
    ChannelError, ChannelEvent, ChannelResult, ConnectRetryConfig, ConversationChannel,
    EVENT_CHANNEL_CAPACITY, EventReceiver, Speaker, ToolCallRequest, ToolCallResponse,
    ToolDeclaration, WireAudio, open_with_retry,
};
pub use gemini::{GeminiLiveChannel, GeminiLiveConfig, GeminiVoice};
pub use loopback::{LoopbackChannel, OutboundMessage, RemoteAgent};
