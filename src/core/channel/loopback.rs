//! In-process channel made of two queues.
//!
//! [`LoopbackChannel::pair`] returns the channel the session uses and a
//! [`RemoteAgent`] handle that plays the other side: it pushes inbound events
//! and reads whatever the session sent. Dropping the agent ends the inbound
//! stream, which the session sees as the remote hanging up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::base::{
    ChannelError, ChannelEvent, ChannelResult, ConversationChannel, EVENT_CHANNEL_CAPACITY,
    EventReceiver, ToolCallRequest, ToolCallResponse, WireAudio,
};
use crate::core::capture::AudioChunk;
use crate::core::codec::{self, OUTPUT_SAMPLE_RATE};

/// Something the session sent to the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Audio(AudioChunk),
    Text(String),
    ToolResponse(ToolCallResponse),
}

struct Shared {
    inbound: Mutex<Option<EventReceiver>>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    open: AtomicBool,
    failing_opens: AtomicUsize,
    open_attempts: AtomicUsize,
    closes: AtomicUsize,
}

/// Session-side end of the loopback.
#[derive(Clone)]
pub struct LoopbackChannel {
    shared: Arc<Shared>,
}

/// Agent-side end of the loopback.
pub struct RemoteAgent {
    events: mpsc::Sender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    shared: Arc<Shared>,
}

impl LoopbackChannel {
    pub fn pair() -> (LoopbackChannel, RemoteAgent) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inbound: Mutex::new(Some(event_rx)),
            outbound: out_tx,
            open: AtomicBool::new(false),
            failing_opens: AtomicUsize::new(0),
            open_attempts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        (
            LoopbackChannel {
                shared: shared.clone(),
            },
            RemoteAgent {
                events: event_tx,
                outbound: out_rx,
                shared,
            },
        )
    }

    fn forward(&self, message: OutboundMessage) -> ChannelResult<()> {
        if !self.is_open() {
            return Err(ChannelError::NotConnected);
        }
        self.shared
            .outbound
            .send(message)
            .map_err(|_| ChannelError::NotConnected)
    }
}

#[async_trait]
impl ConversationChannel for LoopbackChannel {
    async fn open(&self) -> ChannelResult<EventReceiver> {
        self.shared.open_attempts.fetch_add(1, Ordering::SeqCst);

        let refuse = self
            .shared
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(ChannelError::OpenFailed("loopback refused".to_string()));
        }

        let events = self
            .shared
            .inbound
            .lock()
            .take()
            .ok_or_else(|| ChannelError::OpenFailed("loopback already opened".to_string()))?;
        self.shared.open.store(true, Ordering::SeqCst);
        Ok(events)
    }

    async fn send_audio(&self, chunk: &AudioChunk) -> ChannelResult<()> {
        self.forward(OutboundMessage::Audio(chunk.clone()))
    }

    async fn send_text(&self, text: &str) -> ChannelResult<()> {
        self.forward(OutboundMessage::Text(text.to_string()))
    }

    async fn send_tool_response(&self, response: ToolCallResponse) -> ChannelResult<()> {
        self.forward(OutboundMessage::ToolResponse(response))
    }

    async fn close(&self) {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn provider_info(&self) -> serde_json::Value {
        serde_json::json!({
            "provider": "loopback",
            "transport": "in-process queues",
        })
    }
}

impl RemoteAgent {
    /// Deliver an event to the session. Returns `false` once the session
    /// stopped listening.
    pub async fn send(&self, event: ChannelEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Speak `samples` (24 kHz).
    pub async fn speak(&self, samples: &[i16]) -> bool {
        self.send(ChannelEvent::Audio(WireAudio {
            data: codec::encode(samples),
            sample_rate: OUTPUT_SAMPLE_RATE,
        }))
        .await
    }

    /// Issue a tool call.
    pub async fn call_tool(&self, id: &str, name: &str, arguments: serde_json::Value) -> bool {
        self.send(ChannelEvent::ToolCall(ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }))
        .await
    }

    /// Next message from the session, of any kind.
    pub async fn next_message(&mut self) -> Option<OutboundMessage> {
        self.outbound.recv().await
    }

    /// Next tool response, skipping audio and text.
    pub async fn next_tool_response(&mut self) -> Option<ToolCallResponse> {
        while let Some(message) = self.outbound.recv().await {
            if let OutboundMessage::ToolResponse(response) = message {
                return Some(response);
            }
        }
        None
    }

    /// Next text turn, skipping audio and tool responses.
    pub async fn next_text(&mut self) -> Option<String> {
        while let Some(message) = self.outbound.recv().await {
            if let OutboundMessage::Text(text) = message {
                return Some(text);
            }
        }
        None
    }

    /// Everything already sent, without waiting.
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            out.push(message);
        }
        out
    }

    /// Refuse the next `count` opens.
    pub fn refuse_opens(&self, count: usize) {
        self.shared.failing_opens.store(count, Ordering::SeqCst);
    }

    pub fn open_attempts(&self) -> usize {
        self.shared.open_attempts.load(Ordering::SeqCst)
    }

    /// Times an open channel was closed.
    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn channel_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }
}
