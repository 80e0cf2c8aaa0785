//! Gemini Live client implementation.
//!
//! # API Reference
//!
//! - Endpoint: `wss://generativelanguage.googleapis.com/ws/...BidiGenerateContent`
//! - Auth: `x-goog-api-key` header
//! - Protocol: WebSocket with JSON messages (text or binary frames)
//! - Audio: PCM 16-bit mono, 16kHz in / 24kHz out, base64 encoded

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use super::config::GeminiLiveConfig;
use super::messages::{
    AudioTranscriptionConfig, ClientMessage, Content, EventTranslator, GenerationConfig,
    Part, PrebuiltVoiceConfig, ServerMessage, Setup, SpeechConfig, Tool, VoiceConfig,
};
use crate::core::capture::AudioChunk;
use crate::core::channel::base::{
    ChannelError, ChannelEvent, ChannelResult, ConversationChannel, EVENT_CHANNEL_CAPACITY,
    EventReceiver, ToolCallResponse,
};
use crate::core::codec;

/// Channel capacity for WebSocket message sending.
const WS_CHANNEL_CAPACITY: usize = 256;

/// How long `close` waits for the connection task to say goodbye.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// =============================================================================
// Gemini Live Client
// =============================================================================

/// Conversation channel over the Gemini Live API.
pub struct GeminiLiveChannel {
    config: GeminiLiveConfig,
    /// Connected flag shared with the connection task
    connected: Arc<AtomicBool>,
    /// Set before a local close so the task does not report it as a failure
    intentional_close: Arc<AtomicBool>,
    /// WebSocket sender channel
    ws_sender: Arc<Mutex<Option<mpsc::Sender<ClientMessage>>>>,
    /// Connection task handle
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl GeminiLiveChannel {
    pub fn new(config: GeminiLiveConfig) -> ChannelResult<Self> {
        if config.api_key.is_empty() {
            return Err(ChannelError::InvalidConfiguration(
                "Gemini API key is required".to_string(),
            ));
        }
        Ok(Self {
            config,
            connected: Arc::new(AtomicBool::new(false)),
            intentional_close: Arc::new(AtomicBool::new(false)),
            ws_sender: Arc::new(Mutex::new(None)),
            connection_handle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &GeminiLiveConfig {
        &self.config
    }

    /// Build the first message of the connection.
    pub fn build_setup(&self) -> Setup {
        Setup {
            model: self.config.model_resource(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.config.voice.as_str().to_string(),
                        },
                    },
                }),
            },
            system_instruction: self.config.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part {
                    text: Some(text.clone()),
                    inline_data: None,
                }],
            }),
            tools: if self.config.tools.is_empty() {
                Vec::new()
            } else {
                vec![Tool {
                    function_declarations: self.config.tools.clone(),
                }]
            },
            input_audio_transcription: AudioTranscriptionConfig::default(),
            output_audio_transcription: AudioTranscriptionConfig::default(),
        }
    }

    fn build_request(&self) -> ChannelResult<tungstenite::handshake::client::Request> {
        let mut request = self
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::InvalidConfiguration(e.to_string()))?;
        let key = http::HeaderValue::from_str(&self.config.api_key)
            .map_err(|e| ChannelError::InvalidConfiguration(e.to_string()))?;
        request.headers_mut().insert("x-goog-api-key", key);
        Ok(request)
    }

    async fn send_message(&self, message: ClientMessage) -> ChannelResult<()> {
        if !self.is_open() {
            return Err(ChannelError::NotConnected);
        }
        let sender = self
            .ws_sender
            .lock()
            .clone()
            .ok_or(ChannelError::NotConnected)?;
        sender
            .send(message)
            .await
            .map_err(|_| ChannelError::NotConnected)
    }
}

/// Read frames until `setupComplete`.
async fn await_setup_complete<S>(stream: &mut S) -> ChannelResult<()>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "closed during setup".to_string());
                return Err(ChannelError::OpenFailed(reason));
            }
            Ok(_) => continue,
            Err(e) => return Err(ChannelError::OpenFailed(e.to_string())),
        };
        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(message) if message.setup_complete.is_some() => return Ok(()),
            Ok(_) => debug!("Ignoring message received before setupComplete"),
            Err(e) => warn!("Failed to parse server message during setup: {}", e),
        }
    }
    Err(ChannelError::OpenFailed(
        "connection ended during setup".to_string(),
    ))
}

fn parse_frame(data: &[u8]) -> Option<ServerMessage> {
    match serde_json::from_slice::<ServerMessage>(data) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(
                "Failed to parse server message: {} - {}",
                e,
                String::from_utf8_lossy(data)
            );
            None
        }
    }
}

#[async_trait]
impl ConversationChannel for GeminiLiveChannel {
    async fn open(&self) -> ChannelResult<EventReceiver> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::OpenFailed("already open".to_string()));
        }
        self.intentional_close.store(false, Ordering::SeqCst);

        let request = self.build_request()?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;
        info!(model = %self.config.model, "Connected to Gemini Live API");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let setup = serde_json::to_string(&ClientMessage::Setup(self.build_setup()))
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;
        ws_sink
            .send(Message::Text(setup.into()))
            .await
            .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;

        let timeout = Duration::from_millis(self.config.setup_timeout_ms);
        tokio::time::timeout(timeout, await_setup_complete(&mut ws_stream))
            .await
            .map_err(|_| ChannelError::Timeout("waiting for setupComplete".to_string()))??;
        info!("Gemini Live setup complete");

        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(EVENT_CHANNEL_CAPACITY);
        let (tx, mut rx) = mpsc::channel::<ClientMessage>(WS_CHANNEL_CAPACITY);
        *self.ws_sender.lock() = Some(tx);

        let connected = self.connected.clone();
        let intentional_close = self.intentional_close.clone();
        let ws_sender = self.ws_sender.clone();

        self.connected.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let mut translator = EventTranslator::new();

            // Set when the loop ends for a reason the session must hear about.
            let mut failure: Option<ChannelEvent> = None;

            loop {
                tokio::select! {
                    outgoing = rx.recv() => {
                        let Some(message) = outgoing else {
                            // Local close: sender dropped.
                            if let Err(e) = ws_sink.close().await {
                                debug!("Error closing WebSocket: {}", e);
                            }
                            break;
                        };
                        let json = match serde_json::to_string(&message) {
                            Ok(j) => j,
                            Err(e) => {
                                error!("Failed to serialize message: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                            error!("Failed to send WebSocket message: {}", e);
                            failure = Some(ChannelEvent::Error(ChannelError::WebSocket(e.to_string())));
                            break;
                        }
                    }

                    incoming = ws_stream.next() => {
                        let message = match incoming {
                            Some(Ok(Message::Text(text))) => parse_frame(text.as_bytes()),
                            Some(Ok(Message::Binary(data))) => parse_frame(&data),
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    error!("Failed to send pong: {}", e);
                                }
                                None
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let reason = frame
                                    .map(|f| f.reason.to_string())
                                    .filter(|r| !r.is_empty())
                                    .unwrap_or_else(|| "closed by server".to_string());
                                info!("WebSocket closed by server: {}", reason);
                                failure = Some(ChannelEvent::Closed(reason));
                                break;
                            }
                            Some(Ok(_)) => None,
                            Some(Err(e)) => {
                                error!("WebSocket error: {}", e);
                                failure = Some(ChannelEvent::Error(ChannelError::WebSocket(e.to_string())));
                                break;
                            }
                            None => {
                                failure = Some(ChannelEvent::Closed("stream ended".to_string()));
                                break;
                            }
                        };

                        if let Some(message) = message {
                            for event in translator.translate(message) {
                                if event_tx.send(event).await.is_err() {
                                    debug!("Event receiver dropped");
                                }
                            }
                        }
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            *ws_sender.lock() = None;

            if let Some(event) = failure
                && !intentional_close.load(Ordering::SeqCst)
            {
                let _ = event_tx.send(event).await;
            }
            info!("Gemini Live connection task ended");
        });

        *self.connection_handle.lock() = Some(handle);
        Ok(event_rx)
    }

    async fn send_audio(&self, chunk: &AudioChunk) -> ChannelResult<()> {
        self.send_message(ClientMessage::audio(
            codec::encode(&chunk.samples),
            chunk.sample_rate,
        ))
        .await
    }

    async fn send_text(&self, text: &str) -> ChannelResult<()> {
        self.send_message(ClientMessage::text_turn(text)).await
    }

    async fn send_tool_response(&self, response: ToolCallResponse) -> ChannelResult<()> {
        debug!(call_id = %response.id, "Sending tool response");
        self.send_message(ClientMessage::tool_response(response)).await
    }

    async fn close(&self) {
        self.intentional_close.store(true, Ordering::SeqCst);

        // Dropping the sender lets the task close the socket and exit.
        let had_sender = self.ws_sender.lock().take().is_some();
        self.connected.store(false, Ordering::SeqCst);

        let handle = self.connection_handle.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                warn!("Gemini Live connection task did not stop in time, aborting");
                handle.abort();
            }
        }
        if had_sender {
            info!("Disconnected from Gemini Live API");
        }
    }

    fn is_open(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn provider_info(&self) -> serde_json::Value {
        serde_json::json!({
            "provider": "gemini-live",
            "api_type": "WebSocket BidiGenerateContent",
            "endpoint": self.config.endpoint,
            "model": self.config.model,
            "voice": self.config.voice.as_str(),
            "input_sample_rate": codec::INPUT_SAMPLE_RATE,
            "output_sample_rate": codec::OUTPUT_SAMPLE_RATE,
            "features": {
                "bidirectional_audio": true,
                "transcription": true,
                "function_calling": true,
                "barge_in": true
            }
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
