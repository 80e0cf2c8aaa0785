//! Gemini Live API WebSocket message types.
//!
//! Every frame is one JSON object whose single top-level key names the
//! message.
//!
//! # Protocol Overview
//!
//! Client messages (sent to server):
//! - setup - Model, voice, tools and transcription settings; must come first
//! - realtimeInput - Streaming microphone audio
//! - clientContent - A complete text turn
//! - toolResponse - Results of function calls
//!
//! Server messages (received from server):
//! - setupComplete - Setup accepted
//! - serverContent - Model audio, transcriptions and turn signals
//! - toolCall - Function calls to run
//! - toolCallCancellation - Function calls the model no longer wants
//! - goAway - Server will disconnect soon

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::channel::base::{
    ChannelEvent, Speaker, ToolCallRequest, ToolCallResponse, ToolDeclaration, WireAudio,
};
use crate::core::codec::OUTPUT_SAMPLE_RATE;

// =============================================================================
// Shared content types
// =============================================================================

/// Inline binary data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: &str) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: Some(text.to_string()),
                inline_data: None,
            }],
        }
    }
}

// =============================================================================
// Client messages (sent to server)
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    /// Stream PCM audio; `data` is already base64.
    pub fn audio(data: String, sample_rate: u32) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                mime_type: format!("audio/pcm;rate={}", sample_rate),
                data,
            }),
        })
    }

    /// A complete user text turn.
    pub fn text_turn(text: &str) -> Self {
        ClientMessage::ClientContent(ClientContent {
            turns: vec![Content::user_text(text)],
            turn_complete: true,
        })
    }

    pub fn tool_response(response: ToolCallResponse) -> Self {
        ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                id: response.id,
                name: response.name,
                response: response.result,
            }],
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    pub input_audio_transcription: AudioTranscriptionConfig,
    pub output_audio_transcription: AudioTranscriptionConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Enables transcription; carries no settings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AudioTranscriptionConfig {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: serde_json::Value,
}

// =============================================================================
// Server messages (received from server)
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Sample rate declared in a `audio/pcm;rate=N` mime type.
pub fn sample_rate_of(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
}

// =============================================================================
// Translation to channel events
// =============================================================================

/// Turns server messages into [`ChannelEvent`]s.
///
/// The server never says when the participant's turn ended, only that input
/// transcription arrived. The participant's turn is therefore closed when the
/// model starts answering (first output after input) or when the model's turn
/// completes.
#[derive(Debug, Default)]
pub struct EventTranslator {
    local_turn_open: bool,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn seal_local(&mut self, events: &mut Vec<ChannelEvent>) {
        if self.local_turn_open {
            self.local_turn_open = false;
            events.push(ChannelEvent::TurnComplete(Speaker::Local));
        }
    }

    /// Events for one server message, in protocol order.
    pub fn translate(&mut self, message: ServerMessage) -> Vec<ChannelEvent> {
        let mut events = Vec::new();

        if let Some(content) = message.server_content {
            if let Some(text) = content.input_transcription.and_then(|t| t.text)
                && !text.is_empty()
            {
                self.local_turn_open = true;
                events.push(ChannelEvent::TranscriptDelta {
                    speaker: Speaker::Local,
                    text,
                });
            }

            if let Some(text) = content.output_transcription.and_then(|t| t.text)
                && !text.is_empty()
            {
                self.seal_local(&mut events);
                events.push(ChannelEvent::TranscriptDelta {
                    speaker: Speaker::Remote,
                    text,
                });
            }

            let audio: Vec<Blob> = content
                .model_turn
                .map(|turn| turn.parts)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|part| part.inline_data)
                .filter(|blob| blob.mime_type.starts_with("audio/"))
                .collect();
            if !audio.is_empty() {
                self.seal_local(&mut events);
            }
            for blob in audio {
                let sample_rate = sample_rate_of(&blob.mime_type).unwrap_or(OUTPUT_SAMPLE_RATE);
                events.push(ChannelEvent::Audio(WireAudio {
                    data: blob.data,
                    sample_rate,
                }));
            }

            if content.interrupted {
                events.push(ChannelEvent::Interrupted);
            }

            if content.turn_complete {
                self.seal_local(&mut events);
                events.push(ChannelEvent::TurnComplete(Speaker::Remote));
            }
        }

        if let Some(call) = message.tool_call {
            if !call.function_calls.is_empty() {
                self.seal_local(&mut events);
            }
            for fc in call.function_calls {
                events.push(ChannelEvent::ToolCall(ToolCallRequest {
                    id: fc.id,
                    name: fc.name,
                    arguments: fc.args,
                }));
            }
        }

        if let Some(cancellation) = message.tool_call_cancellation
            && !cancellation.ids.is_empty()
        {
            events.push(ChannelEvent::ToolCallCancelled(cancellation.ids));
        }

        if let Some(go_away) = message.go_away {
            warn!(
                time_left = go_away.time_left.as_deref().unwrap_or("unknown"),
                "Gemini Live server is about to disconnect"
            );
        }

        events
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ServerMessage {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_audio_message_serialization() {
        let json = serde_json::to_value(ClientMessage::audio("AAAA".to_string(), 16000)).unwrap();
        assert_eq!(json["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(json["realtimeInput"]["audio"]["data"], "AAAA");
    }

    #[test]
    fn test_text_turn_serialization() {
        let json = serde_json::to_value(ClientMessage::text_turn("Begin")).unwrap();
        assert_eq!(json["clientContent"]["turnComplete"], true);
        assert_eq!(json["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(json["clientContent"]["turns"][0]["parts"][0]["text"], "Begin");
    }

    #[test]
    fn test_tool_response_serialization() {
        let response = ToolCallResponse {
            id: "c1".to_string(),
            name: "captureFrameFor".to_string(),
            result: serde_json::json!({ "result": "Successfully captured eye." }),
        };
        let json = serde_json::to_value(ClientMessage::tool_response(response)).unwrap();
        let fr = &json["toolResponse"]["functionResponses"][0];
        assert_eq!(fr["id"], "c1");
        assert_eq!(fr["response"]["result"], "Successfully captured eye.");
    }

    #[test]
    fn test_sample_rate_of() {
        assert_eq!(sample_rate_of("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(sample_rate_of("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(sample_rate_of("audio/pcm"), None);
    }

    #[test]
    fn test_setup_complete_parses() {
        let message = parse(r#"{"setupComplete":{}}"#);
        assert!(message.setup_complete.is_some());
        assert!(EventTranslator::new().translate(message).is_empty());
    }

    #[test]
    fn test_model_turn_translation() {
        let mut translator = EventTranslator::new();

        let events = translator.translate(parse(
            r#"{"serverContent":{"inputTranscription":{"text":"fever since"}}}"#,
        ));
        assert_eq!(
            events,
            vec![ChannelEvent::TranscriptDelta {
                speaker: Speaker::Local,
                text: "fever since".to_string()
            }]
        );

        let events = translator.translate(parse(
            r#"{"serverContent":{
                "outputTranscription":{"text":"How many"},
                "modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}}]}
            }}"#,
        ));
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ChannelEvent::TurnComplete(Speaker::Local));
        assert!(matches!(
            &events[1],
            ChannelEvent::TranscriptDelta { speaker: Speaker::Remote, .. }
        ));
        assert_eq!(
            events[2],
            ChannelEvent::Audio(WireAudio {
                data: "AAA=".to_string(),
                sample_rate: 24000
            })
        );

        let events = translator.translate(parse(r#"{"serverContent":{"turnComplete":true}}"#));
        assert_eq!(events, vec![ChannelEvent::TurnComplete(Speaker::Remote)]);
    }

    #[test]
    fn test_interrupted_translation() {
        let events = EventTranslator::new()
            .translate(parse(r#"{"serverContent":{"interrupted":true}}"#));
        assert_eq!(events, vec![ChannelEvent::Interrupted]);
    }

    #[test]
    fn test_tool_call_translation() {
        let events = EventTranslator::new().translate(parse(
            r#"{"toolCall":{"functionCalls":[
                {"id":"c1","name":"captureFrameFor","args":{"modality":"eyePhoto"}},
                {"id":"c2","name":"recordCoughSample"}
            ]}}"#,
        ));
        assert_eq!(events.len(), 2);
        match &events[0] {
            ChannelEvent::ToolCall(request) => {
                assert_eq!(request.id, "c1");
                assert_eq!(request.arguments["modality"], "eyePhoto");
            }
            other => panic!("Expected tool call, got {:?}", other),
        }
        match &events[1] {
            ChannelEvent::ToolCall(request) => assert!(request.arguments.is_null()),
            other => panic!("Expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn test_cancellation_translation() {
        let events = EventTranslator::new()
            .translate(parse(r#"{"toolCallCancellation":{"ids":["c1","c2"]}}"#));
        assert_eq!(
            events,
            vec![ChannelEvent::ToolCallCancelled(vec!["c1".to_string(), "c2".to_string()])]
        );
    }
}
