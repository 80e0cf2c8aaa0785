pub mod capture;
pub mod channel;
pub mod codec;
pub mod evidence;
pub mod playback;
pub mod tools;

// Re-export commonly used types for convenience
pub use capture::{AudioCaptureEngine, AudioChunk, CaptureConfig, CaptureTap, ChunkCallback};
pub use channel::{
    ChannelError, ChannelEvent, ChannelResult, ConnectRetryConfig, ConversationChannel,
    GeminiLiveChannel, GeminiLiveConfig, GeminiVoice, LoopbackChannel, RemoteAgent, Speaker,
    ToolCallRequest, ToolCallResponse, ToolDeclaration,
};
pub use codec::{CodecError, CodecResult, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
pub use evidence::{
    EvidenceCaptureCoordinator, EvidenceConfig, EvidenceError, EvidenceItem, EvidenceModality,
    EvidenceStore,
};
pub use playback::{AudioPlaybackScheduler, ScheduledBuffer};
pub use tools::{ConsultationRecord, ToolCallDispatcher, VerbalHistory, tool_declarations};
