//! Session orchestration.
//!
//! Owns the lifecycle of one live consultation: devices, channel, the three
//! concurrent activities, and the status line shown to the caller.

mod errors;
mod machine;
mod state;
mod transcript;

pub use errors::{DEVICE_UNAVAILABLE_MESSAGE, SessionError, SessionErrorKind, SessionResult};
pub use machine::{FinalPayloadCallback, Session, SessionConfig, TranscriptCallback};
pub use state::{SessionState, SessionStatus};
pub use transcript::{Transcript, TranscriptTurn, TranscriptUpdate};
