use thiserror::Error;

use super::state::SessionState;
use crate::core::channel::ChannelError;
use crate::core::codec::CodecError;
use crate::core::evidence::EvidenceError;
use crate::core::tools::LedgerError;
use crate::devices::DeviceError;

/// Shown when camera or microphone access fails.
pub const DEVICE_UNAVAILABLE_MESSAGE: &str =
    "Could not access camera/microphone. Please ensure permissions are granted.";

/// Coarse classification of session failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionErrorKind {
    DeviceUnavailable,
    ChannelOpenFailed,
    ChannelClosedUnexpectedly,
    MalformedPayload,
    NoVideoFrame,
    ProtocolViolation,
    /// The call is not valid in the session's current state
    InvalidState,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("Could not access camera/microphone. Please ensure permissions are granted.")]
    DeviceUnavailable(#[source] DeviceError),

    #[error("Could not connect to the consultation service: {0}")]
    ChannelOpenFailed(#[source] ChannelError),

    #[error("Connection to the consultation service was lost: {0}")]
    ChannelClosedUnexpectedly(String),

    #[error(transparent)]
    MalformedPayload(#[from] CodecError),

    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    #[error("Tool call protocol violation: {0}")]
    ProtocolViolation(#[from] LedgerError),

    #[error("Cannot {action} a session that is {state}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },
}

impl From<DeviceError> for SessionError {
    fn from(error: DeviceError) -> Self {
        Self::DeviceUnavailable(error)
    }
}

impl From<ChannelError> for SessionError {
    fn from(error: ChannelError) -> Self {
        Self::ChannelOpenFailed(error)
    }
}

impl SessionError {
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            Self::DeviceUnavailable(_) => SessionErrorKind::DeviceUnavailable,
            Self::ChannelOpenFailed(_) => SessionErrorKind::ChannelOpenFailed,
            Self::ChannelClosedUnexpectedly(_) => SessionErrorKind::ChannelClosedUnexpectedly,
            Self::MalformedPayload(_) => SessionErrorKind::MalformedPayload,
            Self::Evidence(EvidenceError::NoVideoFrame) => SessionErrorKind::NoVideoFrame,
            // Remaining capture failures come from the camera or microphone path.
            Self::Evidence(_) => SessionErrorKind::DeviceUnavailable,
            Self::ProtocolViolation(_) => SessionErrorKind::ProtocolViolation,
            Self::InvalidState { .. } => SessionErrorKind::InvalidState,
        }
    }

    /// Whether the session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.kind(),
            SessionErrorKind::MalformedPayload
                | SessionErrorKind::NoVideoFrame
                | SessionErrorKind::InvalidState
        )
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
