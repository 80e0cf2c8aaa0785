//! Session lifecycle states and the status shown to the caller.

use std::fmt;

use serde::Serialize;

use super::errors::SessionError;

/// Where a session is in its lifecycle.
///
/// ```text
/// Idle -> PermissionPending -> Connecting -> Active -> Ending -> Closed
///   any state but Closed -> Errored -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    PermissionPending,
    Connecting,
    Active,
    Ending,
    Closed,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PermissionPending => "permission_pending",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Ending => "ending",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }

    /// Whether a session in this state can never become active again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }

    /// Whether `self -> next` is a legal move.
    ///
    /// `end()` may be requested before the session is active, so every
    /// state up to `Active` can move to `Ending`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Errored) => *self != Errored,
            (Idle, PermissionPending) => true,
            (PermissionPending, Connecting) => true,
            (Connecting, Active) => true,
            (Idle | PermissionPending | Connecting | Active, Ending) => true,
            (Ending | Errored, Closed) => true,
            _ => false,
        }
    }

    /// Status line shown while in this state.
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::Idle => "Ready to start consultation.",
            Self::PermissionPending => "Requesting permissions...",
            Self::Connecting => "Starting session...",
            Self::Active => "Connected. AI is ready to talk.",
            Self::Ending => "Ending session...",
            Self::Closed => "Session ended.",
            Self::Errored => "An error occurred during the live session.",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one status line the caller sees.
///
/// Once a session failed, `error` stays set and `message` keeps describing
/// the failure, even after teardown moved the state to `Closed`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub message: String,
    pub error: Option<SessionError>,
}

impl SessionStatus {
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            message: state.default_message().to_string(),
            error: None,
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new(SessionState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [Idle, PermissionPending, Connecting, Active, Ending, Closed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_errored_reachable_until_closed() {
        for state in [Idle, PermissionPending, Connecting, Active, Ending] {
            assert!(state.can_transition_to(Errored));
        }
        assert!(!Closed.can_transition_to(Errored));
        assert!(!Errored.can_transition_to(Errored));
        assert!(Errored.can_transition_to(Closed));
    }

    #[test]
    fn test_no_way_back() {
        assert!(!Active.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Idle));
        assert!(!Errored.can_transition_to(Active));
        assert!(!Ending.can_transition_to(Active));
        assert!(Closed.is_terminal());
        assert!(Errored.is_terminal());
    }

    #[test]
    fn test_initial_status() {
        let status = SessionStatus::default();
        assert_eq!(status.state, Idle);
        assert_eq!(status.message, "Ready to start consultation.");
        assert!(status.error.is_none());
    }
}
