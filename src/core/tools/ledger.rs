//! Bookkeeping that keeps tool calls and responses one to one.

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A request arrived for an id that is still waiting for its response
    #[error("Duplicate tool call id while in flight: {0}")]
    DuplicateRequest(String),

    /// A response was produced for an id with nothing in flight
    #[error("Tool response without a matching request: {0}")]
    UnmatchedResponse(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// What to do with a response that is about to go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Send it
    Send,
    /// The agent withdrew the call; drop the response
    Withdrawn,
}

/// In-flight tool call ids.
#[derive(Debug, Default)]
pub struct ToolCallLedger {
    in_flight: HashSet<String>,
    cancelled: HashSet<String>,
}

impl ToolCallLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request that needs a response.
    pub fn open(&mut self, id: &str) -> LedgerResult<()> {
        if self.in_flight.contains(id) {
            return Err(LedgerError::DuplicateRequest(id.to_string()));
        }
        // A fresh request reuses a withdrawn id.
        self.cancelled.remove(id);
        self.in_flight.insert(id.to_string());
        Ok(())
    }

    /// Close the entry for `id` before its response is sent.
    pub fn resolve(&mut self, id: &str) -> LedgerResult<Resolution> {
        if self.in_flight.remove(id) {
            return Ok(Resolution::Send);
        }
        if self.cancelled.remove(id) {
            debug!(call_id = %id, "Dropping response for withdrawn tool call");
            return Ok(Resolution::Withdrawn);
        }
        Err(LedgerError::UnmatchedResponse(id.to_string()))
    }

    /// Mark calls withdrawn by the agent. Unknown ids are ignored.
    pub fn cancel<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        for id in ids {
            if self.in_flight.remove(id) {
                self.cancelled.insert(id.to_string());
            }
        }
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.contains(id)
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.cancelled.contains(id)
    }

    /// Calls still waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_response_per_request() {
        let mut ledger = ToolCallLedger::new();
        ledger.open("c1").unwrap();
        assert_eq!(ledger.resolve("c1"), Ok(Resolution::Send));
        assert_eq!(
            ledger.resolve("c1"),
            Err(LedgerError::UnmatchedResponse("c1".to_string()))
        );
    }

    #[test]
    fn test_duplicate_request_rejected_until_answered() {
        let mut ledger = ToolCallLedger::new();
        ledger.open("c1").unwrap();
        assert_eq!(
            ledger.open("c1"),
            Err(LedgerError::DuplicateRequest("c1".to_string()))
        );

        ledger.resolve("c1").unwrap();
        assert!(ledger.open("c1").is_ok());
    }

    #[test]
    fn test_cancelled_call_drops_late_response() {
        let mut ledger = ToolCallLedger::new();
        ledger.open("c1").unwrap();
        ledger.open("c2").unwrap();
        ledger.cancel(["c1", "unknown"]);

        assert!(ledger.is_cancelled("c1"));
        assert!(!ledger.is_cancelled("unknown"));
        assert_eq!(ledger.outstanding(), 1);
        assert_eq!(ledger.resolve("c1"), Ok(Resolution::Withdrawn));
        assert!(ledger.resolve("c1").is_err());
        assert_eq!(ledger.resolve("c2"), Ok(Resolution::Send));
    }
}
