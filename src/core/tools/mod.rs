//! Tool calls made by the remote agent.
//!
//! - [`declarations`] - what the agent is told it can call
//! - [`ToolCallDispatcher`] - runs the calls and keeps responses one to one
//! - [`ConsultationRecord`] - the merged record produced at finalize

pub mod declarations;
mod dispatcher;
mod ledger;
mod record;

pub use declarations::{
    CAPTURE_FRAME_TOOL, DEFAULT_GREETING, RECORD_COUGH_TOOL, SYSTEM_INSTRUCTION,
    TRIGGER_DIAGNOSIS_TOOL, tool_declarations,
};
pub use dispatcher::{DeferredResponse, DispatchOutcome, ToolCallDispatcher};
pub use ledger::{LedgerError, LedgerResult, Resolution, ToolCallLedger};
pub use record::{ConsultationRecord, EvidencePayload, VerbalHistory};
