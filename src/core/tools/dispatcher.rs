//! Routes tool calls from the agent to evidence capture or finalize.
//!
//! Every call that is not `triggerDiagnosis` gets exactly one response with
//! the request's id. The ledger enforces that: a request id that is already in
//! flight, or a response without a matching request, is a protocol violation.
//! The cough recording answers through a deferred future so the caller can
//! await it off the event path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use super::declarations::{CAPTURE_FRAME_TOOL, RECORD_COUGH_TOOL, TRIGGER_DIAGNOSIS_TOOL};
use super::ledger::{LedgerResult, Resolution, ToolCallLedger};
use super::record::{ConsultationRecord, VerbalHistory};
use crate::core::channel::{ToolCallRequest, ToolCallResponse};
use crate::core::evidence::{EvidenceCaptureCoordinator, EvidenceError, EvidenceModality};

/// Response that is only ready once some capture finishes.
pub type DeferredResponse = Pin<Box<dyn Future<Output = ToolCallResponse> + Send>>;

/// What the caller has to do with a dispatched call.
pub enum DispatchOutcome {
    /// Send this response now
    Respond(ToolCallResponse),
    /// Await this off the event path, then send the response
    Deferred(DeferredResponse),
    /// The consultation is over; hand this record to the caller
    Finalize(ConsultationRecord),
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Respond(response) => f.debug_tuple("Respond").field(response).finish(),
            Self::Deferred(_) => f.write_str("Deferred"),
            Self::Finalize(record) => f.debug_tuple("Finalize").field(record).finish(),
        }
    }
}

pub struct ToolCallDispatcher {
    coordinator: Arc<EvidenceCaptureCoordinator>,
    ledger: Mutex<ToolCallLedger>,
}

impl ToolCallDispatcher {
    pub fn new(coordinator: Arc<EvidenceCaptureCoordinator>) -> Self {
        Self {
            coordinator,
            ledger: Mutex::new(ToolCallLedger::new()),
        }
    }

    /// Handle one request.
    ///
    /// Fails only when the request id is already waiting for a response.
    pub fn dispatch(&self, request: &ToolCallRequest) -> LedgerResult<DispatchOutcome> {
        info!(call_id = %request.id, tool = %request.name, "Dispatching tool call");

        if request.name == TRIGGER_DIAGNOSIS_TOOL {
            match self.finalize(request) {
                Ok(record) => return Ok(DispatchOutcome::Finalize(record)),
                Err(text) => {
                    self.ledger.lock().open(&request.id)?;
                    return Ok(DispatchOutcome::Respond(ToolCallResponse::text(request, text)));
                }
            }
        }

        self.ledger.lock().open(&request.id)?;

        let outcome = match request.name.as_str() {
            CAPTURE_FRAME_TOOL => {
                DispatchOutcome::Respond(ToolCallResponse::text(request, self.capture_frame(request)))
            }
            RECORD_COUGH_TOOL => DispatchOutcome::Deferred(self.record_cough(request)),
            other => {
                warn!(tool = %other, "Agent called an unknown tool");
                DispatchOutcome::Respond(ToolCallResponse::text(
                    request,
                    format!(
                        "Unknown tool \"{other}\". Available tools: {CAPTURE_FRAME_TOOL}, {RECORD_COUGH_TOOL}, {TRIGGER_DIAGNOSIS_TOOL}."
                    ),
                ))
            }
        };
        Ok(outcome)
    }

    /// Check a response out of the ledger right before it is sent.
    pub fn settle(&self, response: &ToolCallResponse) -> LedgerResult<Resolution> {
        self.ledger.lock().resolve(&response.id)
    }

    /// The agent withdrew these calls.
    pub fn cancel(&self, ids: &[String]) {
        self.ledger.lock().cancel(ids.iter().map(String::as_str));
    }

    /// Calls still waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.ledger.lock().outstanding()
    }

    /// The camera still this request would capture, if it is a valid
    /// `captureFrameFor` call.
    pub fn still_requested(request: &ToolCallRequest) -> Option<EvidenceModality> {
        if request.name != CAPTURE_FRAME_TOOL {
            return None;
        }
        request
            .arguments
            .get("modality")
            .and_then(Value::as_str)
            .and_then(EvidenceModality::parse)
            .filter(|m| m.is_still())
    }

    fn capture_frame(&self, request: &ToolCallRequest) -> String {
        let Some(name) = request.arguments.get("modality").and_then(Value::as_str) else {
            return format!(
                "No modality given. Call {CAPTURE_FRAME_TOOL} with one of: {}.",
                still_modalities()
            );
        };
        let Some(modality) = EvidenceModality::parse(name).filter(|m| m.is_still()) else {
            return format!(
                "Cannot capture \"{name}\". Supported modalities: {}.",
                still_modalities()
            );
        };

        match self.coordinator.capture_still(modality) {
            Ok(_) => format!("Successfully captured {}.", modality.label()),
            Err(EvidenceError::NoVideoFrame) => {
                "No video frame is available yet. Ask the user to check the camera and try again."
                    .to_string()
            }
            Err(e) => {
                warn!(%modality, error = %e, "Still capture failed");
                format!("Capture of {} failed: {e}", modality.label())
            }
        }
    }

    fn record_cough(&self, request: &ToolCallRequest) -> DeferredResponse {
        let recording = self.coordinator.record_cough_sample();
        let request = request.clone();
        Box::pin(async move {
            let text = match recording.await {
                Ok(_) => "Successfully recorded cough audio.".to_string(),
                Err(e) => {
                    warn!(call_id = %request.id, error = %e, "Cough recording failed");
                    format!("Cough recording failed: {e}")
                }
            };
            ToolCallResponse::text(&request, text)
        })
    }

    fn finalize(&self, request: &ToolCallRequest) -> Result<ConsultationRecord, String> {
        let arguments = match &request.arguments {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        let history: VerbalHistory = serde_json::from_value(arguments).map_err(|e| {
            warn!(call_id = %request.id, error = %e, "Unreadable finalize arguments");
            format!("Could not read the patient details: {e}. Call {TRIGGER_DIAGNOSIS_TOOL} again with an object of text fields.")
        })?;

        let store = self.coordinator.take_store().unwrap_or_else(|| {
            warn!("Evidence already handed over, finalizing without it");
            Default::default()
        });
        info!(evidence = store.len(), "Consultation finalized");
        Ok(ConsultationRecord::new(history, &store))
    }
}

fn still_modalities() -> String {
    EvidenceModality::ALL
        .iter()
        .filter(|m| m.is_still())
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
