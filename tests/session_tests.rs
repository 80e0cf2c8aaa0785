//! Session Flow Tests
//!
//! Drives a full session against in-memory devices and a loopback channel.
//! The test plays the remote agent: it speaks, interrupts, issues tool calls
//! and finalizes, then checks what the session sent back and what it
//! released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use serde_json::json;
use tokio::sync::mpsc;

use live_consult::core::channel::{ChannelEvent, OutboundMessage, RemoteAgent, Speaker, WireAudio};
use live_consult::core::evidence::JPEG_MEDIA_TYPE;
use live_consult::devices::{DeviceError, MemoryBackend};
use live_consult::session::{
    DEVICE_UNAVAILABLE_MESSAGE, FinalPayloadCallback, TranscriptCallback, TranscriptUpdate,
};
use live_consult::{
    ConnectRetryConfig, ConsultationRecord, LoopbackChannel, Session, SessionConfig,
    SessionErrorKind, SessionState,
};

// =============================================================================
// Helpers
// =============================================================================

struct Harness {
    session: Session,
    backend: Arc<MemoryBackend>,
    agent: RemoteAgent,
}

fn harness_with(config: SessionConfig) -> Harness {
    let backend = Arc::new(MemoryBackend::default());
    let (channel, agent) = LoopbackChannel::pair();
    let session = Session::new(config, backend.clone(), Arc::new(channel));
    Harness {
        session,
        backend,
        agent,
    }
}

/// A started session with the greeting already consumed.
async fn active_session() -> Harness {
    let mut h = harness_with(SessionConfig::default());
    h.session.start().await.expect("session should start");
    assert_eq!(h.agent.next_text().await.as_deref(), Some("Begin the consultation."));
    h
}

/// Poll `condition` until it holds, or fail after a few seconds.
async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for {what}");
}

fn tool_responses(messages: &[OutboundMessage], id: &str) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, OutboundMessage::ToolResponse(r) if r.id == id))
        .count()
}

fn capture_final(session: &Session) -> mpsc::UnboundedReceiver<ConsultationRecord> {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: FinalPayloadCallback = Arc::new(move |record| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(record);
        })
    });
    session.on_final_payload(callback);
    rx
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn test_permission_denied_opens_nothing() {
    let h = harness_with(SessionConfig::default());
    h.backend
        .deny_with(DeviceError::PermissionDenied("user dismissed prompt".to_string()));

    let err = h.session.start().await.unwrap_err();
    assert_eq!(err.kind(), SessionErrorKind::DeviceUnavailable);

    let status = h.session.status();
    assert_eq!(status.state, SessionState::Closed);
    assert_eq!(status.message, DEVICE_UNAVAILABLE_MESSAGE);
    assert_eq!(
        status.error.map(|e| e.kind()),
        Some(SessionErrorKind::DeviceUnavailable)
    );

    assert_eq!(h.agent.open_attempts(), 0);
    assert_eq!(h.backend.microphone.open_count(), 0);
    assert_eq!(h.backend.acquisitions(), 0);
}

#[tokio::test]
async fn test_channel_open_failure_releases_devices() {
    let h = harness_with(SessionConfig::default());
    h.agent.refuse_opens(1);

    let err = h.session.start().await.unwrap_err();
    assert_eq!(err.kind(), SessionErrorKind::ChannelOpenFailed);
    assert_eq!(h.session.state(), SessionState::Closed);
    assert_eq!(
        h.session.transitions(),
        vec![
            SessionState::Idle,
            SessionState::PermissionPending,
            SessionState::Connecting,
            SessionState::Errored,
            SessionState::Closed,
        ]
    );

    // Capture never started, the other devices were handed back.
    assert_eq!(h.backend.microphone.open_count(), 0);
    assert_eq!(h.backend.speaker.release_count(), 1);
    assert_eq!(h.backend.camera.release_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_retry_recovers() {
    let config = SessionConfig {
        connect_retry: ConnectRetryConfig::with_attempts(3),
        ..SessionConfig::default()
    };
    let mut h = harness_with(config);
    h.agent.refuse_opens(2);

    h.session.start().await.unwrap();
    assert_eq!(h.session.state(), SessionState::Active);
    assert_eq!(h.agent.open_attempts(), 3);
    assert!(h.agent.next_text().await.is_some());

    h.session.end().await;
}

#[tokio::test]
async fn test_microphone_audio_is_streamed() {
    let mut h = active_session().await;

    assert!(h.backend.microphone.push(vec![0.25; 2048]));
    let mut chunks = Vec::new();
    while chunks.len() < 2 {
        match h.agent.next_message().await {
            Some(OutboundMessage::Audio(chunk)) => chunks.push(chunk),
            Some(_) => {}
            None => panic!("Outbound stream ended"),
        }
    }
    assert!(chunks.iter().all(|c| c.sample_rate == 16000 && c.len() == 1024));

    h.session.end().await;
}

// =============================================================================
// Playback
// =============================================================================

#[tokio::test]
async fn test_interrupt_stops_queued_audio() {
    let h = active_session().await;
    let speaker = h.backend.speaker.clone();

    // Three 100 ms buffers, back to back from t=0.
    for _ in 0..3 {
        assert!(h.agent.speak(&[1000; 2400]).await);
    }
    eventually("three buffers scheduled", || speaker.scheduled().len() == 3).await;
    let starts: Vec<f64> = speaker.scheduled().iter().map(|r| r.start).collect();
    assert!((starts[1] - 0.1).abs() < 1e-9);
    assert!((starts[2] - 0.2).abs() < 1e-9);

    speaker.set_time(0.05);
    assert!(h.agent.send(ChannelEvent::Interrupted).await);
    eventually("buffers stopped", || {
        speaker.scheduled().iter().all(|r| r.stopped_at.is_some())
    })
    .await;

    let records = speaker.scheduled();
    assert!(records[0].is_audible());
    assert!(!records[1].is_audible());
    assert!(!records[2].is_audible());

    // The next reply starts immediately, not after the discarded queue.
    assert!(h.agent.speak(&[500; 2400]).await);
    eventually("reply scheduled", || speaker.scheduled().len() == 4).await;
    assert!((speaker.scheduled()[3].start - 0.05).abs() < 1e-9);
    assert_eq!(h.session.state(), SessionState::Active);

    h.session.end().await;
}

#[tokio::test]
async fn test_malformed_audio_is_dropped() {
    let h = active_session().await;
    let speaker = h.backend.speaker.clone();

    assert!(
        h.agent
            .send(ChannelEvent::Audio(WireAudio {
                data: "not base64 at all!".to_string(),
                sample_rate: 24000,
            }))
            .await
    );
    assert!(h.agent.speak(&[42; 240]).await);

    eventually("valid audio scheduled", || speaker.scheduled().len() == 1).await;
    assert_eq!(speaker.scheduled()[0].samples, vec![42; 240]);
    assert_eq!(h.session.state(), SessionState::Active);

    h.session.end().await;
}

#[tokio::test]
async fn test_interrupt_seals_remote_turn() {
    let h = active_session().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: TranscriptCallback = Arc::new(move |update: TranscriptUpdate| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(update);
        })
    });
    h.session.on_transcript(callback);

    for fragment in ["Please hold ", "the card"] {
        h.agent
            .send(ChannelEvent::TranscriptDelta {
                speaker: Speaker::Remote,
                text: fragment.to_string(),
            })
            .await;
    }
    h.agent.send(ChannelEvent::Interrupted).await;

    let mut last = None;
    while let Some(update) = rx.recv().await {
        let done = update.is_final;
        last = Some(update);
        if done {
            break;
        }
    }
    let last = last.unwrap();
    assert_eq!(last.text, "Please hold the card");

    let turns = h.session.transcript();
    assert_eq!(turns.len(), 1);
    assert!(turns[0].sealed);
    assert!(turns[0].interrupted);

    h.session.end().await;
}

// =============================================================================
// Tool calls
// =============================================================================

#[tokio::test]
async fn test_capture_and_finalize() {
    let mut h = active_session().await;
    let mut finals = capture_final(&h.session);

    h.agent
        .call_tool("c1", "captureFrameFor", json!({ "modality": "eyePhoto" }))
        .await;
    let response = h.agent.next_tool_response().await.unwrap();
    assert_eq!(response.id, "c1");
    assert_eq!(response.result_text(), Some("Successfully captured eye."));

    h.agent
        .call_tool(
            "f1",
            "triggerDiagnosis",
            json!({ "age": "28", "symptoms": "fever" }),
        )
        .await;

    let record = finals.recv().await.unwrap();
    assert_eq!(record.history.age.as_deref(), Some("28"));
    assert_eq!(record.history.symptoms.as_deref(), Some("fever"));
    let eye = record.evidence("eyePhoto").unwrap();
    assert_eq!(eye.mime_type, JPEG_MEDIA_TYPE);
    assert!(!eye.base64.is_empty());

    let flat = serde_json::to_value(&record).unwrap();
    assert_eq!(flat["age"], "28");
    assert_eq!(flat["eyePhoto"]["mimeType"], "image/jpeg");

    let status = h.session.wait_closed().await;
    assert!(status.error.is_none());
    assert_eq!(status.message, "Session ended.");
    assert_eq!(h.session.final_record(), Some(record));
    assert!(
        h.session
            .transitions()
            .ends_with(&[SessionState::Active, SessionState::Ending, SessionState::Closed])
    );

    // One answer for the capture, none for finalize.
    let rest = h.agent.drain();
    assert_eq!(tool_responses(&rest, "c1"), 0);
    assert_eq!(tool_responses(&rest, "f1"), 0);
    assert_eq!(h.backend.microphone.release_count(), 1);
    assert_eq!(h.backend.camera.release_count(), 1);
    assert_eq!(h.backend.speaker.release_count(), 1);
    assert_eq!(h.agent.close_count(), 1);
}

#[tokio::test]
async fn test_still_capture_shows_status() {
    let mut h = active_session().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut status = h.session.subscribe();
    let collector = {
        let seen = seen.clone();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let message = status.borrow_and_update().message.clone();
                seen.lock().push(message);
            }
        })
    };

    h.agent
        .call_tool("c1", "captureFrameFor", json!({ "modality": "eyePhoto" }))
        .await;
    let response = h.agent.next_tool_response().await.unwrap();
    assert_eq!(response.result_text(), Some("Successfully captured eye."));

    eventually("status restored", || {
        seen.lock().last().map(String::as_str) == Some("Connected. AI is ready to talk.")
    })
    .await;
    assert!(seen.lock().iter().any(|m| m == "Capturing eye..."));

    h.session.end().await;
    collector.abort();
}

#[tokio::test]
async fn test_capture_without_frame_is_recoverable() {
    let mut h = active_session().await;
    h.backend.camera.clear();

    h.agent
        .call_tool("c1", "captureFrameFor", json!({ "modality": "tonguePhoto" }))
        .await;
    let response = h.agent.next_tool_response().await.unwrap();
    assert_eq!(response.id, "c1");
    assert!(response.result_text().unwrap().starts_with("No video frame"));
    assert_eq!(h.session.state(), SessionState::Active);

    h.agent
        .call_tool("c2", "analyzeSkin", json!({}))
        .await;
    let response = h.agent.next_tool_response().await.unwrap();
    assert_eq!(response.id, "c2");
    assert!(response.result_text().unwrap().contains("captureFrameFor"));

    h.session.end().await;
}

#[tokio::test(start_paused = true)]
async fn test_cough_recording_does_not_block_playback() {
    let mut h = active_session().await;
    let speaker = h.backend.speaker.clone();
    let mut status = h.session.subscribe();

    h.agent.call_tool("k1", "recordCoughSample", json!({})).await;
    status
        .wait_for(|s| s.message == "Recording cough for 5s...")
        .await
        .unwrap();

    let asked_at = tokio::time::Instant::now();
    h.agent.speak(&[100; 2400]).await;
    eventually("speech scheduled while recording", || {
        speaker.scheduled().len() == 1
    })
    .await;
    assert!(asked_at.elapsed() < Duration::from_secs(5));
    assert_eq!(tool_responses(&h.agent.drain(), "k1"), 0);

    h.backend.microphone.push(vec![0.5; 4096]);
    let response = h.agent.next_tool_response().await.unwrap();
    assert_eq!(response.id, "k1");
    assert_eq!(response.result_text(), Some("Successfully recorded cough audio."));
    assert!(asked_at.elapsed() >= Duration::from_secs(5));

    status
        .wait_for(|s| s.message == "Connected. AI is ready to talk.")
        .await
        .unwrap();

    let mut finals = capture_final(&h.session);
    h.agent.call_tool("f1", "triggerDiagnosis", json!({})).await;
    let record = finals.recv().await.unwrap();
    assert_eq!(record.evidence("coughAudio").unwrap().mime_type, "audio/wav");
}

#[tokio::test(start_paused = true)]
async fn test_withdrawn_call_gets_no_response() {
    let mut h = active_session().await;

    h.agent.call_tool("k1", "recordCoughSample", json!({})).await;
    h.agent
        .send(ChannelEvent::ToolCallCancelled(vec!["k1".to_string()]))
        .await;

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(tool_responses(&h.agent.drain(), "k1"), 0);
    assert_eq!(h.session.state(), SessionState::Active);

    h.session.end().await;
}

#[tokio::test]
async fn test_duplicate_call_id_is_fatal() {
    let h = active_session().await;

    // The first call stays in flight while the recording runs.
    h.agent.call_tool("c1", "recordCoughSample", json!({})).await;
    h.agent
        .call_tool("c1", "captureFrameFor", json!({ "modality": "eyePhoto" }))
        .await;

    let status = h.session.wait_closed().await;
    assert_eq!(
        status.error.map(|e| e.kind()),
        Some(SessionErrorKind::ProtocolViolation)
    );
    assert_eq!(h.backend.microphone.release_count(), 1);
    assert_eq!(h.agent.close_count(), 1);
}

#[tokio::test]
async fn test_record_delivered_before_close() {
    let h = active_session().await;

    let delivered = Arc::new(AtomicBool::new(false));
    let callback: FinalPayloadCallback = {
        let delivered = delivered.clone();
        Arc::new(move |_record| {
            let delivered = delivered.clone();
            Box::pin(async move {
                // A caller writing the record to disk suspends here.
                tokio::task::yield_now().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                delivered.store(true, Ordering::SeqCst);
            })
        })
    };
    h.session.on_final_payload(callback);

    h.agent
        .call_tool("f1", "triggerDiagnosis", json!({ "age": "41" }))
        .await;
    let status = h.session.wait_closed().await;

    assert!(delivered.load(Ordering::SeqCst));
    assert!(status.error.is_none());
    assert_eq!(
        h.session.final_record().and_then(|r| r.history.age),
        Some("41".to_string())
    );
}

// =============================================================================
// Device loss
// =============================================================================

#[tokio::test]
async fn test_speaker_failure_ends_session() {
    let h = active_session().await;
    h.backend
        .speaker
        .fail_schedules(DeviceError::Unavailable("output device removed".to_string()));

    assert!(h.agent.speak(&[1000; 2400]).await);
    let status = h.session.wait_closed().await;

    assert_eq!(
        status.error.map(|e| e.kind()),
        Some(SessionErrorKind::DeviceUnavailable)
    );
    assert!(
        h.session
            .transitions()
            .ends_with(&[SessionState::Active, SessionState::Errored, SessionState::Closed])
    );
    assert_eq!(h.backend.microphone.release_count(), 1);
    assert!(h.backend.speaker.is_closed());
    assert_eq!(h.agent.close_count(), 1);
}

#[tokio::test]
async fn test_microphone_loss_ends_session() {
    let h = active_session().await;
    h.backend.microphone.unplug();

    let status = h.session.wait_closed().await;

    assert_eq!(
        status.error.map(|e| e.kind()),
        Some(SessionErrorKind::DeviceUnavailable)
    );
    assert_eq!(status.message, DEVICE_UNAVAILABLE_MESSAGE);
    assert!(
        h.session
            .transitions()
            .ends_with(&[SessionState::Active, SessionState::Errored, SessionState::Closed])
    );
    assert!(h.backend.speaker.is_closed());
    assert!(h.backend.camera.is_closed());
    assert_eq!(h.agent.close_count(), 1);
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_end_is_idempotent() {
    let h = active_session().await;

    tokio::join!(h.session.end(), h.session.end());
    h.session.end().await;

    assert_eq!(h.session.state(), SessionState::Closed);
    assert!(h.session.status().error.is_none());
    assert_eq!(
        h.session
            .transitions()
            .iter()
            .filter(|s| **s == SessionState::Closed)
            .count(),
        1
    );
    assert_eq!(h.backend.microphone.release_count(), 1);
    assert_eq!(h.backend.speaker.release_count(), 1);
    assert_eq!(h.backend.camera.release_count(), 1);
    assert_eq!(h.agent.close_count(), 1);
    assert!(!h.agent.channel_open());
}

#[tokio::test]
async fn test_remote_close_is_an_error() {
    let h = active_session().await;

    h.agent
        .send(ChannelEvent::Closed("remote hung up".to_string()))
        .await;
    let status = h.session.wait_closed().await;

    assert_eq!(
        status.error.map(|e| e.kind()),
        Some(SessionErrorKind::ChannelClosedUnexpectedly)
    );
    assert!(status.message.contains("remote hung up"));
    assert!(
        h.session
            .transitions()
            .ends_with(&[SessionState::Active, SessionState::Errored, SessionState::Closed])
    );
    assert_eq!(h.backend.microphone.release_count(), 1);
    assert!(h.backend.speaker.is_closed());
    assert!(h.backend.camera.is_closed());
}

#[tokio::test]
async fn test_dropped_agent_ends_session() {
    let h = active_session().await;
    let backend = h.backend.clone();
    let session = h.session;
    drop(h.agent);

    let status = session.wait_closed().await;
    assert_eq!(
        status.error.map(|e| e.kind()),
        Some(SessionErrorKind::ChannelClosedUnexpectedly)
    );
    assert_eq!(backend.microphone.release_count(), 1);
}

#[tokio::test]
async fn test_dropping_session_releases_devices() {
    let h = active_session().await;
    let backend = h.backend.clone();
    drop(h.session);

    assert_eq!(backend.microphone.release_count(), 1);
    assert!(backend.speaker.is_closed());
    assert!(backend.camera.is_closed());
}
