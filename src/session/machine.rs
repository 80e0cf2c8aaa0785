//! The consultation session.
//!
//! A [`Session`] acquires the devices, opens the channel and then runs three
//! independent activities until it ends:
//!
//! - capture: microphone chunks streamed to the channel
//! - events: inbound channel events (audio, transcript, tool calls)
//! - playback: decoded agent audio placed on the speaker timeline
//!
//! Every exit path (explicit end, finalize, channel loss, protocol
//! violation, setup failure) goes through one teardown that runs exactly once
//! and releases the microphone, speaker, camera and channel together.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::errors::{SessionError, SessionResult};
use super::state::{SessionState, SessionStatus};
use super::transcript::{Transcript, TranscriptTurn, TranscriptUpdate};
use crate::core::capture::{AudioCaptureEngine, AudioChunk, CaptureConfig};
use crate::core::channel::{
    ChannelEvent, ConnectRetryConfig, ConversationChannel, EventReceiver, Speaker,
    ToolCallRequest, ToolCallResponse, WireAudio, open_with_retry,
};
use crate::core::codec;
use crate::core::evidence::{EvidenceCaptureCoordinator, EvidenceConfig, EvidenceError};
use crate::core::playback::AudioPlaybackScheduler;
use crate::core::tools::{
    ConsultationRecord, DEFAULT_GREETING, DispatchOutcome, Resolution, ToolCallDispatcher,
};
use crate::devices::{DeviceError, MediaBackend, MediaDevices};

/// Decoded buffers waiting for the playback activity.
const PLAYBACK_QUEUE_CAPACITY: usize = 256;

/// Called once with the merged record when the agent finalizes.
pub type FinalPayloadCallback =
    Arc<dyn Fn(ConsultationRecord) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Called on every transcript change.
pub type TranscriptCallback =
    Arc<dyn Fn(TranscriptUpdate) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub capture: CaptureConfig,
    pub evidence: EvidenceConfig,
    pub connect_retry: ConnectRetryConfig,
    /// Text turn sent once connected so the agent speaks first
    pub greeting: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            evidence: EvidenceConfig::default(),
            connect_retry: ConnectRetryConfig::default(),
            greeting: DEFAULT_GREETING.to_string(),
        }
    }
}

// =============================================================================
// Shared state
// =============================================================================

struct Lifecycle {
    state: SessionState,
    transitions: Vec<SessionState>,
    teardown_claimed: bool,
}

/// Everything teardown has to release.
#[derive(Default)]
struct Resources {
    devices: Option<MediaDevices>,
    engine: Option<Arc<AudioCaptureEngine>>,
    scheduler: Option<Arc<Mutex<AudioPlaybackScheduler>>>,
    dispatcher: Option<Arc<ToolCallDispatcher>>,
}

struct PlaybackJob {
    samples: Vec<i16>,
    sample_rate: u32,
    generation: u64,
}

/// What the event activity needs besides the shared state.
struct EventContext {
    dispatcher: Arc<ToolCallDispatcher>,
    scheduler: Arc<Mutex<AudioPlaybackScheduler>>,
    playback: mpsc::Sender<PlaybackJob>,
    recording_message: String,
}

struct Shared {
    id: String,
    channel: Arc<dyn ConversationChannel>,
    lifecycle: Mutex<Lifecycle>,
    status: watch::Sender<SessionStatus>,
    resources: Mutex<Resources>,
    transcript: Mutex<Transcript>,
    cancel: CancellationToken,
    on_final_payload: Mutex<Option<FinalPayloadCallback>>,
    on_transcript: Mutex<Option<TranscriptCallback>>,
    final_record: Mutex<Option<ConsultationRecord>>,
    finalized: AtomicBool,
}

impl Shared {
    fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    /// Move to `to` and publish the new status. Illegal moves are ignored.
    fn transition(
        &self,
        to: SessionState,
        message: impl Into<String>,
        error: Option<SessionError>,
    ) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let from = lifecycle.state;
        if !from.can_transition_to(to) {
            debug!(session_id = %self.id, %from, %to, "Ignoring illegal transition");
            return false;
        }
        lifecycle.state = to;
        lifecycle.transitions.push(to);
        self.status.send_replace(SessionStatus {
            state: to,
            message: message.into(),
            error,
        });
        info!(session_id = %self.id, %from, %to, "Session state changed");
        true
    }

    /// Replace the status line while active.
    fn set_message(&self, message: &str) {
        self.status.send_if_modified(|status| {
            if status.state == SessionState::Active && status.message != message {
                status.message = message.to_string();
                true
            } else {
                false
            }
        });
    }

    /// First caller wins the right to tear down.
    fn claim_teardown(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        !std::mem::replace(&mut lifecycle.teardown_claimed, true)
    }

    fn teardown_claimed(&self) -> bool {
        self.lifecycle.lock().teardown_claimed
    }

    /// Fail the session: `Errored`, then teardown. No-op once teardown began.
    async fn fail(&self, error: SessionError) {
        if !self.claim_teardown() {
            debug!(session_id = %self.id, error = %error, "Error during teardown ignored");
            return;
        }
        error!(session_id = %self.id, kind = ?error.kind(), error = %error, "Session failed");
        self.transition(SessionState::Errored, error.to_string(), Some(error));
        self.teardown().await;
    }

    /// Stop every activity, release everything, and close. Callers must hold
    /// the teardown claim.
    async fn teardown(&self) {
        self.shut_down().await;
        self.close_out();
    }

    async fn shut_down(&self) {
        self.cancel.cancel();
        self.release().await;
    }

    /// Publish `Closed`, keeping any error already in the status.
    fn close_out(&self) {
        let (message, error) = {
            let status = self.status.borrow();
            match &status.error {
                Some(error) => (status.message.clone(), Some(error.clone())),
                None => (SessionState::Closed.default_message().to_string(), None),
            }
        };
        self.transition(SessionState::Closed, message, error);
    }

    /// Release whatever is held. Safe to call more than once.
    async fn release(&self) {
        let resources = std::mem::take(&mut *self.resources.lock());

        if let Some(engine) = resources.engine {
            engine.stop();
        }
        if let Some(scheduler) = resources.scheduler {
            scheduler.lock().stop();
        }
        if let Some(devices) = resources.devices {
            devices.close_all();
        }
        if let Some(dispatcher) = resources.dispatcher {
            let outstanding = dispatcher.outstanding();
            if outstanding > 0 {
                warn!(session_id = %self.id, outstanding, "Closing with unanswered tool calls");
            }
        }
        self.channel.close().await;
        debug!(session_id = %self.id, "Session resources released");
    }

    async fn emit_transcript(&self, update: TranscriptUpdate) {
        let callback = self.on_transcript.lock().clone();
        if let Some(callback) = callback {
            callback(update).await;
        }
    }

    async fn seal_turn(&self, speaker: Speaker, interrupted: bool) {
        let update = self.transcript.lock().seal(speaker, interrupted);
        if let Some(update) = update {
            self.emit_transcript(update).await;
        }
    }

    /// Send a tool response if the ledger allows it.
    async fn respond(
        &self,
        dispatcher: &ToolCallDispatcher,
        response: ToolCallResponse,
    ) -> SessionResult<()> {
        match dispatcher.settle(&response)? {
            Resolution::Withdrawn => Ok(()),
            Resolution::Send => {
                debug!(session_id = %self.id, call_id = %response.id, "Sending tool response");
                self.channel
                    .send_tool_response(response)
                    .await
                    .map_err(|e| SessionError::ChannelClosedUnexpectedly(e.to_string()))
            }
        }
    }

    async fn play(&self, ctx: &EventContext, wire: WireAudio) {
        let samples = match codec::decode(&wire.data) {
            Ok(samples) => samples,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Dropping malformed audio frame");
                return;
            }
        };
        // Stamped on arrival so an interrupt also covers buffers still queued.
        let generation = ctx.scheduler.lock().generation();
        let job = PlaybackJob {
            samples,
            sample_rate: wire.sample_rate,
            generation,
        };
        if ctx.playback.send(job).await.is_err() {
            debug!(session_id = %self.id, "Playback stopped, dropping audio");
        }
    }

    /// Returns `true` when the event activity must stop.
    async fn handle_tool_call(self: &Arc<Self>, ctx: &EventContext, request: ToolCallRequest) -> bool {
        if self.state() != SessionState::Active {
            debug!(session_id = %self.id, call_id = %request.id, "Ignoring tool call outside active state");
            return false;
        }

        let still = ToolCallDispatcher::still_requested(&request);
        if let Some(modality) = still {
            self.set_message(&format!("Capturing {}...", modality.label()));
        }

        // Still capture encodes a JPEG; keep it off the event path.
        let dispatcher = ctx.dispatcher.clone();
        let dispatched = tokio::task::spawn_blocking(move || dispatcher.dispatch(&request)).await;
        if still.is_some() {
            self.set_message(SessionState::Active.default_message());
        }

        let outcome = match dispatched {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                self.fail(e.into()).await;
                return true;
            }
            Err(e) => {
                self.fail(EvidenceError::Encoding(e.to_string()).into()).await;
                return true;
            }
        };

        match outcome {
            DispatchOutcome::Respond(response) => {
                if let Err(e) = self.respond(&ctx.dispatcher, response).await {
                    self.fail(e).await;
                    return true;
                }
                false
            }
            DispatchOutcome::Deferred(pending) => {
                self.set_message(&ctx.recording_message);
                let shared = self.clone();
                let dispatcher = ctx.dispatcher.clone();
                tokio::spawn(async move {
                    let response = tokio::select! {
                        _ = shared.cancel.cancelled() => return,
                        response = pending => response,
                    };
                    shared.set_message(SessionState::Active.default_message());
                    if let Err(e) = shared.respond(&dispatcher, response).await
                        && !shared.cancel.is_cancelled()
                    {
                        shared.fail(e).await;
                    }
                });
                false
            }
            DispatchOutcome::Finalize(record) => {
                self.finalize(record).await;
                true
            }
        }
    }

    async fn finalize(&self, record: ConsultationRecord) {
        if !self.claim_teardown() {
            warn!(session_id = %self.id, "Finalize arrived during teardown, dropping record");
            return;
        }
        self.transition(SessionState::Ending, SessionState::Ending.default_message(), None);
        self.shut_down().await;

        // Delivered before `Closed` so anyone waiting for close sees the record.
        *self.final_record.lock() = Some(record.clone());
        if !self.finalized.swap(true, Ordering::SeqCst) {
            let callback = self.on_final_payload.lock().clone();
            match callback {
                Some(callback) => callback(record).await,
                None => warn!(session_id = %self.id, "No final payload callback registered"),
            }
        }
        self.close_out();
    }
}

// =============================================================================
// Activities
// =============================================================================

async fn run_events(shared: Arc<Shared>, mut events: EventReceiver, ctx: EventContext) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            event = events.recv() => event,
        };

        let Some(event) = event else {
            shared
                .fail(SessionError::ChannelClosedUnexpectedly(
                    "inbound stream ended".to_string(),
                ))
                .await;
            break;
        };

        match event {
            ChannelEvent::Audio(wire) => shared.play(&ctx, wire).await,
            ChannelEvent::TranscriptDelta { speaker, text } => {
                let update = shared.transcript.lock().append(speaker, &text);
                shared.emit_transcript(update).await;
            }
            ChannelEvent::TurnComplete(speaker) => shared.seal_turn(speaker, false).await,
            ChannelEvent::Interrupted => {
                let generation = ctx.scheduler.lock().interrupt();
                debug!(session_id = %shared.id, generation, "Barge-in");
                shared.seal_turn(Speaker::Remote, true).await;
            }
            ChannelEvent::ToolCall(request) => {
                if shared.handle_tool_call(&ctx, request).await {
                    break;
                }
            }
            ChannelEvent::ToolCallCancelled(ids) => {
                info!(session_id = %shared.id, ?ids, "Agent withdrew tool calls");
                ctx.dispatcher.cancel(&ids);
            }
            ChannelEvent::Closed(reason) => {
                shared
                    .fail(SessionError::ChannelClosedUnexpectedly(reason))
                    .await;
                break;
            }
            ChannelEvent::Error(e) => {
                shared
                    .fail(SessionError::ChannelClosedUnexpectedly(e.to_string()))
                    .await;
                break;
            }
        }
    }
    debug!(session_id = %shared.id, "Event activity ended");
}

async fn run_playback(
    shared: Arc<Shared>,
    scheduler: Arc<Mutex<AudioPlaybackScheduler>>,
    mut jobs: mpsc::Receiver<PlaybackJob>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            job = jobs.recv() => job,
        };
        let Some(job) = job else { break };

        let result = scheduler
            .lock()
            .enqueue(&job.samples, job.sample_rate, job.generation);
        if let Err(e) = result {
            if shared.cancel.is_cancelled() {
                debug!(session_id = %shared.id, error = %e, "Playback device released");
            } else {
                shared.fail(SessionError::DeviceUnavailable(e)).await;
            }
            break;
        }
    }
}

/// Fail the session if the microphone goes away while capturing.
async fn watch_capture(shared: Arc<Shared>, input_lost: CancellationToken) {
    tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {}
        _ = input_lost.cancelled() => {
            shared
                .fail(SessionError::DeviceUnavailable(DeviceError::Unavailable(
                    "microphone stream ended".to_string(),
                )))
                .await;
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// One consultation attempt. Never reused: start a new `Session` to retry.
pub struct Session {
    shared: Arc<Shared>,
    backend: Arc<dyn MediaBackend>,
    config: SessionConfig,
    started_at: Mutex<Option<OffsetDateTime>>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn MediaBackend>,
        channel: Arc<dyn ConversationChannel>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            shared: Arc::new(Shared {
                id: uuid::Uuid::new_v4().to_string(),
                channel,
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Idle,
                    transitions: vec![SessionState::Idle],
                    teardown_claimed: false,
                }),
                status,
                resources: Mutex::new(Resources::default()),
                transcript: Mutex::new(Transcript::new()),
                cancel: CancellationToken::new(),
                on_final_payload: Mutex::new(None),
                on_transcript: Mutex::new(None),
                final_record: Mutex::new(None),
                finalized: AtomicBool::new(false),
            }),
            backend,
            config,
            started_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn started_at(&self) -> Option<OffsetDateTime> {
        *self.started_at.lock()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Every state this session has been in, in order.
    pub fn transitions(&self) -> Vec<SessionState> {
        self.shared.lifecycle.lock().transitions.clone()
    }

    pub fn transcript(&self) -> Vec<TranscriptTurn> {
        self.shared.transcript.lock().snapshot()
    }

    /// The record handed over at finalize, if the agent finalized.
    pub fn final_record(&self) -> Option<ConsultationRecord> {
        self.shared.final_record.lock().clone()
    }

    pub fn on_final_payload(&self, callback: FinalPayloadCallback) {
        *self.shared.on_final_payload.lock() = Some(callback);
    }

    pub fn on_transcript(&self, callback: TranscriptCallback) {
        *self.shared.on_transcript.lock() = Some(callback);
    }

    fn ended_during(&self, action: &'static str) -> SessionError {
        SessionError::InvalidState {
            action,
            state: self.state(),
        }
    }

    /// Acquire the devices, open the channel and start the conversation.
    ///
    /// Any failure leaves the session closed with the error in its status.
    pub async fn start(&self) -> SessionResult<()> {
        let shared = &self.shared;
        if !shared.transition(
            SessionState::PermissionPending,
            SessionState::PermissionPending.default_message(),
            None,
        ) {
            return Err(self.ended_during("start"));
        }
        *self.started_at.lock() = Some(OffsetDateTime::now_utc());
        info!(session_id = %shared.id, "Starting consultation session");

        let devices = match self.backend.acquire().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(session_id = %shared.id, error = %e, "Device acquisition failed");
                let error = SessionError::from(e);
                shared.fail(error.clone()).await;
                return Err(error);
            }
        };
        let microphone = devices.microphone.clone();
        let speaker = devices.speaker.clone();
        let camera = devices.camera.clone();
        shared.resources.lock().devices = Some(devices);

        if !shared.transition(
            SessionState::Connecting,
            SessionState::Connecting.default_message(),
            None,
        ) {
            shared.release().await;
            return Err(self.ended_during("start"));
        }

        let events = match open_with_retry(shared.channel.as_ref(), &self.config.connect_retry).await
        {
            Ok(events) => events,
            Err(e) => {
                let error = SessionError::ChannelOpenFailed(e);
                shared.fail(error.clone()).await;
                return Err(error);
            }
        };
        if shared.teardown_claimed() {
            shared.release().await;
            return Err(self.ended_during("start"));
        }

        let engine = Arc::new(AudioCaptureEngine::new(
            microphone,
            self.config.capture.clone(),
        ));
        let coordinator = Arc::new(EvidenceCaptureCoordinator::new(
            camera,
            engine.tap(),
            self.config.evidence.clone(),
        ));
        let dispatcher = Arc::new(ToolCallDispatcher::new(coordinator));
        let scheduler = Arc::new(Mutex::new(AudioPlaybackScheduler::new(speaker)));
        {
            let mut resources = shared.resources.lock();
            resources.engine = Some(engine.clone());
            resources.scheduler = Some(scheduler.clone());
            resources.dispatcher = Some(dispatcher.clone());
        }

        if !shared.transition(
            SessionState::Active,
            SessionState::Active.default_message(),
            None,
        ) {
            shared.release().await;
            return Err(self.ended_during("start"));
        }

        let (playback_tx, playback_rx) = mpsc::channel(PLAYBACK_QUEUE_CAPACITY);
        tokio::spawn(run_playback(shared.clone(), scheduler.clone(), playback_rx));

        let recording_secs = self.config.evidence.cough_duration_ms as f64 / 1000.0;
        tokio::spawn(run_events(
            shared.clone(),
            events,
            EventContext {
                dispatcher,
                scheduler,
                playback: playback_tx,
                recording_message: format!("Recording cough for {recording_secs}s..."),
            },
        ));

        let channel = shared.channel.clone();
        let started = engine.start(Arc::new(move |chunk: AudioChunk| {
            let channel = channel.clone();
            Box::pin(async move {
                if let Err(e) = channel.send_audio(&chunk).await {
                    debug!(error = %e, "Dropping captured chunk");
                }
            })
        }));
        if let Err(e) = started {
            let error = SessionError::from(e);
            shared.fail(error.clone()).await;
            return Err(error);
        }
        tokio::spawn(watch_capture(shared.clone(), engine.input_lost()));

        if let Err(e) = shared.channel.send_text(&self.config.greeting).await {
            let error = SessionError::ChannelClosedUnexpectedly(e.to_string());
            shared.fail(error.clone()).await;
            return Err(error);
        }

        info!(
            session_id = %shared.id,
            provider = %shared.channel.provider_info()["provider"],
            "Consultation session active"
        );
        Ok(())
    }

    /// End the session and release everything. Idempotent; a call that
    /// races another teardown waits for it to finish.
    pub async fn end(&self) {
        let shared = &self.shared;
        if shared.claim_teardown() {
            info!(session_id = %shared.id, "Ending session on request");
            shared.transition(
                SessionState::Ending,
                SessionState::Ending.default_message(),
                None,
            );
            shared.teardown().await;
        } else {
            self.wait_closed().await;
        }
    }

    /// Wait until the session reaches `Closed`.
    pub async fn wait_closed(&self) -> SessionStatus {
        let mut rx = self.subscribe();
        match rx.wait_for(|status| status.state == SessionState::Closed).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.shared.claim_teardown() {
            // Dropped without end(): release what can be released synchronously.
            self.shared.cancel.cancel();
            let resources = std::mem::take(&mut *self.shared.resources.lock());
            if let Some(engine) = resources.engine {
                engine.stop();
            }
            if let Some(scheduler) = resources.scheduler {
                scheduler.lock().stop();
            }
            if let Some(devices) = resources.devices {
                devices.close_all();
            }
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let channel = self.shared.channel.clone();
                handle.spawn(async move { channel.close().await });
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
