//! The replay engine.
//!
//! [`ReplayEngine`] owns the session, the event buffer, the mode controller
//! and the flush scheduler. All of that state sits behind one mutex that is
//! never held across an `.await` or while calling into the capture library:
//! the library calls back into the engine synchronously, so every method
//! collects the capture calls it needs as [`Effect`]s and runs them after the
//! lock is released.
//!
//! Nothing here returns an error to the embedding application. Failures are
//! logged and the engine stops, which shows up as `is_enabled() == false`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::buffer::{BufferError, EventBuffer, FinalizedEvents, encode_payload};
use crate::capture::{CaptureConfig, CaptureLibrary, CaptureObserver};
use crate::clock::{Clock, SystemClock};
use crate::event::{Breadcrumb, OptionsFrame, RecordingEvent, ReplayEvent};
use crate::mode::{ErrorOutcome, ModeController, RandomSampler, SampleRates, Sampler};
use crate::options::ReplayOptions;
use crate::scheduler::FlushScheduler;
use crate::session::{
    Session, SessionOptions, SessionStore, SessionTimeouts, clear_session, load_or_create_session,
    save_session, should_refresh_session,
};
use crate::transport::{SegmentUpload, Transport, TransportError};
use crate::types::{RecordingMode, ReplayId, SampleDecision};

/// Extra time past the maximum duration after which a flush is skipped.
const TOO_LONG_GRACE_MS: i64 = 5_000;

/// Extra time past the maximum duration after which a flush stops the replay.
const STALE_FLUSH_GRACE_MS: i64 = 30_000;

/// Poll interval of [`ReplayEngine::run_timers`] when nothing is scheduled.
const IDLE_TIMER_POLL: StdDuration = StdDuration::from_secs(1);

/// Errors raised while producing or sending a segment.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    NotStarted,
    Recording,
    Paused,
    /// Terminal.
    Stopped,
}

impl EngineStatus {
    /// Recording or paused.
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Recording | Self::Paused)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the engine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Manual,
    MutationLimit,
    BufferError,
    SendError,
    StaleFlush,
    BufferFlushed,
}

impl StopReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::MutationLimit => "mutation_limit",
            Self::BufferError => "buffer_error",
            Self::SendError => "send_error",
            Self::StaleFlush => "stale_flush",
            Self::BufferFlushed => "buffer_flushed",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Page visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Options for [`ReplayEngine::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOptions {
    /// After flushing a buffered replay, keep recording as a session replay
    /// instead of stopping.
    pub continue_recording: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            continue_recording: true,
        }
    }
}

/// Capture library calls deferred until the state lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    StartCapture(RecordingMode),
    StopCapture,
}

/// Ids and URLs collected since the last segment.
#[derive(Debug, Default, Clone)]
struct EventContext {
    error_ids: Vec<String>,
    trace_ids: Vec<String>,
    urls: Vec<String>,
}

impl EventContext {
    fn push_unique(list: &mut Vec<String>, value: String) {
        if !list.contains(&value) {
            list.push(value);
        }
    }

    fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Puts the context of an undelivered segment back in front.
    fn restore(&mut self, older: Self) {
        for (list, mut older) in [
            (&mut self.error_ids, older.error_ids),
            (&mut self.trace_ids, older.trace_ids),
            (&mut self.urls, older.urls),
        ] {
            older.retain(|value| !list.contains(value));
            older.append(list);
            *list = older;
        }
    }
}

/// A segment cut from the buffer but not yet sent.
#[derive(Debug)]
struct PendingSegment {
    replay_id: ReplayId,
    segment_id: u32,
    mode: RecordingMode,
    timestamp: DateTime<Utc>,
    replay_start_timestamp: Option<DateTime<Utc>>,
    context: EventContext,
}

#[derive(Debug)]
struct EngineState {
    status: EngineStatus,
    session: Option<Session>,
    buffer: EventBuffer,
    controller: ModeController,
    scheduler: FlushScheduler,
    context: EventContext,
    /// Start of the captured content; late events and stale flushes are
    /// measured from here.
    initial_timestamp: DateTime<Utc>,
    last_user_activity: DateTime<Utc>,
    /// The next emit is the first since capture (re)started.
    awaiting_first_emit: bool,
    /// Stopped, but the buffer still has to go out once.
    pending_final_flush: bool,
}

impl EngineState {
    fn new(options: &ReplayOptions, now: DateTime<Utc>) -> Self {
        Self {
            status: EngineStatus::NotStarted,
            session: None,
            buffer: EventBuffer::new(options.max_buffer_size_bytes),
            controller: ModeController::new(SampleRates::new(
                options.session_sample_rate,
                options.error_sample_rate,
            )),
            scheduler: FlushScheduler::new(
                options.flush_min_delay(),
                options.flush_max_delay(),
                options.buffer_checkout_interval(),
            ),
            context: EventContext::default(),
            initial_timestamp: now,
            last_user_activity: now,
            awaiting_first_emit: false,
            pending_final_flush: false,
        }
    }

    fn mode(&self) -> RecordingMode {
        self.controller.mode()
    }
}

/// Builds a [`ReplayEngine`].
pub struct ReplayEngineBuilder {
    options: ReplayOptions,
    capture: Arc<dyn CaptureLibrary>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    sampler: Arc<dyn Sampler>,
    store: Option<Arc<dyn SessionStore>>,
}

impl ReplayEngineBuilder {
    /// Time source. Defaults to [`SystemClock`].
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sampling source. Defaults to [`RandomSampler`].
    #[must_use]
    pub fn sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Store for sticky sessions. Without one, sessions live in memory only.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Arc<ReplayEngine> {
        let options = self.options.normalized();
        let now = self.clock.now();
        Arc::new_cyclic(|this| ReplayEngine {
            this: this.clone(),
            state: Mutex::new(EngineState::new(&options, now)),
            options,
            clock: self.clock,
            sampler: self.sampler,
            store: self.store,
            capture: self.capture,
            transport: self.transport,
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }
}

/// Records a page into segments and ships them through a [`Transport`].
pub struct ReplayEngine {
    this: Weak<Self>,
    options: ReplayOptions,
    clock: Arc<dyn Clock>,
    sampler: Arc<dyn Sampler>,
    store: Option<Arc<dyn SessionStore>>,
    capture: Arc<dyn CaptureLibrary>,
    transport: Arc<dyn Transport>,
    state: Mutex<EngineState>,
    /// Held for the whole of a flush so only one is ever in flight.
    flush_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ReplayEngine")
            .field("status", &state.status)
            .field("mode", &state.mode())
            .field("session", &state.session)
            .field("buffered_events", &state.buffer.len())
            .finish_non_exhaustive()
    }
}

impl ReplayEngine {
    pub fn builder(
        options: ReplayOptions,
        capture: Arc<dyn CaptureLibrary>,
        transport: Arc<dyn Transport>,
    ) -> ReplayEngineBuilder {
        ReplayEngineBuilder {
            options,
            capture,
            transport,
            clock: Arc::new(SystemClock),
            sampler: Arc::new(RandomSampler),
            store: None,
        }
    }

    // Lifecycle

    /// Loads or creates the session and starts recording in whatever mode
    /// sampling picks. A sampled-out session leaves the engine disabled.
    pub fn start(&self) {
        self.initialize(None);
    }

    /// Starts a session recording regardless of the sample rates.
    pub fn start_session(&self) {
        self.initialize(Some(RecordingMode::Session));
    }

    /// Starts buffering regardless of the sample rates.
    pub fn start_buffering(&self) {
        self.initialize(Some(RecordingMode::Buffer));
    }

    /// Stops recording for good and drops whatever is buffered. Idempotent.
    pub fn stop(&self) {
        let mut effects = Vec::new();
        {
            let mut state = self.lock();
            self.stop_locked(&mut state, StopReason::Manual, false, &mut effects);
        }
        self.apply(effects);
    }

    /// Stops recording, sending what is buffered first.
    pub async fn stop_and_flush(&self) {
        let mut effects = Vec::new();
        {
            let mut state = self.lock();
            self.stop_locked(&mut state, StopReason::Manual, true, &mut effects);
        }
        self.apply(effects);
        self.final_flush().await;
    }

    /// Suspends capture. Buffered events stay; nothing new is recorded.
    pub fn pause(&self) {
        let mut effects = Vec::new();
        {
            let mut state = self.lock();
            self.pause_locked(&mut state, &mut effects);
        }
        self.apply(effects);
    }

    /// Resumes a paused replay with a fresh checkout, or starts a new
    /// session if the old one expired meanwhile.
    pub fn resume(&self) {
        let now = self.clock.now();
        let mut effects = Vec::new();
        {
            let mut state = self.lock();
            if state.status == EngineStatus::Paused
                && self.check_session_locked(&mut state, now, &mut effects)
            {
                self.resume_locked(&mut state, &mut effects);
            }
        }
        self.apply(effects);
    }

    // Events

    /// Appends a custom event (breadcrumb, span, ...) and records session
    /// activity. Returns whether the event was buffered.
    pub fn add_event(&self, event: impl Into<ReplayEvent>) -> bool {
        let now = self.clock.now();
        let mut effects = Vec::new();
        let added = {
            let mut state = self.lock();
            let added = self.append_locked(&mut state, event.into(), now, &mut effects);
            if added {
                let timeouts = self.timeouts();
                if let Some(session) = state.session.as_mut() {
                    if !should_refresh_session(session, timeouts, now) {
                        session.touch(now);
                    }
                }
                self.save(&state);
            }
            added
        };
        self.apply(effects);
        added
    }

    /// Appends an event that has to go out right away, skipping the debounce.
    pub async fn add_priority_event(&self, event: impl Into<ReplayEvent>) -> bool {
        let added = self.add_event(event);
        if added && self.recording_mode() == Some(RecordingMode::Session) {
            self.flush_now(false).await;
        }
        added
    }

    /// Reports a captured error.
    ///
    /// The id rides along with the next segment. In buffer mode the error
    /// sample rate is drawn; a hit sends the buffer and switches to session
    /// mode.
    pub async fn capture_error(&self, error_id: impl Into<String>) {
        let error_id = error_id.into();
        let outcome = {
            let mut state = self.lock();
            if !state.status.is_enabled() {
                return;
            }
            EventContext::push_unique(&mut state.context.error_ids, error_id.clone());
            state.controller.on_error(self.sampler.as_ref())
        };

        match outcome {
            ErrorOutcome::Attach => tracing::debug!(error_id = %error_id, "error attached to replay"),
            ErrorOutcome::SampledOut => {
                tracing::debug!(error_id = %error_id, "error not sampled, still buffering");
            }
            ErrorOutcome::Promote => {
                tracing::info!(error_id = %error_id, "error sampled, sending buffered replay");
                self.send_buffered(true).await;
            }
        }
    }

    /// Attaches a trace id to the next segment.
    pub fn add_trace_id(&self, trace_id: impl Into<String>) {
        let mut state = self.lock();
        if state.status.is_enabled() {
            EventContext::push_unique(&mut state.context.trace_ids, trace_id.into());
        }
    }

    /// Attaches a visited URL to the next segment.
    pub fn add_url(&self, url: impl Into<String>) {
        let mut state = self.lock();
        if state.status.is_enabled() {
            EventContext::push_unique(&mut state.context.urls, url.into());
        }
    }

    // Flushing

    /// Sends what is buffered.
    ///
    /// In session mode this is an immediate flush. In buffer mode the buffer
    /// is sent and the replay either continues as a session replay or stops,
    /// depending on `options`. Resolves once the send attempt finished; a
    /// call made while a flush is in flight waits for that one instead.
    pub async fn flush(&self, options: FlushOptions) {
        match self.recording_mode() {
            Some(RecordingMode::Session) => self.flush_now(false).await,
            Some(RecordingMode::Buffer) => self.send_buffered(options.continue_recording).await,
            None => {}
        }
    }

    /// Runs whatever is due: a pending final flush, a buffer checkout or the
    /// debounced flush.
    pub async fn tick(&self) {
        let now = self.clock.now();
        let (final_flush, checkout, flush) = {
            let mut state = self.lock();
            if state.pending_final_flush {
                (true, false, false)
            } else {
                let checkout = state.status == EngineStatus::Recording
                    && state.mode() == RecordingMode::Buffer
                    && state.scheduler.take_checkout_due(now);
                let flush =
                    state.status == EngineStatus::Recording && state.scheduler.take_due(now);
                (false, checkout, flush)
            }
        };

        if final_flush {
            self.final_flush().await;
            return;
        }
        if checkout {
            tracing::debug!("taking buffer checkout");
            self.capture.take_full_snapshot(true);
        }
        if flush {
            self.flush_now(false).await;
        }
    }

    /// Next time [`tick`](Self::tick) has work to do.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        let state = self.lock();
        if state.pending_final_flush {
            return Some(self.clock.now());
        }
        if state.status != EngineStatus::Recording {
            return None;
        }
        state.scheduler.next_wakeup()
    }

    /// Drives [`tick`](Self::tick) off the tokio timer until the engine stops.
    pub async fn run_timers(&self) {
        loop {
            let finished = {
                let state = self.lock();
                state.status == EngineStatus::Stopped && !state.pending_final_flush
            };
            if finished {
                break;
            }

            let now = self.clock.now();
            let wait = self
                .next_wakeup()
                .map_or(IDLE_TIMER_POLL, |at| (at - now).to_std().unwrap_or_default());
            tokio::time::sleep(wait.min(IDLE_TIMER_POLL)).await;
            self.tick().await;
        }
    }

    // Page signals

    pub fn on_visibility_change(&self, visibility: Visibility) {
        match visibility {
            Visibility::Hidden => self.to_background(None),
            Visibility::Visible => self.to_foreground(None),
        }
    }

    pub fn on_blur(&self) {
        self.to_background(Some(Breadcrumb::new("ui.blur", self.clock.now())));
    }

    pub fn on_focus(&self) {
        self.to_foreground(Some(Breadcrumb::new("ui.focus", self.clock.now())));
    }

    /// Registers a user interaction such as a click.
    ///
    /// Resumes a paused replay with a new checkout, starting a new session
    /// if the old one expired.
    pub fn trigger_user_activity(&self) {
        let now = self.clock.now();
        let mut effects = Vec::new();
        {
            let mut state = self.lock();
            if !state.status.is_enabled() {
                return;
            }

            if self.idle_too_long(&state, now) {
                self.pause_locked(&mut state, &mut effects);
            }
            state.last_user_activity = now;

            let active = self.check_session_locked(&mut state, now, &mut effects);
            if active {
                if state.status == EngineStatus::Paused {
                    self.resume_locked(&mut state, &mut effects);
                }
                if let Some(session) = state.session.as_mut() {
                    session.touch(now);
                }
                self.save(&state);
            }
        }
        self.apply(effects);
    }

    /// Registers a user interaction that should not resume a paused replay,
    /// such as a key press.
    pub fn update_user_activity(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.status.is_enabled() {
            state.last_user_activity = now;
        }
    }

    // Configuration and inspection

    pub fn set_sample_rates(&self, rates: SampleRates) {
        self.lock().controller.set_rates(rates);
    }

    pub fn set_error_sample_rate(&self, rate: f64) {
        let mut state = self.lock();
        let session = state.controller.rates().session;
        state.controller.set_rates(SampleRates::new(session, rate));
    }

    pub fn sample_rates(&self) -> SampleRates {
        self.lock().controller.rates()
    }

    pub const fn options(&self) -> &ReplayOptions {
        &self.options
    }

    pub fn status(&self) -> EngineStatus {
        self.lock().status
    }

    pub fn is_enabled(&self) -> bool {
        self.status().is_enabled()
    }

    pub fn is_paused(&self) -> bool {
        self.status() == EngineStatus::Paused
    }

    /// The id of the replay being recorded.
    pub fn replay_id(&self) -> Option<ReplayId> {
        let state = self.lock();
        if !state.status.is_enabled() {
            return None;
        }
        state.session.as_ref().map(|session| session.id.clone())
    }

    /// A copy of the current session, recording or not.
    pub fn session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    pub fn recording_mode(&self) -> Option<RecordingMode> {
        let state = self.lock();
        state.status.is_enabled().then(|| state.mode())
    }

    pub fn buffered_event_count(&self) -> usize {
        self.lock().buffer.len()
    }

    // Internals

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            idle_expire: self.options.session_idle_expire(),
            max_replay_duration: self.options.max_replay_duration(),
        }
    }

    fn sticky_store(&self) -> Option<&dyn SessionStore> {
        self.store
            .as_deref()
            .filter(|_| self.options.sticky_session)
    }

    fn persist(&self, session: &Session) {
        let Some(store) = self.sticky_store() else {
            return;
        };
        if let Err(e) = save_session(store, session) {
            tracing::warn!(error = %e, replay_id = %session.id, "failed to persist session");
        }
    }

    fn clear_persisted(&self) {
        if let Some(store) = self.sticky_store() {
            if let Err(e) = clear_session(store) {
                tracing::warn!(error = %e, "failed to clear persisted session");
            }
        }
    }

    fn save(&self, state: &EngineState) {
        if state.status == EngineStatus::Stopped {
            return;
        }
        if let Some(session) = &state.session {
            self.persist(session);
        }
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartCapture(mode) => {
                    let observer: Weak<dyn CaptureObserver> = self.this.clone();
                    self.capture.start(observer, CaptureConfig { mode });
                }
                Effect::StopCapture => self.capture.stop(),
            }
        }
    }

    fn initialize(&self, forced: Option<RecordingMode>) {
        let now = self.clock.now();
        let mut effects = Vec::new();
        {
            let mut state = self.lock();
            match state.status {
                EngineStatus::Recording | EngineStatus::Paused => {
                    tracing::warn!(mode = %state.mode(), "replay is already in progress");
                    return;
                }
                EngineStatus::Stopped => {
                    tracing::debug!("replay was stopped and cannot be restarted");
                    return;
                }
                EngineStatus::NotStarted => {}
            }
            self.begin_session(&mut state, forced, None, now, &mut effects);
        }
        self.apply(effects);
    }

    fn begin_session(
        &self,
        state: &mut EngineState,
        forced: Option<RecordingMode>,
        previous_session_id: Option<ReplayId>,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let allow_buffering = state.controller.rates().error > 0.0;
        let controller = &state.controller;
        let sampler = self.sampler.as_ref();
        let mut session = load_or_create_session(
            self.store.as_deref(),
            SessionOptions {
                sticky: self.options.sticky_session,
            },
            self.timeouts(),
            previous_session_id,
            now,
            || match forced {
                Some(mode) => SampleDecision::from(mode),
                None => controller.sample_new_session(sampler, allow_buffering),
            },
        );

        let mode = if let Some(mode) = forced {
            if session.sampled == SampleDecision::Session && mode == RecordingMode::Buffer {
                // Sessions never go back to buffering; only this page buffers.
                tracing::debug!(
                    replay_id = %session.id,
                    "buffering a session-sampled replay without changing its decision"
                );
            } else if session.sampled != SampleDecision::from(mode) {
                session.sampled = SampleDecision::from(mode);
                self.persist(&session);
            }
            state.controller.force(mode);
            mode
        } else if let Some(mode) = state.controller.resolve(&session) {
            mode
        } else {
            tracing::debug!(replay_id = %session.id, "session not sampled, replay stays disabled");
            state.session = Some(session);
            return;
        };

        if mode == RecordingMode::Session && session.sampled == SampleDecision::Buffer {
            tracing::info!(
                replay_id = %session.id,
                segment_id = session.segment_id,
                "resuming buffered replay with an unconfirmed flush as session"
            );
            session.sampled = SampleDecision::Session;
            self.persist(&session);
        }

        tracing::info!(
            replay_id = %session.id,
            mode = %mode,
            segment_id = session.segment_id,
            "replay started"
        );
        state.session = Some(session);
        state.status = EngineStatus::Recording;
        state.buffer = EventBuffer::new(self.options.max_buffer_size_bytes);
        state.scheduler.reset();
        state.context = EventContext::default();
        state.initial_timestamp = now;
        state.last_user_activity = now;
        state.pending_final_flush = false;
        Self::start_capture(state, mode, effects);
    }

    fn start_capture(state: &mut EngineState, mode: RecordingMode, effects: &mut Vec<Effect>) {
        state.awaiting_first_emit = true;
        state.scheduler.cancel_checkout();
        effects.push(Effect::StartCapture(mode));
    }

    fn stop_locked(
        &self,
        state: &mut EngineState,
        reason: StopReason,
        final_flush: bool,
        effects: &mut Vec<Effect>,
    ) {
        if state.status == EngineStatus::Stopped {
            return;
        }
        if state.status == EngineStatus::Recording {
            effects.push(Effect::StopCapture);
        }

        state.status = EngineStatus::Stopped;
        state.scheduler.reset();
        if final_flush && state.buffer.has_events() {
            state.pending_final_flush = true;
        } else {
            state.buffer.destroy();
        }

        self.clear_persisted();

        tracing::info!(
            reason = %reason,
            replay_id = ?state.session.as_ref().map(|s| s.id.as_str()),
            final_flush = state.pending_final_flush,
            "replay stopped"
        );
    }

    async fn final_flush(&self) {
        let pending = self.lock().pending_final_flush;
        if pending {
            self.flush_now(true).await;
        }
        let mut state = self.lock();
        state.pending_final_flush = false;
        state.buffer.destroy();
    }

    fn pause_locked(&self, state: &mut EngineState, effects: &mut Vec<Effect>) {
        if state.status != EngineStatus::Recording {
            return;
        }
        state.status = EngineStatus::Paused;
        // Resuming appends a checkout, which arms the flush again.
        state.scheduler.cancel();
        state.scheduler.cancel_checkout();
        effects.push(Effect::StopCapture);
        tracing::info!(
            replay_id = ?state.session.as_ref().map(|s| s.id.as_str()),
            "replay paused"
        );
    }

    fn resume_locked(&self, state: &mut EngineState, effects: &mut Vec<Effect>) {
        state.status = EngineStatus::Recording;
        let mode = state.mode();
        Self::start_capture(state, mode, effects);
        tracing::info!(mode = %mode, "replay resumed");
    }

    fn idle_too_long(&self, state: &EngineState, now: DateTime<Utc>) -> bool {
        state.mode() == RecordingMode::Session
            && now - state.last_user_activity > self.options.session_idle_pause()
    }

    /// Pauses an idle session replay and refreshes an expired session.
    /// Returns whether recording can carry on with the current session.
    fn check_and_handle_expired_session(
        &self,
        state: &mut EngineState,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> bool {
        if self.idle_too_long(state, now) {
            self.pause_locked(state, effects);
            return false;
        }
        self.check_session_locked(state, now, effects)
    }

    fn check_session_locked(
        &self,
        state: &mut EngineState,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> bool {
        let Some(session) = state.session.as_ref() else {
            return false;
        };
        if !should_refresh_session(session, self.timeouts(), now) {
            return true;
        }
        self.refresh_session_locked(state, now, effects);
        false
    }

    /// Replaces an expired session with a new one linked to it.
    fn refresh_session_locked(
        &self,
        state: &mut EngineState,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        if !state.status.is_enabled() {
            return;
        }
        let previous = state.session.as_ref().map(|session| session.id.clone());
        tracing::info!(
            previous_replay_id = ?previous.as_ref().map(ReplayId::as_str),
            "session expired, starting a new one"
        );

        if state.status == EngineStatus::Recording {
            effects.push(Effect::StopCapture);
        }
        self.clear_persisted();
        state.status = EngineStatus::NotStarted;
        state.buffer.destroy();
        state.scheduler.reset();
        state.context = EventContext::default();
        self.begin_session(state, None, previous, now, effects);
    }

    fn to_background(&self, breadcrumb: Option<Breadcrumb>) {
        let now = self.clock.now();
        let mut effects = Vec::new();
        {
            let mut state = self.lock();
            let Some(session) = state.session.as_ref() else {
                return;
            };
            if !state.status.is_enabled() || should_refresh_session(session, self.timeouts(), now) {
                return;
            }
            if let Some(breadcrumb) = breadcrumb {
                self.append_locked(&mut state, breadcrumb.into(), now, &mut effects);
            }
            // Hidden pages get their session replay sent right away.
            if state.status == EngineStatus::Recording && state.mode() == RecordingMode::Session {
                state.scheduler.request_immediate(now);
            }
        }
        self.apply(effects);
    }

    fn to_foreground(&self, breadcrumb: Option<Breadcrumb>) {
        let now = self.clock.now();
        let mut effects = Vec::new();
        {
            let mut state = self.lock();
            if !state.status.is_enabled() {
                return;
            }
            if self.check_and_handle_expired_session(&mut state, now, &mut effects) {
                if let Some(breadcrumb) = breadcrumb {
                    self.append_locked(&mut state, breadcrumb.into(), now, &mut effects);
                }
            } else {
                tracing::debug!("document became active, but the session is paused or expired");
            }
        }
        self.apply(effects);
    }

    /// Buffers an event. Any buffer failure stops the replay.
    fn append_locked(
        &self,
        state: &mut EngineState,
        event: ReplayEvent,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> bool {
        if state.status != EngineStatus::Recording {
            return false;
        }

        let timestamp = event.timestamp();
        if timestamp > state.initial_timestamp + self.options.max_replay_duration() {
            tracing::debug!(%timestamp, "dropping event past the maximum replay duration");
            return false;
        }

        if let Err(e) = state.buffer.append(event) {
            tracing::error!(error = %e, "failed to add event to the replay buffer");
            self.stop_locked(state, StopReason::BufferError, false, effects);
            return false;
        }

        if state.mode() == RecordingMode::Session {
            state.scheduler.request(now);
        }
        true
    }

    fn options_frame(&self, state: &EngineState, timestamp: DateTime<Utc>) -> OptionsFrame {
        let rates = state.controller.rates();
        OptionsFrame {
            timestamp,
            session_sample_rate: rates.session,
            error_sample_rate: rates.error,
            use_compression: self.options.use_compression,
            mutation_limit: self.options.mutation_limit,
            mutation_breadcrumb_limit: self.options.mutation_breadcrumb_limit,
        }
    }

    async fn send_buffered(&self, continue_recording: bool) {
        let activity = self.clock.now();
        self.flush_now(false).await;

        let mut effects = Vec::new();
        {
            let mut state = self.lock();
            if !continue_recording {
                self.stop_locked(&mut state, StopReason::BufferFlushed, false, &mut effects);
            } else if state.status.is_enabled() && state.controller.promote() {
                state.scheduler.cancel_checkout();
                state.last_user_activity = activity;
                if let Some(session) = state.session.as_mut() {
                    session.sampled = SampleDecision::Session;
                    session.touch(activity);
                }
                self.save(&state);
                tracing::info!(
                    replay_id = ?state.session.as_ref().map(|s| s.id.as_str()),
                    "buffered replay continues as session"
                );
                if state.status == EngineStatus::Recording {
                    effects.push(Effect::StopCapture);
                    Self::start_capture(&mut state, RecordingMode::Session, &mut effects);
                }
            }
        }
        self.apply(effects);
    }

    async fn flush_now(&self, force: bool) {
        let mut effects = Vec::new();
        let proceed = {
            let now = self.clock.now();
            let mut state = self.lock();
            self.prepare_flush(&mut state, force, now, &mut effects)
        };
        self.apply(effects);
        if !proceed {
            return;
        }

        let Ok(_flushing) = self.flush_lock.try_lock() else {
            // Piggyback on the flush in flight; newer events get a debounced one.
            let _done = self.flush_lock.lock().await;
            let now = self.clock.now();
            let mut state = self.lock();
            if state.status.is_enabled()
                && state.mode() == RecordingMode::Session
                && state.buffer.has_events()
            {
                state.scheduler.request(now);
            }
            return;
        };
        self.run_flush(force).await;
    }

    fn prepare_flush(
        &self,
        state: &mut EngineState,
        force: bool,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> bool {
        let enabled = state.status.is_enabled() || (force && state.pending_final_flush);
        if !enabled {
            return false;
        }
        if !force && !self.check_and_handle_expired_session(state, now, effects) {
            tracing::debug!("not flushing, session is paused or expired");
            return false;
        }
        let Some(session) = state.session.as_ref() else {
            return false;
        };

        let duration = now - session.started;
        let segment_id = session.segment_id;
        state.scheduler.cancel();

        if duration < self.options.min_replay_duration() {
            tracing::debug!(
                duration_ms = duration.num_milliseconds(),
                "replay too short to send, postponing flush"
            );
            if !force {
                state.scheduler.request(now);
            }
            return false;
        }
        let too_long_after =
            self.options.max_replay_duration() + Duration::milliseconds(TOO_LONG_GRACE_MS);
        if duration > too_long_after {
            tracing::debug!(
                duration_ms = duration.num_milliseconds(),
                "replay too long to send, skipping flush"
            );
            return false;
        }
        if segment_id == 0 && !state.buffer.has_checkout() {
            tracing::debug!("flushing initial segment without checkout");
        }
        true
    }

    async fn run_flush(&self, force: bool) {
        let mut effects = Vec::new();
        let prepared = {
            let now = self.clock.now();
            let mut state = self.lock();
            self.cut_segment(&mut state, force, now, &mut effects)
        };
        self.apply(effects);
        let Some((segment, events)) = prepared else {
            return;
        };

        let result = self.send_segment(&segment, events).await;

        let mut effects = Vec::new();
        {
            let now = self.clock.now();
            let mut state = self.lock();
            self.finish_segment(&mut state, segment, result, now, &mut effects);
        }
        self.apply(effects);
    }

    /// Moves the buffer into a new segment: bumps the segment id, marks the
    /// session dirty and persists it before anything leaves the engine.
    fn cut_segment(
        &self,
        state: &mut EngineState,
        force: bool,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Option<(PendingSegment, FinalizedEvents)> {
        if !(state.status.is_enabled() || (force && state.pending_final_flush)) {
            return None;
        }
        let stale_after =
            self.options.max_replay_duration() + Duration::milliseconds(STALE_FLUSH_GRACE_MS);
        if now - state.initial_timestamp > stale_after {
            tracing::warn!("replay flush is stale, stopping");
            self.stop_locked(state, StopReason::StaleFlush, false, effects);
            return None;
        }
        if !state.buffer.has_events() {
            return None;
        }

        let mode = state.mode();
        let session = state.session.as_mut()?;
        let segment_id = session.increment_segment();
        session.mark_dirty();
        let replay_id = session.id.clone();
        self.save(state);

        let events = match state.buffer.finalize() {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "failed to finalize replay buffer");
                self.stop_locked(state, StopReason::BufferError, false, effects);
                return None;
            }
        };

        let segment = PendingSegment {
            replay_id,
            segment_id,
            mode,
            timestamp: now,
            replay_start_timestamp: (segment_id == 0).then_some(state.initial_timestamp),
            context: state.context.take(),
        };
        Some((segment, events))
    }

    async fn send_segment(
        &self,
        segment: &PendingSegment,
        events: FinalizedEvents,
    ) -> Result<(), ReplayError> {
        let payload = encode_payload(events, self.options.use_compression).await?;
        tracing::debug!(
            replay_id = %segment.replay_id,
            segment_id = segment.segment_id,
            mode = %segment.mode,
            events = payload.event_count,
            bytes = payload.bytes.len(),
            "sending replay segment"
        );

        let upload = SegmentUpload {
            replay_id: segment.replay_id.clone(),
            segment_id: segment.segment_id,
            mode: segment.mode,
            timestamp: segment.timestamp,
            replay_start_timestamp: segment.replay_start_timestamp,
            error_ids: segment.context.error_ids.clone(),
            trace_ids: segment.context.trace_ids.clone(),
            urls: segment.context.urls.clone(),
            payload,
        };
        self.transport.send(upload).await?;
        Ok(())
    }

    fn finish_segment(
        &self,
        state: &mut EngineState,
        segment: PendingSegment,
        result: Result<(), ReplayError>,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let same_session = state
            .session
            .as_ref()
            .is_some_and(|session| session.id == segment.replay_id);
        if !same_session {
            tracing::debug!(replay_id = %segment.replay_id, "session changed while flushing");
            return;
        }

        match result {
            Ok(()) => {
                state.buffer.clear();
                if let Some(session) = state.session.as_mut() {
                    session.clear_dirty();
                }
                self.save(state);
                state.scheduler.mark_flushed(now);
                tracing::info!(
                    replay_id = %segment.replay_id,
                    segment_id = segment.segment_id,
                    "replay segment sent"
                );
            }
            Err(ReplayError::Transport(e)) if e.is_retryable() => {
                tracing::warn!(
                    error = %e,
                    replay_id = %segment.replay_id,
                    segment_id = segment.segment_id,
                    "replay segment not delivered, keeping its events"
                );
                state.buffer.restore();
                state.context.restore(segment.context);
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    replay_id = %segment.replay_id,
                    segment_id = segment.segment_id,
                    "failed to send replay segment"
                );
                let reason = match e {
                    ReplayError::Buffer(_) => StopReason::BufferError,
                    ReplayError::Transport(_) => StopReason::SendError,
                };
                self.stop_locked(state, reason, false, effects);
            }
        }
    }
}

impl CaptureObserver for ReplayEngine {
    fn on_emit(&self, event: RecordingEvent, is_checkout: bool) {
        let now = self.clock.now();
        let mut effects = Vec::new();
        {
            let mut state = self.lock();
            if state.status != EngineStatus::Recording {
                return;
            }

            let is_checkout = is_checkout || state.awaiting_first_emit;
            state.awaiting_first_emit = false;
            let mode = state.mode();

            // A buffer only ever holds the window since the last checkout.
            if is_checkout && mode == RecordingMode::Buffer {
                state.buffer.discard_window();
                state.context = EventContext::default();
                state.scheduler.schedule_checkout(now);
            }

            let timestamp = event.timestamp;
            if self.append_locked(&mut state, event.into(), now, &mut effects) && is_checkout {
                let segment_id = state.session.as_ref().map_or(0, |s| s.segment_id);
                if mode == RecordingMode::Buffer && segment_id == 0 {
                    let earliest = state.buffer.earliest_timestamp().unwrap_or(timestamp);
                    state.initial_timestamp = earliest;
                    if let Some(session) = state.session.as_mut() {
                        session.started = earliest;
                    }
                    self.save(&state);
                }
                if segment_id == 0 {
                    let frame = self.options_frame(&state, timestamp);
                    self.append_locked(&mut state, ReplayEvent::Options(frame), now, &mut effects);
                }
            }
        }
        self.apply(effects);
    }

    fn on_mutation(&self, count: usize) -> bool {
        let now = self.clock.now();
        let mut effects = Vec::new();
        let accepted = {
            let mut state = self.lock();
            if state.status != EngineStatus::Recording {
                return false;
            }

            let limit = self.options.mutation_limit;
            let over_limit = limit > 0 && count > limit;
            if count > self.options.mutation_breadcrumb_limit || over_limit {
                let breadcrumb = Breadcrumb::new("replay.mutations", now)
                    .with_data(json!({ "count": count, "limit": over_limit }));
                self.append_locked(&mut state, breadcrumb.into(), now, &mut effects);
            }

            if over_limit {
                tracing::warn!(count, limit, "mutation limit exceeded, stopping replay");
                let final_flush = state.mode() == RecordingMode::Session;
                self.stop_locked(&mut state, StopReason::MutationLimit, final_flush, &mut effects);
            }
            !over_limit
        };
        self.apply(effects);
        accepted
    }
}
