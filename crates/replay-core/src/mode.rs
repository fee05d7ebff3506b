//! Recording mode selection and transitions.
//!
//! A replay records in one of two modes:
//!
//! - `session`: everything is recorded and flushed on the debounce schedule
//! - `buffer`: a rolling window is kept in memory until an error is sampled,
//!   at which point the window is sent and the replay continues as `session`
//!
//! There is no way back from `session` to `buffer`.

use serde::{Deserialize, Serialize};

use crate::options::clamp_rate;
use crate::session::Session;
use crate::types::{RecordingMode, SampleDecision};

/// Decides whether a probabilistic draw succeeds.
pub trait Sampler: Send + Sync {
    /// Returns true with probability `rate`.
    fn sample(&self, rate: f64) -> bool;
}

/// Uniform random sampling.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSampler;

impl Sampler for RandomSampler {
    fn sample(&self, rate: f64) -> bool {
        let rate = clamp_rate(rate);
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        rand::random::<f64>() < rate
    }
}

/// The two independent sample rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SampleRates {
    pub session: f64,
    pub error: f64,
}

impl SampleRates {
    pub fn new(session: f64, error: f64) -> Self {
        Self {
            session: clamp_rate(session),
            error: clamp_rate(error),
        }
    }
}

/// What to do with a captured error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// Session mode: the error is only attached to the next segment.
    Attach,
    /// Buffer mode, sampled in: send the buffer and switch to session mode.
    Promote,
    /// Buffer mode, sampled out: keep buffering.
    SampledOut,
}

/// Tracks the active recording mode and the sample rates that drive it.
#[derive(Debug, Clone)]
pub struct ModeController {
    mode: RecordingMode,
    rates: SampleRates,
}

impl ModeController {
    pub const fn new(rates: SampleRates) -> Self {
        Self {
            mode: RecordingMode::Session,
            rates,
        }
    }

    pub const fn mode(&self) -> RecordingMode {
        self.mode
    }

    pub const fn rates(&self) -> SampleRates {
        self.rates
    }

    pub fn set_rates(&mut self, rates: SampleRates) {
        self.rates = rates;
    }

    /// Draws the sampling decision for a brand-new session.
    ///
    /// The session rate is drawn first. When it misses, buffering is the
    /// fallback if `allow_buffering` is set; the error rate itself is drawn
    /// later, once per captured error.
    pub fn sample_new_session(&self, sampler: &dyn Sampler, allow_buffering: bool) -> SampleDecision {
        if sampler.sample(self.rates.session) {
            SampleDecision::Session
        } else if allow_buffering {
            SampleDecision::Buffer
        } else {
            SampleDecision::Unsampled
        }
    }

    /// Picks the mode a loaded or freshly created session records in.
    ///
    /// A buffered session that already sent a segment, or whose last flush
    /// never confirmed, resumes as `session`: its error context has already
    /// (maybe partially) left the page and must not be lost again.
    pub fn resolve(&mut self, session: &Session) -> Option<RecordingMode> {
        let mode = match session.sampled {
            SampleDecision::Unsampled => return None,
            SampleDecision::Buffer if session.segment_id == 0 && !session.dirty => {
                RecordingMode::Buffer
            }
            SampleDecision::Buffer | SampleDecision::Session => RecordingMode::Session,
        };
        self.mode = mode;
        Some(mode)
    }

    /// Forces a mode, for manual `start_session` / `start_buffering`.
    pub fn force(&mut self, mode: RecordingMode) {
        self.mode = mode;
    }

    /// Classifies a captured error, drawing the error rate in buffer mode.
    pub fn on_error(&self, sampler: &dyn Sampler) -> ErrorOutcome {
        match self.mode {
            RecordingMode::Session => ErrorOutcome::Attach,
            RecordingMode::Buffer if sampler.sample(self.rates.error) => ErrorOutcome::Promote,
            RecordingMode::Buffer => ErrorOutcome::SampledOut,
        }
    }

    /// Switches buffer mode to session mode.
    ///
    /// Returns false if the controller was already in session mode.
    pub fn promote(&mut self) -> bool {
        if self.mode == RecordingMode::Session {
            return false;
        }
        self.mode = RecordingMode::Session;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;

    use crate::types::ReplayId;

    struct Always(bool);

    impl Sampler for Always {
        fn sample(&self, _rate: f64) -> bool {
            self.0
        }
    }

    fn session(sampled: SampleDecision, segment_id: u32, dirty: bool) -> Session {
        let mut session = Session::new(ReplayId::generate(), sampled, None, Utc::now());
        session.segment_id = segment_id;
        session.dirty = dirty;
        session
    }

    #[test]
    fn random_sampler_respects_bounds() {
        let sampler = RandomSampler;
        assert!((0..100).all(|_| sampler.sample(1.0)));
        assert!((0..100).all(|_| !sampler.sample(0.0)));
        assert!((0..100).all(|_| !sampler.sample(f64::NAN)));
    }

    #[test]
    fn new_session_falls_back_to_buffer() {
        let controller = ModeController::new(SampleRates::new(0.0, 1.0));
        assert_eq!(
            controller.sample_new_session(&Always(false), true),
            SampleDecision::Buffer
        );
        assert_eq!(
            controller.sample_new_session(&Always(false), false),
            SampleDecision::Unsampled
        );
        assert_eq!(
            controller.sample_new_session(&Always(true), false),
            SampleDecision::Session
        );
    }

    #[test]
    fn resolve_keeps_fresh_buffer_sessions_buffering() {
        let mut controller = ModeController::new(SampleRates::default());
        let mode = controller.resolve(&session(SampleDecision::Buffer, 0, false));
        assert_eq!(mode, Some(RecordingMode::Buffer));
    }

    #[test]
    fn resolve_resumes_dirty_buffer_sessions_as_session() {
        let mut controller = ModeController::new(SampleRates::default());
        assert_eq!(
            controller.resolve(&session(SampleDecision::Buffer, 1, true)),
            Some(RecordingMode::Session)
        );
        assert_eq!(
            controller.resolve(&session(SampleDecision::Buffer, 0, true)),
            Some(RecordingMode::Session)
        );
        assert_eq!(
            controller.resolve(&session(SampleDecision::Buffer, 2, false)),
            Some(RecordingMode::Session)
        );
    }

    #[test]
    fn resolve_rejects_unsampled_sessions() {
        let mut controller = ModeController::new(SampleRates::default());
        assert_eq!(controller.resolve(&session(SampleDecision::Unsampled, 0, false)), None);
    }

    #[test]
    fn errors_promote_only_buffer_mode() {
        let mut controller = ModeController::new(SampleRates::new(0.0, 1.0));
        assert_eq!(controller.on_error(&Always(true)), ErrorOutcome::Attach);

        controller.force(RecordingMode::Buffer);
        assert_eq!(controller.on_error(&Always(false)), ErrorOutcome::SampledOut);
        assert_eq!(controller.on_error(&Always(true)), ErrorOutcome::Promote);

        assert!(controller.promote());
        assert!(!controller.promote());
        assert_eq!(controller.mode(), RecordingMode::Session);
    }
}
