//! Engine configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Upper bound for `min_replay_duration_ms`.
pub const MIN_REPLAY_DURATION_LIMIT_MS: i64 = 15_000;

/// Longest accepted `max_replay_duration_ms` (one hour).
pub const MAX_REPLAY_DURATION_MS: i64 = 3_600_000;

/// Tunables for the replay engine.
///
/// All durations are milliseconds. Deserialization fills missing fields from
/// [`ReplayOptions::default`], so partial config files are fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayOptions {
    /// Debounce delay after the last qualifying event.
    pub flush_min_delay_ms: i64,

    /// Upper bound on how long a pending flush can be pushed back.
    pub flush_max_delay_ms: i64,

    /// A replay younger than this is never sent.
    /// Default: 4999. Capped at [`MIN_REPLAY_DURATION_LIMIT_MS`].
    pub min_replay_duration_ms: i64,

    /// Sessions older than this are refreshed.
    /// Default and cap: [`MAX_REPLAY_DURATION_MS`].
    pub max_replay_duration_ms: i64,

    /// Without user activity for this long, session recording pauses.
    /// Default: 300000 (5 minutes).
    pub session_idle_pause_ms: i64,

    /// Without any session activity for this long, the session expires.
    /// Default: 900000 (15 minutes).
    pub session_idle_expire_ms: i64,

    /// How often a fresh checkout is taken in buffer mode.
    /// Default: 60000 (1 minute).
    pub buffer_checkout_interval_ms: i64,

    /// Persist the session so it survives reloads.
    pub sticky_session: bool,

    /// Gzip segment payloads before sending.
    pub use_compression: bool,

    /// Mutation batches above this size leave a `replay.mutations` breadcrumb.
    pub mutation_breadcrumb_limit: usize,

    /// Mutation batches above this size stop recording. 0 disables the limit.
    pub mutation_limit: usize,

    /// Serialized size at which the buffer refuses further events.
    pub max_buffer_size_bytes: usize,

    /// Probability of recording a whole session.
    pub session_sample_rate: f64,

    /// Probability of sending a buffered replay when an error occurs.
    pub error_sample_rate: f64,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            flush_min_delay_ms: 5_000,
            flush_max_delay_ms: 5_500,
            min_replay_duration_ms: 4_999,
            max_replay_duration_ms: MAX_REPLAY_DURATION_MS,
            session_idle_pause_ms: 300_000,      // 5 minutes
            session_idle_expire_ms: 900_000,     // 15 minutes
            buffer_checkout_interval_ms: 60_000, // 1 minute
            sticky_session: true,
            use_compression: true,
            mutation_breadcrumb_limit: 750,
            mutation_limit: 10_000,
            max_buffer_size_bytes: 20_000_000,
            session_sample_rate: 0.0,
            error_sample_rate: 0.0,
        }
    }
}

impl ReplayOptions {
    /// Caps every duration at [`MAX_REPLAY_DURATION_MS`] (the minimum replay
    /// duration at [`MIN_REPLAY_DURATION_LIMIT_MS`]) and clamps sample rates
    /// into `[0, 1]`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.min_replay_duration_ms = self
            .min_replay_duration_ms
            .clamp(0, MIN_REPLAY_DURATION_LIMIT_MS);
        self.max_replay_duration_ms = self.max_replay_duration_ms.clamp(0, MAX_REPLAY_DURATION_MS);
        // No timer outlasts a replay.
        self.flush_min_delay_ms = self.flush_min_delay_ms.clamp(0, MAX_REPLAY_DURATION_MS);
        self.flush_max_delay_ms = self
            .flush_max_delay_ms
            .clamp(self.flush_min_delay_ms, MAX_REPLAY_DURATION_MS);
        self.session_idle_pause_ms = self.session_idle_pause_ms.clamp(0, MAX_REPLAY_DURATION_MS);
        self.session_idle_expire_ms = self.session_idle_expire_ms.clamp(0, MAX_REPLAY_DURATION_MS);
        self.buffer_checkout_interval_ms = self
            .buffer_checkout_interval_ms
            .clamp(0, MAX_REPLAY_DURATION_MS);
        self.session_sample_rate = clamp_rate(self.session_sample_rate);
        self.error_sample_rate = clamp_rate(self.error_sample_rate);
        self
    }

    pub fn flush_min_delay(&self) -> Duration {
        Duration::milliseconds(self.flush_min_delay_ms)
    }

    pub fn flush_max_delay(&self) -> Duration {
        Duration::milliseconds(self.flush_max_delay_ms)
    }

    pub fn min_replay_duration(&self) -> Duration {
        Duration::milliseconds(self.min_replay_duration_ms)
    }

    pub fn max_replay_duration(&self) -> Duration {
        Duration::milliseconds(self.max_replay_duration_ms)
    }

    pub fn session_idle_pause(&self) -> Duration {
        Duration::milliseconds(self.session_idle_pause_ms)
    }

    pub fn session_idle_expire(&self) -> Duration {
        Duration::milliseconds(self.session_idle_expire_ms)
    }

    pub fn buffer_checkout_interval(&self) -> Duration {
        Duration::milliseconds(self.buffer_checkout_interval_ms)
    }
}

/// Clamps a sample rate into `[0, 1]`, mapping NaN to 0.
pub fn clamp_rate(rate: f64) -> f64 {
    if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) }
}
