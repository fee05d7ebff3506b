//! Flush and checkout timing.
//!
//! The scheduler is a pure deadline calculator: it never sleeps and never
//! flushes anything itself. The engine asks it for due work on every
//! [`tick`](crate::ReplayEngine::tick) and reports back when a flush
//! went out.

use chrono::{DateTime, Duration, Utc};

/// Debounced flush deadline plus the buffer-mode checkout timer.
#[derive(Debug, Clone)]
pub struct FlushScheduler {
    min_delay: Duration,
    max_delay: Duration,
    checkout_interval: Duration,
    pending_flush_at: Option<DateTime<Utc>>,
    /// Time of the oldest event the pending flush has to cover.
    first_pending_at: Option<DateTime<Utc>>,
    last_flush_at: Option<DateTime<Utc>>,
    next_checkout_at: Option<DateTime<Utc>>,
}

impl FlushScheduler {
    pub const fn new(min_delay: Duration, max_delay: Duration, checkout_interval: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
            checkout_interval,
            pending_flush_at: None,
            first_pending_at: None,
            last_flush_at: None,
            next_checkout_at: None,
        }
    }

    /// Schedules (or pushes back) the debounced flush for an event at `now`.
    ///
    /// The deadline is `now + min_delay`, not earlier than `min_delay` after
    /// the last flush, and never later than `max_delay` after the oldest
    /// event still waiting. The last bound wins when they conflict.
    pub fn request(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let first = *self.first_pending_at.get_or_insert(now);

        let mut candidate = now + self.min_delay;
        if let Some(last) = self.last_flush_at {
            candidate = candidate.max(last + self.min_delay);
        }
        let due = candidate.min(first + self.max_delay);

        self.pending_flush_at = Some(due);
        due
    }

    /// Schedules a flush for right now, bypassing the debounce.
    pub fn request_immediate(&mut self, now: DateTime<Utc>) {
        self.first_pending_at.get_or_insert(now);
        self.pending_flush_at = Some(now);
    }

    /// Drops the pending flush.
    pub fn cancel(&mut self) {
        self.pending_flush_at = None;
        self.first_pending_at = None;
    }

    /// Consumes the pending flush if its deadline has passed.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.pending_flush_at {
            Some(due) if due <= now => {
                self.cancel();
                true
            }
            _ => false,
        }
    }

    /// Records that a flush was sent at `now`.
    pub fn mark_flushed(&mut self, now: DateTime<Utc>) {
        self.last_flush_at = Some(now);
    }

    /// Arms the checkout timer one interval from `now`.
    pub fn schedule_checkout(&mut self, now: DateTime<Utc>) {
        if self.checkout_interval > Duration::zero() {
            self.next_checkout_at = Some(now + self.checkout_interval);
        }
    }

    pub fn cancel_checkout(&mut self) {
        self.next_checkout_at = None;
    }

    /// Consumes the checkout timer if it fired.
    pub fn take_checkout_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.next_checkout_at {
            Some(due) if due <= now => {
                self.next_checkout_at = None;
                true
            }
            _ => false,
        }
    }

    /// Earliest deadline of any kind.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        match (self.pending_flush_at, self.next_checkout_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Forgets every timer and the flush history.
    pub fn reset(&mut self) {
        self.cancel();
        self.cancel_checkout();
        self.last_flush_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn ms(value: i64) -> Duration {
        Duration::milliseconds(value)
    }

    fn scheduler() -> FlushScheduler {
        FlushScheduler::new(ms(5_000), ms(5_500), ms(60_000))
    }

    #[test]
    fn first_request_waits_min_delay() {
        let mut scheduler = scheduler();
        assert_eq!(scheduler.request(t0()), t0() + ms(5_000));
        assert!(!scheduler.take_due(t0() + ms(4_999)));
        assert!(scheduler.take_due(t0() + ms(5_000)));
        assert_eq!(scheduler.pending_flush_at, None);
    }

    #[test]
    fn continuous_activity_cannot_postpone_past_max_delay() {
        let mut scheduler = scheduler();
        scheduler.request(t0());
        scheduler.request(t0() + ms(300));
        let due = scheduler.request(t0() + ms(3_000));
        assert_eq!(due, t0() + ms(5_500));

        let due = scheduler.request(t0() + ms(5_000));
        assert_eq!(due, t0() + ms(5_500));
    }

    #[test]
    fn respects_min_delay_after_last_flush() {
        let mut scheduler = FlushScheduler::new(ms(1_000), ms(10_000), ms(0));
        scheduler.mark_flushed(t0());
        assert_eq!(scheduler.request(t0() + ms(200)), t0() + ms(1_200));

        // A later last flush pushes the candidate out.
        let mut scheduler = FlushScheduler::new(ms(1_000), ms(10_000), ms(0));
        scheduler.request(t0());
        scheduler.mark_flushed(t0() + ms(500));
        assert_eq!(scheduler.request(t0() + ms(100)), t0() + ms(1_500));
    }

    #[test]
    fn take_due_resets_the_max_delay_window() {
        let mut scheduler = scheduler();
        scheduler.request(t0());
        assert!(scheduler.take_due(t0() + ms(5_000)));

        let later = t0() + ms(20_000);
        assert_eq!(scheduler.request(later), later + ms(5_000));
    }

    #[test]
    fn immediate_request_is_due_now() {
        let mut scheduler = scheduler();
        scheduler.request(t0());
        scheduler.request_immediate(t0() + ms(10));
        assert!(scheduler.take_due(t0() + ms(10)));
    }

    #[test]
    fn cancel_clears_pending_flush() {
        let mut scheduler = scheduler();
        scheduler.request(t0());
        scheduler.cancel();
        assert!(!scheduler.take_due(t0() + ms(60_000)));
        assert_eq!(scheduler.next_wakeup(), None);
    }

    #[test]
    fn checkout_timer_fires_once_per_arm() {
        let mut scheduler = scheduler();
        scheduler.schedule_checkout(t0());
        assert_eq!(scheduler.next_checkout_at, Some(t0() + ms(60_000)));
        assert!(!scheduler.take_checkout_due(t0() + ms(59_999)));
        assert!(scheduler.take_checkout_due(t0() + ms(60_000)));
        assert!(!scheduler.take_checkout_due(t0() + ms(120_000)));
    }

    #[test]
    fn zero_interval_disables_checkouts() {
        let mut scheduler = FlushScheduler::new(ms(1), ms(2), Duration::zero());
        scheduler.schedule_checkout(t0());
        assert_eq!(scheduler.next_checkout_at, None);
    }

    #[test]
    fn next_wakeup_is_earliest_deadline() {
        let mut scheduler = scheduler();
        scheduler.schedule_checkout(t0());
        assert_eq!(scheduler.next_wakeup(), Some(t0() + ms(60_000)));
        scheduler.request(t0());
        assert_eq!(scheduler.next_wakeup(), Some(t0() + ms(5_000)));

        scheduler.reset();
        assert_eq!(scheduler.next_wakeup(), None);
        assert_eq!(scheduler.last_flush_at, None);
    }
}
