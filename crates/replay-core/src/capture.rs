//! The capture library seam.
//!
//! The engine never diffs anything itself. A [`CaptureLibrary`] turns page
//! changes into [`RecordingEvent`]s and pushes them into a
//! [`CaptureObserver`], which the engine implements. The library only holds a
//! [`Weak`] reference so dropping the engine ends the recording.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::json;

use crate::clock::Clock;
use crate::event::RecordingEvent;
use crate::types::RecordingMode;

/// Receives capture output.
pub trait CaptureObserver: Send + Sync {
    /// A new event. `is_checkout` is set for full snapshots taken as a new
    /// baseline.
    fn on_emit(&self, event: RecordingEvent, is_checkout: bool);

    /// A mutation batch of `count` nodes is about to be recorded. Returning
    /// false tells the library to drop it.
    fn on_mutation(&self, count: usize) -> bool;
}

/// Settings handed to the library on start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub mode: RecordingMode,
}

/// A DOM recorder.
pub trait CaptureLibrary: Send + Sync {
    /// Starts recording into `observer`. Must emit a full snapshot before
    /// returning.
    fn start(&self, observer: Weak<dyn CaptureObserver>, config: CaptureConfig);

    /// Stops recording. Idempotent.
    fn stop(&self);

    /// Emits a new full snapshot while recording.
    fn take_full_snapshot(&self, is_checkout: bool);
}

#[derive(Default)]
struct ScriptedState {
    observer: Option<Weak<dyn CaptureObserver>>,
    config: Option<CaptureConfig>,
}

/// A capture library without a DOM, driven by explicit calls.
///
/// Full snapshots carry a running snapshot number; incremental events carry
/// whatever data the caller passes in.
pub struct ScriptedCapture {
    clock: Arc<dyn Clock>,
    state: Mutex<ScriptedState>,
    snapshots: AtomicU64,
}

impl std::fmt::Debug for ScriptedCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedCapture")
            .field("recording", &self.is_recording())
            .field("snapshots", &self.snapshot_count())
            .finish_non_exhaustive()
    }
}

impl ScriptedCapture {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(ScriptedState::default()),
            snapshots: AtomicU64::new(0),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.lock().observer.is_some()
    }

    /// Config of the current recording, if any.
    pub fn config(&self) -> Option<CaptureConfig> {
        self.lock().config
    }

    /// Number of full snapshots emitted so far.
    pub fn snapshot_count(&self) -> u64 {
        self.snapshots.load(Ordering::SeqCst)
    }

    /// Emits an incremental snapshot. Returns false if not recording.
    pub fn emit_incremental(&self, data: serde_json::Value) -> bool {
        let Some(observer) = self.observer() else {
            return false;
        };
        observer.on_emit(RecordingEvent::incremental(self.clock.now(), data), false);
        true
    }

    /// Reports a mutation batch and records it if the observer accepts.
    pub fn emit_mutations(&self, count: usize) -> bool {
        let Some(observer) = self.observer() else {
            return false;
        };
        if !observer.on_mutation(count) {
            return false;
        }
        let event = RecordingEvent::incremental(
            self.clock.now(),
            json!({ "source": "mutation", "adds": count }),
        );
        observer.on_emit(event, false);
        true
    }

    fn emit_full_snapshot(&self, observer: &dyn CaptureObserver, is_checkout: bool) {
        let snapshot = self.snapshots.fetch_add(1, Ordering::SeqCst) + 1;
        let event = RecordingEvent::full_snapshot(self.clock.now(), json!({ "snapshot": snapshot }));
        observer.on_emit(event, is_checkout);
    }

    /// Upgrades the observer without holding the lock during the callback.
    fn observer(&self) -> Option<Arc<dyn CaptureObserver>> {
        let weak = self.lock().observer.clone()?;
        weak.upgrade()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CaptureLibrary for ScriptedCapture {
    fn start(&self, observer: Weak<dyn CaptureObserver>, config: CaptureConfig) {
        {
            let mut state = self.lock();
            state.observer = Some(observer);
            state.config = Some(config);
        }
        tracing::trace!(mode = %config.mode, "capture started");
        if let Some(observer) = self.observer() {
            self.emit_full_snapshot(observer.as_ref(), true);
        }
    }

    fn stop(&self) {
        let mut state = self.lock();
        if state.observer.take().is_some() {
            tracing::trace!("capture stopped");
        }
        state.config = None;
    }

    fn take_full_snapshot(&self, is_checkout: bool) {
        if let Some(observer) = self.observer() {
            self.emit_full_snapshot(observer.as_ref(), is_checkout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};

    use crate::clock::ManualClock;
    use crate::event::RecordingEventKind;

    #[derive(Default)]
    struct Collect {
        events: Mutex<Vec<(RecordingEventKind, bool)>>,
        accept_mutations: bool,
    }

    impl CaptureObserver for Collect {
        fn on_emit(&self, event: RecordingEvent, is_checkout: bool) {
            self.events.lock().unwrap().push((event.kind, is_checkout));
        }

        fn on_mutation(&self, _count: usize) -> bool {
            self.accept_mutations
        }
    }

    fn capture() -> ScriptedCapture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        ScriptedCapture::new(Arc::new(clock))
    }

    fn start(capture: &ScriptedCapture, observer: &Arc<Collect>) {
        let observer: Arc<dyn CaptureObserver> = observer.clone();
        capture.start(
            Arc::downgrade(&observer),
            CaptureConfig {
                mode: RecordingMode::Session,
            },
        );
    }

    #[test]
    fn start_emits_a_checkout() {
        let capture = capture();
        let observer = Arc::new(Collect::default());
        start(&capture, &observer);

        assert!(capture.is_recording());
        assert_eq!(
            *observer.events.lock().unwrap(),
            vec![(RecordingEventKind::FullSnapshot, true)]
        );
    }

    #[test]
    fn stopped_capture_emits_nothing() {
        let capture = capture();
        let observer = Arc::new(Collect::default());
        start(&capture, &observer);
        capture.stop();

        assert!(!capture.emit_incremental(json!({})));
        capture.take_full_snapshot(true);
        assert_eq!(observer.events.lock().unwrap().len(), 1);
        assert_eq!(capture.snapshot_count(), 1);
    }

    #[test]
    fn rejected_mutations_are_not_recorded() {
        let capture = capture();
        let observer = Arc::new(Collect::default());
        start(&capture, &observer);

        assert!(!capture.emit_mutations(10));
        assert_eq!(observer.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn accepted_mutations_become_incremental_events() {
        let capture = capture();
        let observer = Arc::new(Collect {
            accept_mutations: true,
            ..Collect::default()
        });
        start(&capture, &observer);

        assert!(capture.emit_mutations(10));
        assert_eq!(
            observer.events.lock().unwrap().last(),
            Some(&(RecordingEventKind::IncrementalSnapshot, false))
        );
    }

    #[test]
    fn dropped_observer_ends_recording_output() {
        let capture = capture();
        let observer = Arc::new(Collect::default());
        start(&capture, &observer);
        drop(observer);

        assert!(!capture.emit_incremental(json!({})));
    }
}
