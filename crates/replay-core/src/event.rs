//! Events that flow through the replay buffer.
//!
//! The capture library produces [`RecordingEvent`]s (full and incremental
//! snapshots). Breadcrumb, performance span and options producers add tagged
//! custom events. Both end up as [`ReplayEvent`]s in the same buffer; the
//! engine never looks inside their payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a capture-library event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingEventKind {
    /// A complete baseline of the visual state.
    FullSnapshot,
    /// A diff against the last baseline.
    IncrementalSnapshot,
    /// Page metadata (viewport, URL).
    Meta,
}

/// An opaque event emitted by the capture library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingEvent {
    pub kind: RecordingEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RecordingEvent {
    /// Creates a full snapshot event.
    pub fn full_snapshot(timestamp: DateTime<Utc>, data: serde_json::Value) -> Self {
        Self {
            kind: RecordingEventKind::FullSnapshot,
            timestamp,
            data,
        }
    }

    /// Creates an incremental snapshot event.
    pub fn incremental(timestamp: DateTime<Utc>, data: serde_json::Value) -> Self {
        Self {
            kind: RecordingEventKind::IncrementalSnapshot,
            timestamp,
            data,
        }
    }
}

/// A replay breadcrumb (`ui.click`, `ui.blur`, `replay.mutations`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub category: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Breadcrumb {
    /// Creates a breadcrumb with only a category.
    pub fn new(category: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            category: category.into(),
            timestamp,
            message: None,
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A performance span (navigation, resource, web vital).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSpan {
    pub op: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Engine settings recorded at the start of a replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsFrame {
    pub timestamp: DateTime<Utc>,
    pub session_sample_rate: f64,
    pub error_sample_rate: f64,
    pub use_compression: bool,
    pub mutation_limit: usize,
    pub mutation_breadcrumb_limit: usize,
}

/// Anything that can be appended to the event buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "payload", rename_all = "camelCase")]
pub enum ReplayEvent {
    Recording(RecordingEvent),
    Breadcrumb(Breadcrumb),
    PerformanceSpan(PerformanceSpan),
    Options(OptionsFrame),
}

impl ReplayEvent {
    /// The time the event happened.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Recording(event) => event.timestamp,
            Self::Breadcrumb(crumb) => crumb.timestamp,
            Self::PerformanceSpan(span) => span.start,
            Self::Options(options) => options.timestamp,
        }
    }

    /// Whether this is a full snapshot from the capture library.
    pub fn is_full_snapshot(&self) -> bool {
        matches!(
            self,
            Self::Recording(RecordingEvent {
                kind: RecordingEventKind::FullSnapshot,
                ..
            })
        )
    }
}

impl From<RecordingEvent> for ReplayEvent {
    fn from(event: RecordingEvent) -> Self {
        Self::Recording(event)
    }
}

impl From<Breadcrumb> for ReplayEvent {
    fn from(crumb: Breadcrumb) -> Self {
        Self::Breadcrumb(crumb)
    }
}

impl From<PerformanceSpan> for ReplayEvent {
    fn from(span: PerformanceSpan) -> Self {
        Self::PerformanceSpan(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn breadcrumb_serializes_with_tag() {
        let event = ReplayEvent::from(Breadcrumb::new("ui.click", ts()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tag"], "breadcrumb");
        assert_eq!(json["payload"]["category"], "ui.click");
        assert!(json["payload"].get("message").is_none());
    }

    #[test]
    fn performance_span_uses_camel_case_tag() {
        let span = PerformanceSpan {
            op: "navigation.navigate".to_string(),
            description: "https://example.com".to_string(),
            start: ts(),
            end: ts(),
            data: None,
        };
        let json = serde_json::to_value(ReplayEvent::from(span)).unwrap();
        assert_eq!(json["tag"], "performanceSpan");
    }

    #[test]
    fn only_full_snapshots_count_as_checkouts() {
        let full = ReplayEvent::from(RecordingEvent::full_snapshot(ts(), serde_json::json!({})));
        let diff = ReplayEvent::from(RecordingEvent::incremental(ts(), serde_json::json!({})));
        assert!(full.is_full_snapshot());
        assert!(!diff.is_full_snapshot());
        assert!(!ReplayEvent::from(Breadcrumb::new("ui.blur", ts())).is_full_snapshot());
    }
}
