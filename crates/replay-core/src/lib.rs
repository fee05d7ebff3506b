//! Core session replay engine.
//!
//! This crate contains:
//! - Session: replay identity, expiry and sticky persistence
//! - Event buffer: ordered, size-bounded events with deferred serialization
//! - Recording modes: `session` and `buffer`, and the error-driven switch
//! - Flush scheduling: debounce with min/max delay and buffer checkouts
//! - The engine tying them to a capture library and a transport

pub mod buffer;
pub mod capture;
pub mod clock;
mod engine;
pub mod event;
pub mod mode;
pub mod options;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod types;

pub use buffer::{BufferError, EventBuffer, PayloadEncoding, RecordingPayload};
pub use capture::{CaptureConfig, CaptureLibrary, CaptureObserver, ScriptedCapture};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    EngineStatus, FlushOptions, ReplayEngine, ReplayEngineBuilder, ReplayError, StopReason,
    Visibility,
};
pub use event::{
    Breadcrumb, OptionsFrame, PerformanceSpan, RecordingEvent, RecordingEventKind, ReplayEvent,
};
pub use mode::{RandomSampler, SampleRates, Sampler};
pub use options::ReplayOptions;
pub use session::{MemoryStore, REPLAY_SESSION_KEY, Session, SessionStore, StoreError};
pub use transport::{RecordingTransport, SegmentUpload, Transport, TransportError};
pub use types::{RecordingMode, ReplayId, SampleDecision, ValidationError};
