//! Segment delivery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Notify;

use crate::buffer::RecordingPayload;
use crate::types::{RecordingMode, ReplayId};

/// Why a segment was not accepted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server answered with a non-2xx status.
    #[error("segment rejected with HTTP status {status}")]
    Rejected { status: u16 },

    /// The request never got an answer.
    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    /// Whether the failure is transient.
    ///
    /// Timeouts, rate limits, server errors and network failures are
    /// transient. Every other status means the replay was refused for good.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Rejected { status } => matches!(status, 408 | 429 | 500..=599),
            Self::Network(_) => true,
        }
    }
}

/// One segment ready for the wire.
#[derive(Debug, Clone)]
pub struct SegmentUpload {
    pub replay_id: ReplayId,
    pub segment_id: u32,
    pub mode: RecordingMode,
    pub timestamp: DateTime<Utc>,
    /// Start of the replay, only sent with segment 0.
    pub replay_start_timestamp: Option<DateTime<Utc>>,
    pub error_ids: Vec<String>,
    pub trace_ids: Vec<String>,
    pub urls: Vec<String>,
    pub payload: RecordingPayload,
}

/// Sends segments somewhere.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, upload: SegmentUpload) -> Result<(), TransportError>;
}

/// In-memory transport that keeps every upload.
///
/// Responses can be scripted with [`RecordingTransport::respond_with`]; once
/// the script runs out every send succeeds. [`RecordingTransport::hold`]
/// parks sends until [`RecordingTransport::release`], which is how an
/// interrupted request is simulated.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    uploads: Mutex<Vec<SegmentUpload>>,
    responses: Mutex<VecDeque<Result<(), TransportError>>>,
    held: AtomicBool,
    release: Notify,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the result of a future send.
    pub fn respond_with(&self, response: Result<(), TransportError>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    /// Makes subsequent sends wait for [`release`](Self::release).
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Lets held sends complete.
    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    /// Every upload attempted so far, in order.
    pub fn uploads(&self) -> Vec<SegmentUpload> {
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Highest number of sends that were ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, upload: SegmentUpload) -> Result<(), TransportError> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(upload);

        while self.held.load(Ordering::SeqCst) {
            let released = self.release.notified();
            if !self.held.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Ok(()))
    }
}
