//! The event buffer.
//!
//! Events are appended synchronously. A flush moves the current generation
//! out with [`EventBuffer::finalize`] and serializes it; appends made while
//! the flush is in flight land in the next generation. The finalized
//! generation is only dropped by [`EventBuffer::clear`] once the transport
//! confirms the upload. On a transient failure [`EventBuffer::restore`] puts
//! it back in front of the newer events so nothing is lost.
//!
//! Any append or encode error is unrecoverable: the engine stops recording.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::ReplayEvent;

/// Event buffer errors.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The buffer was destroyed and accepts nothing.
    #[error("event buffer has been destroyed")]
    Destroyed,
    /// An event could not be serialized.
    #[error("failed to encode replay event: {0}")]
    Encode(#[from] serde_json::Error),
    /// Appending would exceed the configured size.
    #[error("event buffer size limit exceeded ({size} > {limit} bytes)")]
    SizeExceeded { size: usize, limit: usize },
    /// A flush is already holding a finalized generation.
    #[error("a finalized generation is already pending")]
    FlushPending,
    /// Compression failed.
    #[error("failed to compress recording: {0}")]
    Compress(#[from] std::io::Error),
    /// The compression task panicked or was cancelled.
    #[error("compression task failed: {0}")]
    Worker(String),
}

/// How a payload's bytes are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Plain JSON array.
    Json,
    /// Gzip-compressed JSON array.
    Gzip,
}

/// A serialized, transport-ready generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingPayload {
    pub bytes: Vec<u8>,
    pub encoding: PayloadEncoding,
    pub event_count: usize,
}

impl RecordingPayload {
    /// Decodes the payload back into events.
    pub fn decode(&self) -> Result<Vec<ReplayEvent>, BufferError> {
        match self.encoding {
            PayloadEncoding::Json => Ok(serde_json::from_slice(&self.bytes)?),
            PayloadEncoding::Gzip => {
                let mut json = Vec::new();
                GzDecoder::new(self.bytes.as_slice()).read_to_end(&mut json)?;
                Ok(serde_json::from_slice(&json)?)
            }
        }
    }
}

/// The JSON of one finalized generation, before compression.
#[derive(Debug, Clone)]
pub struct FinalizedEvents {
    pub json: Vec<u8>,
    pub event_count: usize,
    pub earliest_timestamp: Option<DateTime<Utc>>,
    /// Whether the generation starts with a full snapshot.
    pub has_checkout: bool,
}

impl FinalizedEvents {
    /// Produces the transport payload, gzipping when `compress` is set.
    pub fn into_payload(self, compress: bool) -> Result<RecordingPayload, BufferError> {
        if !compress {
            return Ok(RecordingPayload {
                bytes: self.json,
                encoding: PayloadEncoding::Json,
                event_count: self.event_count,
            });
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.json)?;
        Ok(RecordingPayload {
            bytes: encoder.finish()?,
            encoding: PayloadEncoding::Gzip,
            event_count: self.event_count,
        })
    }
}

/// Compresses on the blocking pool so the caller keeps accepting events.
pub async fn encode_payload(
    events: FinalizedEvents,
    compress: bool,
) -> Result<RecordingPayload, BufferError> {
    if !compress {
        return events.into_payload(false);
    }
    tokio::task::spawn_blocking(move || events.into_payload(true))
        .await
        .map_err(|e| BufferError::Worker(e.to_string()))?
}

/// Append-only, size-bounded accumulator of replay events.
#[derive(Debug)]
pub struct EventBuffer {
    events: Vec<ReplayEvent>,
    size: usize,
    has_checkout: bool,
    pending: Option<(Vec<ReplayEvent>, usize)>,
    max_size: usize,
    destroyed: bool,
}

impl EventBuffer {
    pub const fn new(max_size: usize) -> Self {
        Self {
            events: Vec::new(),
            size: 0,
            has_checkout: false,
            pending: None,
            max_size,
            destroyed: false,
        }
    }

    /// Appends an event to the current generation.
    pub fn append(&mut self, event: ReplayEvent) -> Result<(), BufferError> {
        if self.destroyed {
            return Err(BufferError::Destroyed);
        }

        let encoded_len = serde_json::to_vec(&event)?.len();
        let size = self.size + encoded_len;
        if size > self.max_size {
            return Err(BufferError::SizeExceeded {
                size,
                limit: self.max_size,
            });
        }

        if self.events.is_empty() {
            self.has_checkout = event.is_full_snapshot();
        }
        self.events.push(event);
        self.size = size;
        Ok(())
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether the current generation starts with a full snapshot.
    pub const fn has_checkout(&self) -> bool {
        self.has_checkout
    }

    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Whether a finalized generation awaits confirmation.
    pub const fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn events(&self) -> &[ReplayEvent] {
        &self.events
    }

    pub fn earliest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.events.iter().map(ReplayEvent::timestamp).min()
    }

    /// Drops the current generation without sending it.
    ///
    /// Used in buffer mode when a new checkout starts a fresh window.
    pub fn discard_window(&mut self) {
        self.events.clear();
        self.size = 0;
        self.has_checkout = false;
    }

    /// Moves the current generation out and serializes it.
    pub fn finalize(&mut self) -> Result<FinalizedEvents, BufferError> {
        if self.destroyed {
            return Err(BufferError::Destroyed);
        }
        if self.pending.is_some() {
            return Err(BufferError::FlushPending);
        }

        let json = serde_json::to_vec(&self.events)?;
        let finalized = FinalizedEvents {
            json,
            event_count: self.events.len(),
            earliest_timestamp: self.earliest_timestamp(),
            has_checkout: self.has_checkout,
        };

        let events = std::mem::take(&mut self.events);
        self.pending = Some((events, self.size));
        self.size = 0;
        self.has_checkout = false;
        Ok(finalized)
    }

    /// Forgets the finalized generation after the upload was accepted.
    pub fn clear(&mut self) {
        self.pending = None;
    }

    /// Puts an unconfirmed generation back in front of newer events.
    pub fn restore(&mut self) {
        let Some((mut events, size)) = self.pending.take() else {
            return;
        };
        if self.destroyed {
            return;
        }

        self.has_checkout = events.first().is_some_and(ReplayEvent::is_full_snapshot);
        events.append(&mut self.events);
        self.events = events;
        self.size += size;
    }

    /// Releases everything; later appends fail.
    pub fn destroy(&mut self) {
        self.events = Vec::new();
        self.pending = None;
        self.size = 0;
        self.has_checkout = false;
        self.destroyed = true;
    }
}
