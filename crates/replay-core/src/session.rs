//! Replay sessions and their sticky persistence.
//!
//! A [`Session`] is one recording period: it has an id, a start time, the
//! last activity time, the next segment id, its sampling decision and a
//! `dirty` flag that is set while a flush is unconfirmed. Sticky sessions are
//! written to a [`SessionStore`] after every mutation so a reload picks them
//! up again.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ReplayId, SampleDecision};

/// Storage key under which the sticky session lives.
pub const REPLAY_SESSION_KEY: &str = "replay_session";

/// Session persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store failed.
    #[error("session store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The session could not be encoded.
    #[error("failed to encode session: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Key-value string storage for sticky sessions.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store, scoped to the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// One recording period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: ReplayId,
    pub started: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Id of the next segment to send.
    pub segment_id: u32,
    pub sampled: SampleDecision,
    /// Set while a flush has been started but not confirmed.
    #[serde(default)]
    pub dirty: bool,
    /// The session this one replaced after expiring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_session_id: Option<ReplayId>,
}

impl Session {
    pub const fn new(
        id: ReplayId,
        sampled: SampleDecision,
        previous_session_id: Option<ReplayId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            started: now,
            last_activity: now,
            segment_id: 0,
            sampled,
            dirty: false,
            previous_session_id,
        }
    }

    /// Records activity at `now`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    /// True once the session outlived `max_age` or idled beyond `idle`.
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration, idle: Duration) -> bool {
        now - self.started > max_age || now - self.last_activity > idle
    }

    /// Hands out the id for the segment being flushed and advances the counter.
    pub fn increment_segment(&mut self) -> u32 {
        let current = self.segment_id;
        self.segment_id += 1;
        current
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

/// Session expiry thresholds.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub idle_expire: Duration,
    pub max_replay_duration: Duration,
}

/// How a session should be loaded or created.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub sticky: bool,
}

/// Whether `session` has to be replaced by a new one.
///
/// A buffering session that never sent anything is kept indefinitely: it only
/// holds a rolling window, so its age is meaningless.
pub fn should_refresh_session(session: &Session, timeouts: SessionTimeouts, now: DateTime<Utc>) -> bool {
    if session.sampled == SampleDecision::Buffer && session.segment_id == 0 {
        return false;
    }
    session.is_expired(now, timeouts.max_replay_duration, timeouts.idle_expire)
}

/// Reads the sticky session, treating corrupt or unreadable entries as absent.
pub fn fetch_session(store: &dyn SessionStore) -> Option<Session> {
    let raw = match store.get(REPLAY_SESSION_KEY) {
        Ok(raw) => raw?,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read persisted session");
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(session) => Some(session),
        Err(e) => {
            tracing::warn!(error = %e, "discarding corrupt persisted session");
            None
        }
    }
}

/// Writes the session to the store.
pub fn save_session(store: &dyn SessionStore, session: &Session) -> Result<(), StoreError> {
    let encoded = serde_json::to_string(session)?;
    store.set(REPLAY_SESSION_KEY, &encoded)
}

/// Removes the sticky session.
pub fn clear_session(store: &dyn SessionStore) -> Result<(), StoreError> {
    store.remove(REPLAY_SESSION_KEY)
}

/// Reuses the persisted session if it is still valid, otherwise creates one.
///
/// `sample` is only invoked when a new session is needed. A newly created
/// sticky session is persisted before it is returned; a store failure is
/// logged and the session lives on in memory only.
pub fn load_or_create_session(
    store: Option<&dyn SessionStore>,
    options: SessionOptions,
    timeouts: SessionTimeouts,
    previous_session_id: Option<ReplayId>,
    now: DateTime<Utc>,
    sample: impl FnOnce() -> SampleDecision,
) -> Session {
    let sticky_store = store.filter(|_| options.sticky);

    let existing = sticky_store.and_then(fetch_session);
    let previous_session_id = match existing {
        Some(session) if !should_refresh_session(&session, timeouts, now) => {
            tracing::debug!(replay_id = %session.id, "using existing session");
            return session;
        }
        Some(session) => {
            tracing::debug!(replay_id = %session.id, "persisted session expired");
            Some(session.id)
        }
        None => previous_session_id,
    };

    create_session(sticky_store, sample(), previous_session_id, now)
}

/// Starts a fresh session with a new id and persists it when `store` is given.
///
/// A store failure is logged; the session still lives on in memory.
pub fn create_session(
    store: Option<&dyn SessionStore>,
    sampled: SampleDecision,
    previous_session_id: Option<ReplayId>,
    now: DateTime<Utc>,
) -> Session {
    let session = Session::new(ReplayId::generate(), sampled, previous_session_id, now);
    tracing::debug!(replay_id = %session.id, sampled = %session.sampled, "created new session");

    if let Some(store) = store {
        if let Err(e) = save_session(store, &session) {
            tracing::warn!(error = %e, "failed to persist new session");
        }
    }

    session
}
