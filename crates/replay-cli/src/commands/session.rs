//! `replayctl session`: inspect and clear the persisted session.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use replay_core::{REPLAY_SESSION_KEY, ReplayId, Session};
use replay_store::SqliteSessionStore;

use crate::Config;

fn open_store(config: &Config) -> Result<SqliteSessionStore> {
    SqliteSessionStore::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))
}

pub fn show<W: Write>(writer: &mut W, config: &Config, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let Some(entry) = store
        .entry(REPLAY_SESSION_KEY)
        .context("failed to read persisted session")?
    else {
        if json {
            writeln!(writer, "null")?;
        } else {
            writeln!(writer, "No persisted session.")?;
        }
        return Ok(());
    };

    let session: Session =
        serde_json::from_str(&entry.value).context("persisted session is corrupt")?;
    if json {
        serde_json::to_writer_pretty(&mut *writer, &session)?;
        writeln!(writer)?;
    } else {
        write!(writer, "{}", format_session(&session, entry.updated_at))?;
    }
    Ok(())
}

pub fn clear<W: Write>(writer: &mut W, config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let existed = store
        .delete(REPLAY_SESSION_KEY)
        .context("failed to clear persisted session")?;
    if existed {
        writeln!(writer, "Cleared persisted session.")?;
    } else {
        writeln!(writer, "No persisted session.")?;
    }
    Ok(())
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn format_session(session: &Session, updated_at: DateTime<Utc>) -> String {
    let previous = session
        .previous_session_id
        .as_ref()
        .map_or("-", ReplayId::as_str);
    let unconfirmed = if session.dirty { "yes" } else { "no" };

    [
        format!("Replay: {}", session.id),
        format!("Sampled: {}", session.sampled),
        format!("Next segment: {}", session.segment_id),
        format!("Started: {}", format_timestamp(session.started)),
        format!("Last activity: {}", format_timestamp(session.last_activity)),
        format!("Unconfirmed flush: {unconfirmed}"),
        format!("Previous replay: {previous}"),
        format!("Saved: {}", format_timestamp(updated_at)),
    ]
    .iter()
    .fold(String::new(), |mut output, line| {
        output.push_str(line);
        output.push('\n');
        output
    })
}
