//! Durable record of snapshots uploaded to the display.
//!
//! Rows come back in upload order, oldest first, which is what pruning relies
//! on: everything except the newest `retain` identifiers is deleted from the
//! device, a batch at a time, and each batch only leaves the ledger once the
//! device accepted the delete.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::platform::device::DisplayDevice;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS uploaded (
    id INTEGER PRIMARY KEY,
    filename TEXT NOT NULL,
    uploaded_at TEXT
);
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub identifier: String,
    pub uploaded_at: DateTime<Utc>,
}

pub struct ContentLedger {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for ContentLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentLedger").finish_non_exhaustive()
    }
}

impl ContentLedger {
    /// Opens or creates the ledger file, creating parent directories.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let ledger = Self::from_connection(Connection::open(path)?)?;
        info!(path = %path.display(), entries = ledger.list()?.len(), "ledger ready");
        Ok(ledger)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `identifier` as uploaded now.
    pub fn append(&self, identifier: &str) -> Result<()> {
        self.append_at(identifier, Utc::now())
    }

    /// Record `identifier` with `uploaded_at`, clamped so stamps never go
    /// backwards when the wall clock steps back.
    pub fn append_at(&self, identifier: &str, uploaded_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        let latest: Option<String> = conn
            .query_row(
                "SELECT uploaded_at FROM uploaded ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let stamp = match latest.as_deref().map(parse_timestamp) {
            Some(previous) if previous > uploaded_at => {
                warn!(%previous, now = %uploaded_at, "clock stepped back; reusing last upload time");
                previous
            }
            _ => uploaded_at,
        };
        conn.execute(
            "INSERT INTO uploaded (filename, uploaded_at) VALUES (?1, ?2)",
            params![identifier, format_timestamp(stamp)],
        )?;
        debug!(identifier, "ledger append");
        Ok(())
    }

    /// Identifiers, oldest first.
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .entries()?
            .into_iter()
            .map(|entry| entry.identifier)
            .collect())
    }

    pub fn entries(&self) -> Result<Vec<ContentEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT filename, uploaded_at FROM uploaded ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (identifier, raw) = row?;
            let uploaded_at = raw
                .as_deref()
                .map(parse_timestamp)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            entries.push(ContentEntry {
                identifier,
                uploaded_at,
            });
        }
        Ok(entries)
    }

    /// Remove every row whose identifier is in `identifiers`.
    pub fn delete(&self, identifiers: &[String]) -> Result<usize> {
        if identifiers.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; identifiers.len()].join(",");
        let sql = format!("DELETE FROM uploaded WHERE filename IN ({placeholders})");
        let removed = self
            .conn()
            .execute(&sql, params_from_iter(identifiers.iter()))?;
        debug!(removed, requested = identifiers.len(), "ledger delete");
        Ok(removed)
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub retained: Vec<String>,
}

/// Delete all but the newest `retain` uploads from the device and the ledger.
///
/// Batches go oldest first. A failed device delete stops the pass with that
/// batch and every later one still recorded.
#[instrument(skip(ledger, device))]
pub async fn prune(
    ledger: &ContentLedger,
    device: &dyn DisplayDevice,
    retain: usize,
    batch_size: usize,
) -> Result<PruneReport> {
    let mut identifiers = ledger.list()?;
    let keep_from = identifiers.len().saturating_sub(retain);
    let retained = identifiers.split_off(keep_from);
    let stale = identifiers;

    if stale.is_empty() {
        return Ok(PruneReport {
            deleted: Vec::new(),
            retained,
        });
    }

    let mut deleted = Vec::with_capacity(stale.len());
    for batch in stale.chunks(batch_size.max(1)) {
        if let Err(err) = device.delete(batch).await {
            warn!(
                batch = ?batch,
                already_deleted = deleted.len(),
                error = %err,
                "device delete failed; keeping batch in ledger"
            );
            return Err(err);
        }
        ledger.delete(batch)?;
        deleted.extend_from_slice(batch);
    }

    info!(deleted = deleted.len(), retained = ?retained, "pruned old snapshots");
    Ok(PruneReport { deleted, retained })
}
