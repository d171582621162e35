//! SQLite-backed durable store.
//!
//! A single database file in WAL mode. Every write goes through
//! [`Store::write_batch`], which holds an IMMEDIATE transaction for exactly
//! one batch; readers never block on it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use sessa_core::ts::{days_ago, now_ts, EPOCH};
use sessa_core::{
    parse_entry, Event, EventKind, MigrationRecord, ParseFailure, Pattern, RawEntry, Session,
};

use crate::error::{Result, StoreError};
use crate::filter::EventFilter;
use crate::migrate;
use crate::patterns;

pub const META_LAST_INGEST_AT: &str = "last_ingest_at";
pub const META_PATTERN_WINDOW_DAYS: &str = "pattern_window_days";

/// Byte cursor over one append-only log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCursor {
    pub path: String,
    pub offset: u64,
    pub size: u64,
    pub mtime: i64,
}

/// Which stored raw entries a re-derivation pass covers.
#[derive(Debug, Clone, PartialEq)]
pub enum RawSelector {
    All,
    ObservedSince(String),
    Sessions(Vec<String>),
}

/// Outcome of storing one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Stored {
    Duplicate,
    Event,
    Failed(ParseFailure),
}

/// Outcome of re-deriving an already stored entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Rederived {
    Event { resolved_failure: bool },
    Failed(ParseFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredParseFailure {
    pub uuid: String,
    pub session_id: String,
    pub reason: String,
    pub recorded_at: String,
    pub resolved_at: Option<String>,
    pub line: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub schema_version: u32,
    pub raw_entries: u64,
    pub events: u64,
    pub sessions: u64,
    pub open_parse_failures: u64,
    pub patterns: u64,
    pub last_ingest_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalizeReport {
    pub sessions_refreshed: usize,
    pub patterns: usize,
}

/// The durable store. One handle per caller; no process-wide connection.
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create a store file and migrate it to the newest schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_target(db_path, migrate::latest_version())
    }

    /// Open or create a store file and migrate it up to `target` only.
    pub fn open_with_target(db_path: &Path, target: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let conn = Connection::open(db_path)?;
        let mut store = Self {
            conn,
            path: Some(db_path.to_path_buf()),
        };
        store.apply_pragmas()?;
        migrate::run(&mut store.conn, target)?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn, path: None };
        store.apply_pragmas()?;
        migrate::run(&mut store.conn, migrate::latest_version())?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Apply any pending migrations; returns those applied by this call.
    pub fn migrate(&mut self) -> Result<Vec<MigrationRecord>> {
        migrate::run(&mut self.conn, migrate::latest_version())
    }

    pub fn schema_version(&self) -> Result<u32> {
        migrate::current_version(&self.conn)
    }

    pub fn migrations(&self) -> Result<Vec<MigrationRecord>> {
        migrate::applied(&self.conn)
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Run `f` inside one IMMEDIATE transaction. Commits on `Ok`, rolls back
    /// on `Err` (the transaction is dropped uncommitted).
    pub fn write_batch<T, E>(&mut self, f: impl FnOnce(&BatchWriter<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let writer = BatchWriter { tx };
        let out = f(&writer)?;
        writer.tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    pub fn set_meta(&mut self, key: &str, value: &str) -> Result<()> {
        self.write_batch(|w| w.set_meta(key, value))
    }

    /// Refresh the rollups of every dirty session, clear the flags and
    /// rebuild the pattern cache, all in one transaction.
    pub fn finalize(&mut self) -> Result<FinalizeReport> {
        let window = self.pattern_window_days()?;
        self.write_batch(|w| {
            let dirty = w.dirty_sessions()?;
            let sessions_refreshed = w.refresh_sessions(&dirty)?;
            w.clear_dirty(&dirty)?;
            let patterns = w.rebuild_patterns(window)?;
            Ok(FinalizeReport {
                sessions_refreshed,
                patterns,
            })
        })
    }

    /// Recompute the pattern cache over the last `window_days` days.
    pub fn rebuild_patterns(&mut self, window_days: u32) -> Result<usize> {
        self.write_batch(|w| {
            w.set_meta(META_PATTERN_WINDOW_DAYS, &window_days.to_string())?;
            w.rebuild_patterns(window_days)
        })
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn last_ingest_at(&self) -> Result<Option<String>> {
        self.meta(META_LAST_INGEST_AT)
    }

    pub fn pattern_window_days(&self) -> Result<u32> {
        Ok(self
            .meta(META_PATTERN_WINDOW_DAYS)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(patterns::DEFAULT_WINDOW_DAYS))
    }

    pub fn file_cursor(&self, path: &str) -> Result<Option<FileCursor>> {
        Ok(self
            .conn
            .query_row(
                "SELECT path, byte_offset, size, mtime FROM ingested_files WHERE path = ?1",
                params![path],
                |row| {
                    Ok(FileCursor {
                        path: row.get(0)?,
                        offset: row.get::<_, i64>(1)? as u64,
                        size: row.get::<_, i64>(2)? as u64,
                        mtime: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let (suffix, values) = filter.to_sql();
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events{suffix}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn event(&self, uuid: &str) -> Result<Option<Event>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE uuid = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![uuid], event_from_row)
            .optional()?)
    }

    pub fn raw_entry(&self, uuid: &str) -> Result<Option<RawEntry>> {
        Ok(self
            .conn
            .query_row(
                "SELECT uuid, session_id, project_path, raw_text, observed_at
                 FROM raw_entries WHERE uuid = ?1",
                params![uuid],
                raw_from_row,
            )
            .optional()?)
    }

    /// Page through stored raw entries in insertion order. Pass the last
    /// returned rowid as `after` to continue.
    pub fn raw_entries_page(
        &self,
        selector: &RawSelector,
        after: i64,
        limit: usize,
    ) -> Result<Vec<(i64, RawEntry)>> {
        let mut values: Vec<rusqlite::types::Value> =
            vec![after.into(), (limit as i64).into()];
        let extra = match selector {
            RawSelector::All => String::new(),
            RawSelector::ObservedSince(ts) => {
                values.push(ts.clone().into());
                " AND observed_at >= ?3".to_string()
            }
            RawSelector::Sessions(ids) if ids.is_empty() => " AND 0".to_string(),
            RawSelector::Sessions(ids) => {
                let mut slots = Vec::new();
                for id in ids {
                    values.push(id.clone().into());
                    slots.push(format!("?{}", values.len()));
                }
                format!(" AND session_id IN ({})", slots.join(", "))
            }
        };
        let sql = format!(
            "SELECT rowid, uuid, session_id, project_path, raw_text, observed_at
             FROM raw_entries WHERE rowid > ?1{extra} ORDER BY rowid LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    RawEntry {
                        uuid: row.get(1)?,
                        session_id: row.get(2)?,
                        project_path: row.get(3)?,
                        raw_text: row.get(4)?,
                        observed_at: row.get(5)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn session(&self, session_id: &str) -> Result<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![session_id], session_from_row)
            .optional()?)
    }

    /// Most recently active first.
    pub fn sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY last_seen DESC, session_id LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], session_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Newest first; unresolved and resolved alike.
    pub fn parse_failures(&self, limit: usize) -> Result<Vec<StoredParseFailure>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.uuid, f.session_id, f.reason, f.recorded_at, f.resolved_at, r.raw_text
             FROM parse_failures f JOIN raw_entries r ON r.uuid = f.uuid
             ORDER BY f.recorded_at DESC, f.uuid LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(StoredParseFailure {
                    uuid: row.get(0)?,
                    session_id: row.get(1)?,
                    reason: row.get(2)?,
                    recorded_at: row.get(3)?,
                    resolved_at: row.get(4)?,
                    line: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<u64> {
            Ok(self.conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
        };
        Ok(StoreStats {
            schema_version: self.schema_version()?,
            raw_entries: count("SELECT COUNT(*) FROM raw_entries")?,
            events: count("SELECT COUNT(*) FROM events")?,
            sessions: count("SELECT COUNT(*) FROM sessions")?,
            open_parse_failures: count(
                "SELECT COUNT(*) FROM parse_failures WHERE resolved_at IS NULL",
            )?,
            patterns: count("SELECT COUNT(*) FROM patterns")?,
            last_ingest_at: self.last_ingest_at()?,
        })
    }

    /// Watermark per session. With `ids`, every requested session is present
    /// in the result; unknown ones carry [`EPOCH`].
    pub fn sync_status(&self, ids: Option<&[String]>) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        match ids {
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT session_id, latest_observed_at FROM sync_cursors")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (id, ts) = row?;
                    out.insert(id, ts);
                }
            }
            Some(ids) => {
                let mut stmt = self.conn.prepare(
                    "SELECT latest_observed_at FROM sync_cursors WHERE session_id = ?1",
                )?;
                for id in ids {
                    let ts: Option<String> = stmt
                        .query_row(params![id], |row| row.get(0))
                        .optional()?;
                    out.insert(id.clone(), ts.unwrap_or_else(|| EPOCH.to_string()));
                }
            }
        }
        Ok(out)
    }

    pub fn dirty_sessions(&self) -> Result<Vec<String>> {
        dirty_sessions(&self.conn)
    }

    /// Cached patterns, optionally of one type, most frequent first.
    pub fn patterns(&self, pattern_type: Option<&str>) -> Result<Vec<Pattern>> {
        let mut stmt = self.conn.prepare(
            "SELECT pattern_type, pattern_key, count, last_seen, metadata, computed_at
             FROM patterns WHERE ?1 IS NULL OR pattern_type = ?1
             ORDER BY pattern_type, count DESC, pattern_key",
        )?;
        let rows = stmt
            .query_map(params![pattern_type], |row| {
                let metadata: String = row.get(4)?;
                Ok(Pattern {
                    pattern_type: row.get(0)?,
                    pattern_key: row.get(1)?,
                    count: row.get::<_, i64>(2)? as u64,
                    last_seen: row.get(3)?,
                    metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                    computed_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Merge WAL back into main DB so users see a single file when idle.
        let _ = self
            .conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
    }
}

/// Write handle valid for the span of one [`Store::write_batch`] call.
pub struct BatchWriter<'a> {
    tx: Transaction<'a>,
}

impl BatchWriter<'_> {
    /// Insert a raw entry at most once. `true` when it was new.
    pub fn insert_raw(&self, raw: &RawEntry) -> Result<bool> {
        let n = self.tx.execute(
            "INSERT OR IGNORE INTO raw_entries
             (uuid, session_id, project_path, raw_text, observed_at, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                raw.uuid,
                raw.session_id,
                raw.project_path,
                raw.raw_text,
                raw.observed_at,
                now_ts()
            ],
        )?;
        Ok(n > 0)
    }

    pub fn upsert_event(&self, ev: &Event) -> Result<()> {
        self.tx.execute(
            "INSERT INTO events
             (uuid, session_id, project_path, kind, timestamp, tool_name, command, model,
              input_tokens, output_tokens, cache_read_tokens, git_branch, cwd, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(uuid) DO UPDATE SET
               session_id = excluded.session_id,
               project_path = excluded.project_path,
               kind = excluded.kind,
               timestamp = excluded.timestamp,
               tool_name = excluded.tool_name,
               command = excluded.command,
               model = excluded.model,
               input_tokens = excluded.input_tokens,
               output_tokens = excluded.output_tokens,
               cache_read_tokens = excluded.cache_read_tokens,
               git_branch = excluded.git_branch,
               cwd = excluded.cwd,
               payload = excluded.payload",
            params![
                ev.uuid,
                ev.session_id,
                ev.project_path,
                ev.kind.as_str(),
                ev.timestamp,
                ev.tool_name,
                ev.command,
                ev.model,
                ev.input_tokens as i64,
                ev.output_tokens as i64,
                ev.cache_read_tokens as i64,
                ev.git_branch,
                ev.cwd,
                ev.payload.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn record_parse_failure(&self, session_id: &str, failure: &ParseFailure) -> Result<()> {
        self.tx.execute(
            "INSERT INTO parse_failures (uuid, session_id, reason, recorded_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(uuid) DO UPDATE SET reason = excluded.reason, resolved_at = NULL",
            params![failure.uuid, session_id, failure.reason, now_ts()],
        )?;
        Ok(())
    }

    /// Mark an open failure resolved. `true` if one was open.
    pub fn resolve_parse_failure(&self, uuid: &str) -> Result<bool> {
        let n = self.tx.execute(
            "UPDATE parse_failures SET resolved_at = ?2 WHERE uuid = ?1 AND resolved_at IS NULL",
            params![uuid, now_ts()],
        )?;
        Ok(n > 0)
    }

    /// Store one entry with at-most-once semantics: insert the raw line and,
    /// if it was new, its event or parse failure.
    ///
    /// The session's sync cursor is touched for every new entry (`dirty`
    /// flags it for the next finalize). Only a timestamp the record carried
    /// itself may raise the watermark.
    pub fn store_entry(&self, raw: &RawEntry, dirty: bool) -> Result<Stored> {
        if !self.insert_raw(raw)? {
            return Ok(Stored::Duplicate);
        }
        match parse_entry(raw) {
            Ok(ev) => {
                let own_ts = ev.payload.get("timestamp_inferred").is_none();
                let mark = if own_ts { raw.observed_at.as_str() } else { EPOCH };
                self.advance_cursor(&raw.session_id, mark, dirty)?;
                self.upsert_event(&ev)?;
                Ok(Stored::Event)
            }
            Err(failure) => {
                tracing::debug!(uuid = %failure.uuid, reason = %failure.reason, "parse failure");
                self.advance_cursor(&raw.session_id, EPOCH, dirty)?;
                self.record_parse_failure(&raw.session_id, &failure)?;
                Ok(Stored::Failed(failure))
            }
        }
    }

    /// Re-run the parser over an already stored entry.
    pub fn rederive(&self, raw: &RawEntry) -> Result<Rederived> {
        match parse_entry(raw) {
            Ok(ev) => {
                self.upsert_event(&ev)?;
                let resolved_failure = self.resolve_parse_failure(&raw.uuid)?;
                Ok(Rederived::Event { resolved_failure })
            }
            Err(failure) => {
                self.record_parse_failure(&raw.session_id, &failure)?;
                Ok(Rederived::Failed(failure))
            }
        }
    }

    /// Raise a session's watermark to `observed_at` if it is newer.
    pub fn advance_cursor(&self, session_id: &str, observed_at: &str, dirty: bool) -> Result<()> {
        self.tx.execute(
            "INSERT INTO sync_cursors (session_id, latest_observed_at, dirty, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id) DO UPDATE SET
               latest_observed_at = MAX(latest_observed_at, excluded.latest_observed_at),
               dirty = MAX(dirty, excluded.dirty),
               updated_at = excluded.updated_at",
            params![session_id, observed_at, dirty as i64, now_ts()],
        )?;
        Ok(())
    }

    pub fn set_file_cursor(&self, cursor: &FileCursor) -> Result<()> {
        self.tx.execute(
            "INSERT INTO ingested_files (path, byte_offset, size, mtime, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
               byte_offset = excluded.byte_offset,
               size = excluded.size,
               mtime = excluded.mtime,
               updated_at = excluded.updated_at",
            params![
                cursor.path,
                cursor.offset as i64,
                cursor.size as i64,
                cursor.mtime,
                now_ts()
            ],
        )?;
        Ok(())
    }

    /// Recompute the rollup of each given session from its own rows only.
    pub fn refresh_sessions(&self, ids: &[String]) -> Result<usize> {
        let mut stmt = self.tx.prepare(
            "INSERT INTO sessions
             (session_id, project_path, first_seen, last_seen, entry_count, event_count,
              tool_call_count, input_tokens, output_tokens, parse_failures, updated_at)
             SELECT r.session_id,
                    MAX(r.project_path),
                    MIN(COALESCE(e.timestamp, r.observed_at)),
                    MAX(COALESCE(e.timestamp, r.observed_at)),
                    COUNT(*),
                    COUNT(e.uuid),
                    COALESCE(SUM(e.kind = 'tool_call'), 0),
                    COALESCE(SUM(e.input_tokens), 0),
                    COALESCE(SUM(e.output_tokens), 0),
                    COUNT(*) - COUNT(e.uuid),
                    ?2
             FROM raw_entries r LEFT JOIN events e ON e.uuid = r.uuid
             WHERE r.session_id = ?1
             GROUP BY r.session_id
             ON CONFLICT(session_id) DO UPDATE SET
               project_path = excluded.project_path,
               first_seen = excluded.first_seen,
               last_seen = excluded.last_seen,
               entry_count = excluded.entry_count,
               event_count = excluded.event_count,
               tool_call_count = excluded.tool_call_count,
               input_tokens = excluded.input_tokens,
               output_tokens = excluded.output_tokens,
               parse_failures = excluded.parse_failures,
               updated_at = excluded.updated_at",
        )?;
        let now = now_ts();
        let mut refreshed = 0;
        for id in ids {
            refreshed += stmt.execute(params![id, now])?;
        }
        Ok(refreshed)
    }

    pub fn dirty_sessions(&self) -> Result<Vec<String>> {
        dirty_sessions(&self.tx)
    }

    pub fn clear_dirty(&self, ids: &[String]) -> Result<()> {
        let mut stmt = self
            .tx
            .prepare("UPDATE sync_cursors SET dirty = 0 WHERE session_id = ?1")?;
        for id in ids {
            stmt.execute(params![id])?;
        }
        Ok(())
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.tx.execute(
            "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn rebuild_patterns(&self, window_days: u32) -> Result<usize> {
        let computed = patterns::compute(&self.tx, &days_ago(window_days), &now_ts())?;
        patterns::replace_all(&self.tx, &computed)?;
        tracing::debug!(count = computed.len(), window_days, "rebuilt pattern cache");
        Ok(computed.len())
    }
}

const EVENT_COLUMNS: &str = "uuid, session_id, project_path, kind, timestamp, tool_name, command, \
     model, input_tokens, output_tokens, cache_read_tokens, git_branch, cwd, payload";

const SESSION_COLUMNS: &str = "session_id, project_path, first_seen, last_seen, entry_count, \
     event_count, tool_call_count, input_tokens, output_tokens, parse_failures, updated_at";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let kind: String = row.get(3)?;
    let payload: String = row.get(13)?;
    Ok(Event {
        uuid: row.get(0)?,
        session_id: row.get(1)?,
        project_path: row.get(2)?,
        kind: EventKind::from_name(&kind),
        timestamp: row.get(4)?,
        tool_name: row.get(5)?,
        command: row.get(6)?,
        model: row.get(7)?,
        input_tokens: row.get::<_, i64>(8)? as u64,
        output_tokens: row.get::<_, i64>(9)? as u64,
        cache_read_tokens: row.get::<_, i64>(10)? as u64,
        git_branch: row.get(11)?,
        cwd: row.get(12)?,
        payload: serde_json::from_str(&payload).unwrap_or_default(),
    })
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        uuid: row.get(0)?,
        session_id: row.get(1)?,
        project_path: row.get(2)?,
        raw_text: row.get(3)?,
        observed_at: row.get(4)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        project_path: row.get(1)?,
        first_seen: row.get(2)?,
        last_seen: row.get(3)?,
        entry_count: row.get::<_, i64>(4)? as u64,
        event_count: row.get::<_, i64>(5)? as u64,
        tool_call_count: row.get::<_, i64>(6)? as u64,
        input_tokens: row.get::<_, i64>(7)? as u64,
        output_tokens: row.get::<_, i64>(8)? as u64,
        parse_failures: row.get::<_, i64>(9)? as u64,
        updated_at: row.get(10)?,
    })
}

fn dirty_sessions(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT session_id FROM sync_cursors WHERE dirty = 1 ORDER BY session_id")?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::EventFilter;
    use sessa_core::pattern_type::{COMMAND_FREQUENCY, TOOL_FREQUENCY, TOOL_SEQUENCE};
    use sessa_core::LineContext;

    fn ctx(session: &str) -> LineContext {
        LineContext {
            session_id: session.into(),
            project_path: "-home-me-proj".into(),
            fallback_ts: "2025-01-01T00:00:00.000Z".into(),
        }
    }

    fn tool_line(uuid: &str, session: &str, ts: &str, tool: &str) -> String {
        let input = if tool == "Bash" {
            serde_json::json!({"command": "git status"})
        } else {
            serde_json::json!({"file_path": "/x"})
        };
        serde_json::json!({
            "uuid": uuid, "sessionId": session, "timestamp": ts, "type": "assistant",
            "message": {"usage": {"input_tokens": 10, "output_tokens": 5},
                        "content": [{"type": "tool_use", "id": format!("t-{uuid}"), "name": tool, "input": input}]}
        })
        .to_string()
    }

    fn store_lines(store: &mut Store, lines: &[String], dirty: bool) -> Vec<Stored> {
        store
            .write_batch(|w| {
                lines
                    .iter()
                    .map(|l| w.store_entry(&RawEntry::from_line(l, &ctx("s-file")), dirty))
                    .collect::<Result<Vec<_>>>()
            })
            .unwrap()
    }

    #[test]
    fn schema_is_current_after_open() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(&tmp.path().join("sessa.db")).unwrap();
        assert_eq!(store.schema_version().unwrap(), migrate::latest_version());
        assert_eq!(store.migrations().unwrap().len(), 6);
    }

    #[test]
    fn reopen_applies_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessa.db");
        let before = Store::open(&path).unwrap().migrations().unwrap();
        let mut store = Store::open(&path).unwrap();
        assert!(store.migrate().unwrap().is_empty());
        assert_eq!(store.migrations().unwrap(), before);
    }

    #[test]
    fn duplicate_uuid_is_a_no_op() {
        let mut store = Store::open_in_memory().unwrap();
        let line = tool_line("u1", "s1", "2025-01-01T10:00:00Z", "Read");
        let out = store_lines(&mut store, &[line.clone(), line.clone()], false);
        assert_eq!(out, vec![Stored::Event, Stored::Duplicate]);
        let out = store_lines(&mut store, &[line], false);
        assert_eq!(out, vec![Stored::Duplicate]);
        assert_eq!(store.stats().unwrap().raw_entries, 1);
        assert_eq!(store.stats().unwrap().events, 1);
    }

    #[test]
    fn failed_parse_keeps_raw_entry() {
        let mut store = Store::open_in_memory().unwrap();
        let out = store_lines(&mut store, &["{\"uuid\":\"x\",\"type\":".to_string()], false);
        assert!(matches!(out[0], Stored::Failed(_)));
        let stats = store.stats().unwrap();
        assert_eq!(stats.raw_entries, 1);
        assert_eq!(stats.events, 0);
        assert_eq!(stats.open_parse_failures, 1);
        let failures = store.parse_failures(10).unwrap();
        assert_eq!(failures[0].line, "{\"uuid\":\"x\",\"type\":");
    }

    #[test]
    fn failed_batch_rolls_back() {
        let mut store = Store::open_in_memory().unwrap();
        let line = tool_line("u1", "s1", "2025-01-01T10:00:00Z", "Read");
        let res: Result<()> = store.write_batch(|w| {
            w.store_entry(&RawEntry::from_line(&line, &ctx("s1")), false)?;
            Err(StoreError::Locked(PathBuf::from("simulated")))
        });
        assert!(res.is_err());
        assert_eq!(store.stats().unwrap().raw_entries, 0);
        assert!(store.sync_status(None).unwrap().is_empty());
    }

    #[test]
    fn rederive_resolves_failure() {
        let mut store = Store::open_in_memory().unwrap();
        // Stored as a failure (bad timestamp), then repaired by a "newer parser":
        // simulate by re-deriving a corrected copy under the same uuid.
        let bad = r#"{"uuid":"u9","sessionId":"s1","type":"user","timestamp":"nope"}"#;
        store_lines(&mut store, &[bad.to_string()], false);
        let fixed = RawEntry {
            uuid: "u9".into(),
            session_id: "s1".into(),
            project_path: "-p".into(),
            raw_text: r#"{"uuid":"u9","sessionId":"s1","type":"user"}"#.into(),
            observed_at: "2025-01-01T00:00:00.000Z".into(),
        };
        let out = store.write_batch(|w| w.rederive(&fixed)).unwrap();
        assert_eq!(out, Rederived::Event { resolved_failure: true });
        let failures = store.parse_failures(10).unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].resolved_at.is_some());
        assert_eq!(store.stats().unwrap().open_parse_failures, 0);
    }

    #[test]
    fn sync_status_reports_epoch_for_unknown() {
        let mut store = Store::open_in_memory().unwrap();
        store_lines(
            &mut store,
            &[
                tool_line("a", "s1", "2025-01-01T10:00:00Z", "Read"),
                tool_line("b", "s1", "2025-01-01T09:00:00Z", "Read"),
            ],
            false,
        );
        let ids = vec!["s1".to_string(), "nope".to_string()];
        let status = store.sync_status(Some(&ids)).unwrap();
        assert_eq!(status["s1"], "2025-01-01T10:00:00.000Z");
        assert_eq!(status["nope"], EPOCH);
        assert_eq!(store.sync_status(None).unwrap().len(), 1);
    }

    #[test]
    fn finalize_refreshes_dirty_sessions_only() {
        let mut store = Store::open_in_memory().unwrap();
        store_lines(
            &mut store,
            &[
                tool_line("a", "s1", "2025-01-01T10:00:00Z", "Read"),
                tool_line("b", "s1", "2025-01-01T10:01:00Z", "Bash"),
                "not json".to_string(),
            ],
            true,
        );
        assert_eq!(store.dirty_sessions().unwrap(), vec!["s-file", "s1"]);
        let report = store.finalize().unwrap();
        assert_eq!(report.sessions_refreshed, 2);
        assert!(store.dirty_sessions().unwrap().is_empty());

        let s = store.session("s1").unwrap().unwrap();
        assert_eq!(s.entry_count, 2);
        assert_eq!(s.event_count, 2);
        assert_eq!(s.tool_call_count, 2);
        assert_eq!(s.input_tokens, 20);
        assert_eq!(s.first_seen, "2025-01-01T10:00:00.000Z");
        assert_eq!(s.last_seen, "2025-01-01T10:01:00.000Z");
        let broken = store.session("s-file").unwrap().unwrap();
        assert_eq!(broken.parse_failures, 1);
    }

    #[test]
    fn events_filtered_by_constraints() {
        let mut store = Store::open_in_memory().unwrap();
        store_lines(
            &mut store,
            &[
                tool_line("a", "s1", "2025-01-01T10:00:00Z", "Read"),
                tool_line("b", "s1", "2025-01-02T10:00:00Z", "Bash"),
                tool_line("c", "s2", "2025-01-03T10:00:00Z", "Bash"),
            ],
            false,
        );
        let bash = store.events(&EventFilter::new().tool("Bash")).unwrap();
        assert_eq!(bash.len(), 2);
        assert_eq!(bash[0].command.as_deref(), Some("git"));

        let recent_s1 = store
            .events(
                &EventFilter::new()
                    .since("2025-01-02T00:00:00.000Z")
                    .sessions(["s1"]),
            )
            .unwrap();
        assert_eq!(recent_s1.len(), 1);
        assert_eq!(recent_s1[0].uuid, "b");

        let limited = store.events(&EventFilter::new().limit(1)).unwrap();
        assert_eq!(limited[0].uuid, "a");
        assert!(store
            .events(&EventFilter::new().project_contains("nowhere"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn raw_pages_continue_after_rowid() {
        let mut store = Store::open_in_memory().unwrap();
        let lines: Vec<String> = (0..5)
            .map(|i| tool_line(&format!("u{i}"), "s1", "2025-01-01T10:00:00Z", "Read"))
            .collect();
        store_lines(&mut store, &lines, false);
        let first = store.raw_entries_page(&RawSelector::All, 0, 3).unwrap();
        assert_eq!(first.len(), 3);
        let rest = store
            .raw_entries_page(&RawSelector::All, first[2].0, 3)
            .unwrap();
        assert_eq!(rest.len(), 2);
        let none = store
            .raw_entries_page(&RawSelector::Sessions(vec!["other".into()]), 0, 10)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn patterns_rebuild_replaces_cache() {
        let mut store = Store::open_in_memory().unwrap();
        let now = time::OffsetDateTime::now_utc();
        let mut lines = Vec::new();
        for i in 0..4 {
            let t1 = sessa_core::ts::format_ts(now - time::Duration::minutes(10 - 2 * i));
            let t2 = sessa_core::ts::format_ts(now - time::Duration::minutes(9 - 2 * i));
            lines.push(tool_line(&format!("r{i}"), "s1", &t1, "Read"));
            lines.push(tool_line(&format!("b{i}"), "s1", &t2, "Bash"));
        }
        store_lines(&mut store, &lines, false);
        let n = store.rebuild_patterns(7).unwrap();
        assert!(n > 0);

        let tools = store.patterns(Some(TOOL_FREQUENCY)).unwrap();
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().all(|p| p.count == 4));
        let cmds = store.patterns(Some(COMMAND_FREQUENCY)).unwrap();
        assert_eq!(cmds[0].pattern_key, "git");
        let seqs = store.patterns(Some(TOOL_SEQUENCE)).unwrap();
        let keys: Vec<&str> = seqs.iter().map(|p| p.pattern_key.as_str()).collect();
        assert!(keys.contains(&"Read -> Bash"));
        assert!(keys.contains(&"Bash -> Read"));
        assert_eq!(store.pattern_window_days().unwrap(), 7);

        // A zero-day window sees nothing and clears the cache.
        assert_eq!(store.rebuild_patterns(0).unwrap(), 0);
        assert!(store.patterns(None).unwrap().is_empty());
    }

    #[test]
    fn meta_and_file_cursor_round_trip() {
        let mut store = Store::open_in_memory().unwrap();
        assert!(store.last_ingest_at().unwrap().is_none());
        store
            .set_meta(META_LAST_INGEST_AT, "2025-01-01T00:00:00.000Z")
            .unwrap();
        assert_eq!(
            store.last_ingest_at().unwrap().as_deref(),
            Some("2025-01-01T00:00:00.000Z")
        );

        let cursor = FileCursor {
            path: "/logs/a.jsonl".into(),
            offset: 120,
            size: 120,
            mtime: 1_700_000_000,
        };
        store.write_batch(|w| w.set_file_cursor(&cursor)).unwrap();
        assert_eq!(store.file_cursor("/logs/a.jsonl").unwrap(), Some(cursor));
        assert!(store.file_cursor("/logs/b.jsonl").unwrap().is_none());
    }
}
