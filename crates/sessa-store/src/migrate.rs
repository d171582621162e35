//! Schema/migration engine.
//!
//! Migrations are an ordered list of `(version, name, apply)` records. Each
//! one runs in its own IMMEDIATE transaction together with the ledger insert
//! that records it, so a failed migration leaves both schema and ledger
//! exactly as they were.

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use sessa_core::ts::now_ts;
use sessa_core::MigrationRecord;

use crate::error::{Result, StoreError};

/// One forward schema change.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub apply: fn(&Transaction<'_>) -> rusqlite::Result<()>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        apply: initial_schema,
    },
    Migration {
        version: 2,
        name: "parse_failures",
        apply: parse_failures,
    },
    Migration {
        version: 3,
        name: "event_command",
        apply: event_command,
    },
    Migration {
        version: 4,
        name: "sync_cursors",
        apply: sync_cursors,
    },
    Migration {
        version: 5,
        name: "patterns",
        apply: patterns,
    },
    Migration {
        version: 6,
        name: "event_context",
        apply: event_context,
    },
];

/// Newest version this build knows how to produce.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

const LEDGER_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
";

/// Highest version recorded in the ledger, 0 for a fresh store.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.execute_batch(LEDGER_SQL)?;
    let v: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .optional()?
        .flatten();
    Ok(v.unwrap_or(0) as u32)
}

pub fn applied(conn: &Connection) -> Result<Vec<MigrationRecord>> {
    conn.execute_batch(LEDGER_SQL)?;
    let mut stmt =
        conn.prepare("SELECT version, name, applied_at FROM schema_migrations ORDER BY version")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(MigrationRecord {
                version: row.get::<_, i64>(0)? as u32,
                name: row.get(1)?,
                applied_at: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Apply every declared migration above the ledger's version, up to `target`.
/// Returns the records appended by this call; empty when already current.
pub fn run(conn: &mut Connection, target: u32) -> Result<Vec<MigrationRecord>> {
    run_list(conn, MIGRATIONS, target)
}

pub(crate) fn run_list(
    conn: &mut Connection,
    migrations: &[Migration],
    target: u32,
) -> Result<Vec<MigrationRecord>> {
    let mut prev = 0;
    for m in migrations {
        if m.version <= prev {
            return Err(StoreError::MigrationOrder(m.version));
        }
        prev = m.version;
    }

    let current = current_version(conn)?;
    if current > prev {
        return Err(StoreError::UnsupportedVersion {
            found: current,
            supported: prev,
        });
    }

    let mut newly = Vec::new();
    for m in migrations
        .iter()
        .filter(|m| m.version > current && m.version <= target)
    {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let fail = |source| StoreError::Migration {
            version: m.version,
            name: m.name,
            source,
        };
        (m.apply)(&tx).map_err(fail)?;
        let applied_at = now_ts();
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![m.version, m.name, applied_at],
        )
        .map_err(fail)?;
        tx.commit().map_err(fail)?;
        tracing::info!(version = m.version, name = m.name, "applied migration");
        newly.push(MigrationRecord {
            version: m.version,
            name: m.name.to_string(),
            applied_at,
        });
    }
    Ok(newly)
}

// ── Migrations ──────────────────────────────────────────────────────

fn initial_schema(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
CREATE TABLE raw_entries (
    uuid TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    project_path TEXT NOT NULL,
    raw_text TEXT NOT NULL,
    observed_at TEXT NOT NULL,
    ingested_at TEXT NOT NULL
);
CREATE INDEX idx_raw_session_observed ON raw_entries(session_id, observed_at);
CREATE INDEX idx_raw_observed ON raw_entries(observed_at);

CREATE TABLE events (
    uuid TEXT PRIMARY KEY REFERENCES raw_entries(uuid),
    session_id TEXT NOT NULL,
    project_path TEXT NOT NULL,
    kind TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    tool_name TEXT,
    model TEXT,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX idx_events_session_ts ON events(session_id, timestamp);
CREATE INDEX idx_events_ts ON events(timestamp);
CREATE INDEX idx_events_tool ON events(tool_name);

CREATE TABLE sessions (
    session_id TEXT PRIMARY KEY,
    project_path TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    entry_count INTEGER NOT NULL DEFAULT 0,
    event_count INTEGER NOT NULL DEFAULT 0,
    tool_call_count INTEGER NOT NULL DEFAULT 0,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    parse_failures INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE INDEX idx_sessions_last_seen ON sessions(last_seen);

CREATE TABLE ingested_files (
    path TEXT PRIMARY KEY,
    byte_offset INTEGER NOT NULL,
    size INTEGER NOT NULL,
    mtime INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
",
    )
}

fn parse_failures(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
CREATE TABLE parse_failures (
    uuid TEXT PRIMARY KEY REFERENCES raw_entries(uuid),
    session_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    resolved_at TEXT
);
CREATE INDEX idx_parse_failures_open ON parse_failures(resolved_at);
",
    )?;
    // Entries stored before failures were tracked are exactly the ones
    // without an event.
    tx.execute(
        "INSERT INTO parse_failures (uuid, session_id, reason, recorded_at)
         SELECT r.uuid, r.session_id, 'unparsed before failure tracking', ?1
         FROM raw_entries r LEFT JOIN events e ON e.uuid = r.uuid
         WHERE e.uuid IS NULL",
        params![now_ts()],
    )?;
    Ok(())
}

fn event_command(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "ALTER TABLE events ADD COLUMN command TEXT;
         CREATE INDEX idx_events_command ON events(command);",
    )?;
    let rows: Vec<(String, String)> = {
        let mut stmt = tx.prepare(
            "SELECT e.uuid, r.raw_text FROM events e
             JOIN raw_entries r ON r.uuid = e.uuid
             WHERE e.kind = 'tool_call'",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    let mut update = tx.prepare("UPDATE events SET command = ?2 WHERE uuid = ?1")?;
    for (uuid, raw_text) in &rows {
        if let Some(cmd) = sessa_core::extract_command(raw_text) {
            update.execute(params![uuid, cmd])?;
        }
    }
    Ok(())
}

fn sync_cursors(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
CREATE TABLE sync_cursors (
    session_id TEXT PRIMARY KEY,
    latest_observed_at TEXT NOT NULL,
    dirty INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE INDEX idx_sync_cursors_dirty ON sync_cursors(dirty) WHERE dirty = 1;
",
    )?;
    // Only a timestamp the record carried itself may seed a watermark;
    // untimed or unparsable lines hold the ingestion time in observed_at.
    tx.execute(
        "INSERT INTO sync_cursors (session_id, latest_observed_at, dirty, updated_at)
         SELECT r.session_id,
                COALESCE(MAX(CASE
                    WHEN e.uuid IS NOT NULL
                     AND (CASE WHEN json_valid(r.raw_text)
                               THEN json_type(r.raw_text, '$.timestamp') END) = 'text'
                    THEN r.observed_at END), ?2),
                0, ?1
         FROM raw_entries r LEFT JOIN events e ON e.uuid = r.uuid
         GROUP BY r.session_id",
        params![now_ts(), sessa_core::ts::EPOCH],
    )?;
    Ok(())
}

fn patterns(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
CREATE TABLE patterns (
    pattern_type TEXT NOT NULL,
    pattern_key TEXT NOT NULL,
    count INTEGER NOT NULL,
    last_seen TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    computed_at TEXT NOT NULL,
    PRIMARY KEY (pattern_type, pattern_key)
);
",
    )
}

/// Forward-looking: historical rows stay NULL until `ingest --force`.
fn event_context(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "ALTER TABLE events ADD COLUMN git_branch TEXT;
         ALTER TABLE events ADD COLUMN cwd TEXT;",
    )
}
