//! Pattern/insight cache: the one table the store may clear and rebuild.

use std::collections::BTreeMap;

use rusqlite::{params, Connection};
use sessa_core::pattern_type::{COMMAND_FREQUENCY, TOOL_FREQUENCY, TOOL_SEQUENCE};
use sessa_core::Pattern;

/// Bigrams seen fewer times than this are noise.
pub const MIN_SEQUENCE_COUNT: u64 = 3;

pub const DEFAULT_WINDOW_DAYS: u32 = 7;

/// Recompute every pattern over events at or after `since`.
pub(crate) fn compute(
    conn: &Connection,
    since: &str,
    computed_at: &str,
) -> rusqlite::Result<Vec<Pattern>> {
    let mut out = frequency(
        conn,
        TOOL_FREQUENCY,
        "SELECT tool_name, COUNT(*), MAX(timestamp) FROM events
         WHERE kind = 'tool_call' AND tool_name IS NOT NULL AND timestamp >= ?1
         GROUP BY tool_name",
        since,
        computed_at,
    )?;
    out.extend(frequency(
        conn,
        COMMAND_FREQUENCY,
        "SELECT command, COUNT(*), MAX(timestamp) FROM events
         WHERE command IS NOT NULL AND timestamp >= ?1
         GROUP BY command",
        since,
        computed_at,
    )?);
    out.extend(sequences(conn, since, computed_at)?);
    Ok(out)
}

fn frequency(
    conn: &Connection,
    pattern_type: &str,
    sql: &str,
    since: &str,
    computed_at: &str,
) -> rusqlite::Result<Vec<Pattern>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![since], |row| {
            Ok(Pattern {
                pattern_type: pattern_type.to_string(),
                pattern_key: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
                last_seen: row.get(2)?,
                metadata: serde_json::json!({}),
                computed_at: computed_at.to_string(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Consecutive tool pairs within a session, e.g. `Read -> Edit`.
fn sequences(conn: &Connection, since: &str, computed_at: &str) -> rusqlite::Result<Vec<Pattern>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, tool_name, timestamp FROM events
         WHERE kind = 'tool_call' AND tool_name IS NOT NULL AND timestamp >= ?1
         ORDER BY session_id, timestamp, uuid",
    )?;
    let mut rows = stmt.query(params![since])?;

    // key -> (count, last_seen, sessions)
    let mut counts: BTreeMap<String, (u64, String, u64)> = BTreeMap::new();
    let mut prev: Option<(String, String)> = None;
    let mut seen_in_session: Vec<String> = Vec::new();

    while let Some(row) = rows.next()? {
        let session: String = row.get(0)?;
        let tool: String = row.get(1)?;
        let ts: String = row.get(2)?;

        match &prev {
            Some((prev_session, prev_tool)) if *prev_session == session => {
                let key = format!("{prev_tool} -> {tool}");
                let entry = counts.entry(key.clone()).or_insert((0, String::new(), 0));
                entry.0 += 1;
                if ts > entry.1 {
                    entry.1 = ts.clone();
                }
                if !seen_in_session.contains(&key) {
                    entry.2 += 1;
                    seen_in_session.push(key);
                }
            }
            _ => seen_in_session.clear(),
        }
        prev = Some((session, tool));
    }

    Ok(counts
        .into_iter()
        .filter(|(_, (count, _, _))| *count >= MIN_SEQUENCE_COUNT)
        .map(|(key, (count, last_seen, sessions))| Pattern {
            pattern_type: TOOL_SEQUENCE.to_string(),
            pattern_key: key,
            count,
            last_seen: Some(last_seen),
            metadata: serde_json::json!({ "sessions": sessions }),
            computed_at: computed_at.to_string(),
        })
        .collect())
}

/// Clear the cache and write `patterns` in its place. Caller owns the transaction.
pub(crate) fn replace_all(conn: &Connection, patterns: &[Pattern]) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM patterns", [])?;
    let mut stmt = conn.prepare(
        "INSERT INTO patterns (pattern_type, pattern_key, count, last_seen, metadata, computed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for p in patterns {
        stmt.execute(params![
            p.pattern_type,
            p.pattern_key,
            p.count as i64,
            p.last_seen,
            p.metadata.to_string(),
            p.computed_at,
        ])?;
    }
    Ok(())
}
