//! Ingestion pipeline: log files -> raw entries + events, exactly once.
//!
//! Work is cut into batches of `batch_size` lines. Each batch is one store
//! transaction covering the raw inserts, their events or parse failures,
//! the file cursor advance and the rollups of the sessions it touched.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sessa_core::ts::{from_unix, now_ts};
use sessa_core::{LineContext, RawEntry};
use sessa_store::sqlite_store::META_LAST_INGEST_AT;
use sessa_store::{
    ingest_lock_path, FileCursor, FileLock, RawSelector, Rederived, Store, Stored,
};

use crate::discover::{discover, LineReader, LogFile};
use crate::error::IngestError;

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestScope {
    All,
    /// Files modified at or after this canonical timestamp.
    Since(String),
    Sessions(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub scope: IngestScope,
    /// Rescan from offset zero and re-derive events from stored raw entries.
    pub force: bool,
    pub batch_size: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            scope: IngestScope::All,
            force: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionReport {
    pub started_at: String,
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub scanned: usize,
    pub new_raw_entries: usize,
    pub duplicates: usize,
    pub new_events: usize,
    pub parse_failures: usize,
    pub rederived: usize,
    pub resolved_failures: usize,
    pub sessions_touched: usize,
}

/// Ingest the log tree under `log_dir` into `store`.
pub fn ingest(
    store: &mut Store,
    log_dir: &Path,
    opts: &IngestOptions,
) -> Result<IngestionReport, IngestError> {
    let _lock = match store.path() {
        Some(db) => Some(FileLock::acquire(&ingest_lock_path(db))?),
        None => None,
    };
    let batch_size = opts.batch_size.max(1);
    let mut report = IngestionReport {
        started_at: now_ts(),
        ..Default::default()
    };
    let mut touched = BTreeSet::new();

    for file in discover(log_dir)? {
        if !in_scope(&file, &opts.scope) {
            report.files_skipped += 1;
            continue;
        }
        report.files_scanned += 1;
        scan_file(store, &file, opts, batch_size, &mut report, &mut touched)?;
    }

    if opts.force {
        rederive(store, &opts.scope, batch_size, &mut report, &mut touched)?;
    }

    report.sessions_touched = touched.len();
    if !matches!(opts.scope, IngestScope::Sessions(_)) {
        store.set_meta(META_LAST_INGEST_AT, &report.started_at)?;
    }
    tracing::info!(
        files = report.files_scanned,
        scanned = report.scanned,
        new_raw = report.new_raw_entries,
        new_events = report.new_events,
        parse_failures = report.parse_failures,
        rederived = report.rederived,
        sessions = report.sessions_touched,
        "ingest complete"
    );
    Ok(report)
}

fn in_scope(file: &LogFile, scope: &IngestScope) -> bool {
    match scope {
        IngestScope::All => true,
        IngestScope::Since(ts) => from_unix(file.mtime_unix)
            // mtime has whole-second resolution
            .map(|m| m.as_str() >= floor_to_second(ts).as_str())
            .unwrap_or(true),
        IngestScope::Sessions(ids) => ids.iter().any(|id| *id == file.session_hint),
    }
}

fn floor_to_second(ts: &str) -> String {
    match ts.get(..19) {
        Some(prefix) => format!("{prefix}.000Z"),
        None => ts.to_string(),
    }
}

fn scan_file(
    store: &mut Store,
    file: &LogFile,
    opts: &IngestOptions,
    batch_size: usize,
    report: &mut IngestionReport,
    touched: &mut BTreeSet<String>,
) -> Result<(), IngestError> {
    let key = file.path.to_string_lossy().to_string();
    let move_cursor = !matches!(opts.scope, IngestScope::Sessions(_));

    let start = if opts.force || !move_cursor {
        0
    } else {
        match store.file_cursor(&key)? {
            Some(c) if c.size > file.size || c.offset > file.size => {
                tracing::info!(path = %key, "log file shrank, rescanning from start");
                0
            }
            Some(c) => c.offset,
            None => 0,
        }
    };
    if start >= file.size && start > 0 {
        return Ok(());
    }

    let ctx = LineContext {
        session_id: file.session_hint.clone(),
        project_path: file.project_path.clone(),
        fallback_ts: report.started_at.clone(),
    };
    let read_err = |source| IngestError::Read {
        path: file.path.clone(),
        source,
    };
    let mut reader = LineReader::open(&file.path, start)?;

    loop {
        let mut lines = Vec::with_capacity(batch_size);
        while lines.len() < batch_size {
            match reader.next_line().map_err(read_err)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => lines.push(line),
                None => break,
            }
        }
        let end = reader.offset();
        let exhausted = lines.len() < batch_size;
        if lines.is_empty() {
            let recorded = store.file_cursor(&key)?.map(|c| c.offset);
            if !move_cursor || recorded == Some(end) {
                break;
            }
        }

        let cursor = FileCursor {
            path: key.clone(),
            offset: end,
            size: file.size.max(end),
            mtime: file.mtime_unix,
        };
        let entries: Vec<RawEntry> = lines
            .iter()
            .map(|line| RawEntry::from_line(line, &ctx))
            .collect();

        let batch_touched = store.write_batch(|w| {
            let mut sessions = BTreeSet::new();
            for raw in &entries {
                report.scanned += 1;
                match w.store_entry(raw, false)? {
                    Stored::Duplicate => report.duplicates += 1,
                    Stored::Event => {
                        report.new_raw_entries += 1;
                        report.new_events += 1;
                        sessions.insert(raw.session_id.clone());
                    }
                    Stored::Failed(_) => {
                        report.new_raw_entries += 1;
                        report.parse_failures += 1;
                        sessions.insert(raw.session_id.clone());
                    }
                }
            }
            if move_cursor {
                w.set_file_cursor(&cursor)?;
            }
            let ids: Vec<String> = sessions.iter().cloned().collect();
            w.refresh_sessions(&ids)?;
            Ok::<_, IngestError>(sessions)
        })?;
        touched.extend(batch_touched);

        if exhausted {
            break;
        }
    }
    Ok(())
}

fn rederive(
    store: &mut Store,
    scope: &IngestScope,
    batch_size: usize,
    report: &mut IngestionReport,
    touched: &mut BTreeSet<String>,
) -> Result<(), IngestError> {
    let selector = match scope {
        IngestScope::All => RawSelector::All,
        IngestScope::Since(ts) => RawSelector::ObservedSince(ts.clone()),
        IngestScope::Sessions(ids) => RawSelector::Sessions(ids.clone()),
    };
    let mut after = 0;
    loop {
        let page = store.raw_entries_page(&selector, after, batch_size)?;
        let Some((last, _)) = page.last() else {
            break;
        };
        after = *last;

        let batch_touched = store.write_batch(|w| {
            let mut sessions = BTreeSet::new();
            for (_, raw) in &page {
                match w.rederive(raw)? {
                    Rederived::Event { resolved_failure } => {
                        report.rederived += 1;
                        if resolved_failure {
                            report.resolved_failures += 1;
                        }
                    }
                    Rederived::Failed(_) => {}
                }
                sessions.insert(raw.session_id.clone());
            }
            let ids: Vec<String> = sessions.iter().cloned().collect();
            w.refresh_sessions(&ids)?;
            Ok::<_, IngestError>(sessions)
        })?;
        touched.extend(batch_touched);

        if page.len() < batch_size {
            break;
        }
    }
    Ok(())
}
