//! Client side of the push protocol.
//!
//! 1. Read the local log tree once to learn which sessions exist.
//! 2. Ask the remote for each session's watermark.
//! 3. Read the tree again and select every entry newer than the lower of
//!    the remote's watermark and this client's own acknowledged one.
//! 4. Upload each project's selection oldest first, one project per batch,
//!    retrying a failed batch as is.
//! 5. Finalize once, only if something was sent.
//!
//! The first pass streams. Only the selection is held in memory.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sessa_core::ts::{now_ts, EPOCH};
use sessa_core::{LineContext, RawEntry};
use sessa_ingest::{discover, IngestError, LineReader, LogFile};
use sessa_store::{FileLock, FinalizeReport, StoreError};

use crate::error::SyncError;
use crate::protocol::{UploadRequest, UploadResponse};
use crate::push_state::PushState;
use crate::remote::SyncRemote;

pub const DEFAULT_PUSH_BATCH_SIZE: usize = 200;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct PushOptions {
    pub batch_size: usize,
    pub max_attempts: u32,
    /// Wait before retry `n` is `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_PUSH_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushReport {
    pub started_at: String,
    pub remote: String,
    pub sessions_local: usize,
    pub sessions_behind: usize,
    pub selected: usize,
    pub batches: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub parse_failures: usize,
    pub finalize: Option<FinalizeReport>,
}

/// Take the per-client push lock, failing fast if a push is running.
pub fn acquire_push_lock(path: &Path) -> Result<FileLock, SyncError> {
    FileLock::try_acquire(path).map_err(|e| match e {
        StoreError::Locked(p) => SyncError::PushInProgress(p.display().to_string()),
        other => SyncError::Store(other),
    })
}

#[derive(Debug, Clone)]
struct Selected {
    line: String,
    session_id: String,
    observed_at: String,
}

/// Entries at or below the returned mark are skipped. The remote's watermark
/// alone is not enough: another client can raise it past lines only this
/// client holds.
fn resume_mark<'a>(
    remote: &'a BTreeMap<String, String>,
    acked: &'a BTreeMap<String, String>,
    session: &str,
) -> &'a str {
    let theirs = remote.get(session).map(String::as_str).unwrap_or(EPOCH);
    let ours = acked.get(session).map(String::as_str).unwrap_or(EPOCH);
    theirs.min(ours)
}

/// Split a time-ordered selection into upload batches. Entries sharing a
/// session and timestamp always land in the same batch, so a batch may run
/// past `batch_size`.
fn cut_batches(entries: Vec<Selected>, batch_size: usize) -> Vec<Vec<Selected>> {
    let mut batches = Vec::new();
    let mut current: Vec<Selected> = Vec::new();
    for entry in entries {
        let tied = current.last().is_some_and(|last| {
            last.session_id == entry.session_id && last.observed_at == entry.observed_at
        });
        if current.len() >= batch_size && !tied {
            batches.push(std::mem::take(&mut current));
        }
        current.push(entry);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Tracks, per session, which selected timestamps are still undelivered.
///
/// A session is acknowledged only up to the newest delivered timestamp
/// that sits below every undelivered one. Timestamps at or after `cutoff`
/// were inferred from the run start and are never acknowledged.
struct AckLedger {
    cutoff: String,
    pending: BTreeMap<String, BTreeMap<String, usize>>,
    delivered: BTreeMap<String, BTreeSet<String>>,
}

impl AckLedger {
    fn new(cutoff: &str) -> Self {
        Self {
            cutoff: cutoff.to_string(),
            pending: BTreeMap::new(),
            delivered: BTreeMap::new(),
        }
    }

    fn expect(&mut self, session: &str, ts: &str) {
        if ts >= self.cutoff.as_str() {
            return;
        }
        *self
            .pending
            .entry(session.to_string())
            .or_default()
            .entry(ts.to_string())
            .or_default() += 1;
    }

    /// Mark a batch delivered and return the acks it makes safe.
    fn deliver(&mut self, batch: &[Selected]) -> BTreeMap<String, String> {
        let mut touched = BTreeSet::new();
        for entry in batch {
            if entry.observed_at >= self.cutoff {
                continue;
            }
            if let Some(waiting) = self.pending.get_mut(&entry.session_id) {
                if let Some(n) = waiting.get_mut(&entry.observed_at) {
                    *n -= 1;
                    if *n == 0 {
                        waiting.remove(&entry.observed_at);
                    }
                }
            }
            self.delivered
                .entry(entry.session_id.clone())
                .or_default()
                .insert(entry.observed_at.clone());
            touched.insert(entry.session_id.as_str());
        }

        let mut acks = BTreeMap::new();
        for session in touched {
            let Some(sent) = self.delivered.get(session) else {
                continue;
            };
            let oldest_waiting = self
                .pending
                .get(session)
                .and_then(|w| w.keys().next().cloned());
            let safe = match oldest_waiting {
                Some(limit) => sent.range(..limit).next_back(),
                None => sent.last(),
            };
            if let Some(ts) = safe {
                acks.insert(session.to_string(), ts.clone());
            }
        }
        acks
    }
}

pub async fn push<R: SyncRemote>(
    remote: &R,
    log_dir: &Path,
    state: &mut PushState,
    opts: &PushOptions,
) -> Result<PushReport, SyncError> {
    let batch_size = opts.batch_size.max(1);
    let mut report = PushReport {
        started_at: now_ts(),
        remote: remote.describe(),
        ..Default::default()
    };
    state.bind_remote(&report.remote);
    let files = discover(log_dir)?;

    let mut local = BTreeSet::new();
    for file in &files {
        let mut reader = EntryReader::open(file, &report.started_at)?;
        while let Some((_, raw)) = reader.next_entry()? {
            local.insert(raw.session_id);
        }
    }
    report.sessions_local = local.len();
    if local.is_empty() {
        state.finish(&report.started_at)?;
        return Ok(report);
    }

    let ids: Vec<String> = local.into_iter().collect();
    let watermarks = remote.sync_status(&ids).await?;
    tracing::debug!(sessions = ids.len(), "fetched remote watermarks");

    let mut behind = BTreeSet::new();
    let mut ledger = AckLedger::new(&report.started_at);
    let mut selection: BTreeMap<String, Vec<Selected>> = BTreeMap::new();
    for file in &files {
        let mut reader = EntryReader::open(file, &report.started_at)?;
        while let Some((line, raw)) = reader.next_entry()? {
            let mark = resume_mark(&watermarks, &state.sessions, &raw.session_id);
            if raw.observed_at.as_str() <= mark {
                continue;
            }
            report.selected += 1;
            behind.insert(raw.session_id.clone());
            ledger.expect(&raw.session_id, &raw.observed_at);
            selection
                .entry(file.project_path.clone())
                .or_default()
                .push(Selected {
                    line,
                    session_id: raw.session_id,
                    observed_at: raw.observed_at,
                });
        }
    }
    report.sessions_behind = behind.len();

    for (project_path, mut entries) in selection {
        // the remote raises a watermark to the newest entry it commits
        entries.sort_by(|a, b| {
            (&a.observed_at, &a.session_id).cmp(&(&b.observed_at, &b.session_id))
        });
        for batch in cut_batches(entries, batch_size) {
            send(remote, &project_path, batch, &mut ledger, state, opts, &mut report).await?;
        }
    }

    if report.batches > 0 {
        report.finalize = Some(remote.finalize().await?);
    }
    state.finish(&report.started_at)?;
    tracing::info!(
        remote = %report.remote,
        sessions = report.sessions_behind,
        batches = report.batches,
        accepted = report.accepted,
        duplicates = report.duplicates,
        "push complete"
    );
    Ok(report)
}

async fn send<R: SyncRemote>(
    remote: &R,
    project_path: &str,
    batch: Vec<Selected>,
    ledger: &mut AckLedger,
    state: &mut PushState,
    opts: &PushOptions,
    report: &mut PushReport,
) -> Result<(), SyncError> {
    let entries = batch.len();
    let lines = batch.iter().map(|e| e.line.clone()).collect();
    let req = UploadRequest::from_lines(project_path.to_string(), lines);
    let resp = upload_with_retry(remote, &req, opts).await?;
    tracing::info!(
        project = %req.project_path,
        entries,
        accepted = resp.accepted,
        duplicates = resp.duplicates,
        "batch uploaded"
    );
    report.batches += 1;
    report.accepted += resp.accepted;
    report.duplicates += resp.duplicates;
    report.parse_failures += resp.parse_failures;
    let acks = ledger.deliver(&batch);
    state.record_acks(&acks)
}

async fn upload_with_retry<R: SyncRemote>(
    remote: &R,
    req: &UploadRequest,
    opts: &PushOptions,
) -> Result<UploadResponse, SyncError> {
    let max_attempts = opts.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match remote.upload(req).await {
            Ok(resp) => return Ok(resp),
            Err(e) if attempt < max_attempts && e.is_retryable() => {
                tracing::warn!(
                    project = %req.project_path,
                    attempt,
                    max_attempts,
                    error = %e,
                    "batch upload failed, retrying"
                );
                tokio::time::sleep(opts.retry_backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(SyncError::BatchFailed {
                    project_path: req.project_path.clone(),
                    entries: req.entries.len(),
                    attempts: attempt,
                    source: Box::new(e),
                })
            }
        }
    }
}

/// Non-blank lines of one log file, each with its derived identity.
struct EntryReader<'a> {
    file: &'a LogFile,
    reader: LineReader,
    ctx: LineContext,
}

impl<'a> EntryReader<'a> {
    fn open(file: &'a LogFile, fallback_ts: &str) -> Result<Self, SyncError> {
        Ok(Self {
            file,
            reader: LineReader::open(&file.path, 0)?,
            ctx: LineContext {
                session_id: file.session_hint.clone(),
                project_path: file.project_path.clone(),
                fallback_ts: fallback_ts.to_string(),
            },
        })
    }

    fn next_entry(&mut self) -> Result<Option<(String, RawEntry)>, SyncError> {
        loop {
            let line = self.reader.next_line().map_err(|source| {
                SyncError::LogSource(IngestError::Read {
                    path: self.file.path.clone(),
                    source,
                })
            })?;
            match line {
                None => return Ok(None),
                Some(l) if l.trim().is_empty() => continue,
                Some(l) => {
                    let raw = RawEntry::from_line(&l, &self.ctx);
                    return Ok(Some((l, raw)));
                }
            }
        }
    }
}
