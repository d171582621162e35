//! Server side of the push protocol, as plain functions over a [`Store`].
//!
//! Each upload is one store transaction: a batch is either entirely
//! visible or not at all, and earlier batches are never affected by a
//! later failure. Re-sending a batch is harmless because insertion is
//! keyed on the entry uuid.

use sessa_core::ts::now_ts;
use sessa_core::{LineContext, RawEntry};
use sessa_store::{FinalizeReport, Store, StoreError, Stored};

use crate::protocol::{entry_text, SyncStatusRequest, SyncStatusResponse, UploadRequest, UploadResponse};

/// Session id for uploaded lines that name none.
pub const UNKNOWN_SESSION: &str = "unknown";

pub fn get_sync_status(
    store: &Store,
    req: &SyncStatusRequest,
) -> Result<SyncStatusResponse, StoreError> {
    let sessions = store.sync_status(req.session_ids.as_deref())?;
    Ok(SyncStatusResponse { sessions })
}

pub fn upload_entries(store: &mut Store, req: &UploadRequest) -> Result<UploadResponse, StoreError> {
    let ctx = LineContext {
        session_id: UNKNOWN_SESSION.to_string(),
        project_path: req.project_path.clone(),
        fallback_ts: now_ts(),
    };
    let entries: Vec<RawEntry> = req
        .entries
        .iter()
        .map(|e| RawEntry::from_line(&entry_text(e), &ctx))
        .collect();

    let resp = store.write_batch(|w| {
        let mut resp = UploadResponse::default();
        for raw in &entries {
            match w.store_entry(raw, true)? {
                Stored::Duplicate => resp.duplicates += 1,
                Stored::Event => resp.accepted += 1,
                Stored::Failed(_) => {
                    resp.accepted += 1;
                    resp.parse_failures += 1;
                }
            }
        }
        Ok::<_, StoreError>(resp)
    })?;
    tracing::info!(
        project = %req.project_path,
        accepted = resp.accepted,
        duplicates = resp.duplicates,
        parse_failures = resp.parse_failures,
        "upload batch committed"
    );
    Ok(resp)
}

/// Refresh rollups of every session touched since the last finalize and
/// rebuild the pattern cache.
pub fn finalize_sync(store: &mut Store) -> Result<FinalizeReport, StoreError> {
    let report = store.finalize()?;
    tracing::info!(
        sessions = report.sessions_refreshed,
        patterns = report.patterns,
        "sync finalized"
    );
    Ok(report)
}
