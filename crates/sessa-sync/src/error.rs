use std::path::PathBuf;

use sessa_ingest::IngestError;
use sessa_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote rejected request with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("batch of {entries} entries for {project_path} failed after {attempts} attempts: {source}")]
    BatchFailed {
        project_path: String,
        entries: usize,
        attempts: u32,
        #[source]
        source: Box<SyncError>,
    },

    #[error("another push is already running ({0})")]
    PushInProgress(String),

    #[error("no sync remote configured (set SESSA_REMOTE_URL or pass --remote)")]
    NoRemote,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    LogSource(#[from] IngestError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SyncError {
    /// Whether re-sending the same request may succeed. Upload is
    /// idempotent per uuid, so this only rules out requests the server
    /// will keep refusing.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) => true,
            SyncError::Rejected { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
