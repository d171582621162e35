use std::path::PathBuf;

use sessa_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("log source unavailable at {path}: {source}")]
    LogSourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
