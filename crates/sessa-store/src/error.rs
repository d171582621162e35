use std::path::PathBuf;

/// Failures of the durable store. All of them are fatal to the current
/// operation; transaction scoping guarantees nothing partial is visible.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),

    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: u32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store schema is at version {found}, this build supports up to {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("migration list is not strictly increasing at version {0}")]
    MigrationOrder(u32),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("locked by another process ({})", .0.display())]
    Locked(PathBuf),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
