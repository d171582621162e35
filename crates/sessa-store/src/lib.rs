pub mod config;
pub mod error;
pub mod filter;
pub mod lock;
pub mod migrate;
pub mod paths;
pub mod patterns;
pub mod sqlite_store;

pub use config::{ConfigError, SessaConfig};
pub use error::StoreError;
pub use filter::{Constraint, EventFilter};
pub use lock::FileLock;
pub use paths::{default_data_dir, default_log_dir, ingest_lock_path, write_atomic, SessaPaths};
pub use sqlite_store::{
    BatchWriter, FileCursor, FinalizeReport, RawSelector, Rederived, Store, StoreStats, Stored,
    StoredParseFailure,
};
