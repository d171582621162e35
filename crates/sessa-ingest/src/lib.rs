pub mod discover;
pub mod error;
pub mod freshness;
pub mod pipeline;

pub use discover::{discover, LineReader, LogFile};
pub use error::IngestError;
pub use freshness::{Freshness, FreshnessError, FreshnessGate, Served, DEFAULT_MAX_AGE_SECS};
pub use pipeline::{ingest, IngestOptions, IngestScope, IngestionReport, DEFAULT_BATCH_SIZE};
