//! Incremental push sync between a client's logs and a canonical store.
//!
//! Correctness rests on uuid deduplication at the target; per-session
//! watermarks only keep already acknowledged data from being re-sent.

pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod push;
pub mod push_state;
pub mod remote;

pub use coordinator::{finalize_sync, get_sync_status, upload_entries};
pub use error::SyncError;
pub use push::{acquire_push_lock, push, PushOptions, PushReport, DEFAULT_PUSH_BATCH_SIZE};
pub use push_state::PushState;
pub use remote::{HttpRemote, LocalRemote, SyncRemote};
