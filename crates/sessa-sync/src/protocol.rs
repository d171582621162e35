//! Wire types for the three sync operations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SYNC_STATUS_PATH: &str = "/rpc/sync_status";
pub const UPLOAD_ENTRIES_PATH: &str = "/rpc/upload_entries";
pub const FINALIZE_SYNC_PATH: &str = "/rpc/finalize_sync";
pub const HEALTH_PATH: &str = "/api/health";
pub const STATUS_PATH: &str = "/api/status";

/// Injected by the fronting reverse proxy for authenticated callers.
pub const IDENTITY_HEADER: &str = "Tailscale-User-Login";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusRequest {
    /// `None` asks for every session the server knows.
    #[serde(default)]
    pub session_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusResponse {
    pub sessions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub project_path: String,
    /// Raw log lines. A JSON object is accepted too and re-serialized.
    pub entries: Vec<Value>,
}

impl UploadRequest {
    pub fn from_lines(project_path: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            project_path: project_path.into(),
            entries: lines.into_iter().map(Value::String).collect(),
        }
    }
}

/// Text of one uploaded entry as it would appear in a log file.
pub fn entry_text(entry: &Value) -> String {
    match entry {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub accepted: usize,
    pub duplicates: usize,
    pub parse_failures: usize,
}

pub use sessa_store::FinalizeReport as FinalizeResponse;
