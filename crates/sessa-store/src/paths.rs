use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

/// Per-user data directory: platform data dir + `sessa`
/// (falls back to `~/.sessa`, then `./.sessa`).
pub fn default_data_dir() -> PathBuf {
    if let Some(data_dir) = dirs::data_dir() {
        data_dir.join("sessa")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".sessa")
    } else {
        PathBuf::from(".sessa")
    }
}

/// Where the agent runtime writes its session logs.
pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

/// Well-known files under the data directory.
#[derive(Debug, Clone)]
pub struct SessaPaths {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_json: PathBuf,
    pub push_state_json: PathBuf,
    pub push_lock: PathBuf,
}

impl SessaPaths {
    /// Pure computation, no I/O.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            db_path: data_dir.join("sessa.db"),
            config_json: data_dir.join("config.json"),
            push_state_json: data_dir.join("push_state.json"),
            push_lock: data_dir.join("push.lock"),
            data_dir,
        }
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir).map_err(|e| StoreError::io(&self.data_dir, e))
    }
}

/// Lock file serializing ingestion runs against one store file.
pub fn ingest_lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "sessa.db".into());
    name.push(".ingest.lock");
    db_path.with_file_name(name)
}

/// Atomic write: write to temp file in same dir, then rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StoreError::io(parent, e))?;
    tmp.write_all(data).map_err(|e| StoreError::io(path, e))?;
    tmp.flush().map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}
