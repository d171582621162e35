//! Client-side push bookkeeping (`push_state.json`).
//!
//! Informational only: the server's watermark decides what is sent. A
//! session's entry here moves only after the server acknowledged a batch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sessa_store::write_atomic;

use crate::error::SyncError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushState {
    pub remote: Option<String>,
    pub last_push_at: Option<String>,
    /// Newest acknowledged `observed_at` per session.
    #[serde(default)]
    pub sessions: BTreeMap<String, String>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl PushState {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let mut state = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<PushState>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PushState::default(),
            Err(source) => {
                return Err(SyncError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        state.path = Some(path.to_path_buf());
        Ok(state)
    }

    /// State that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Point the state at `remote`; acknowledgements from another remote
    /// say nothing about this one and are dropped.
    pub fn bind_remote(&mut self, remote: &str) {
        if self.remote.as_deref() != Some(remote) {
            self.sessions.clear();
            self.last_push_at = None;
            self.remote = Some(remote.to_string());
        }
    }

    pub fn record_acks(&mut self, acks: &BTreeMap<String, String>) -> Result<(), SyncError> {
        for (session, ts) in acks {
            let slot = self.sessions.entry(session.clone()).or_default();
            if ts.as_str() > slot.as_str() {
                *slot = ts.clone();
            }
        }
        self.save()
    }

    pub fn finish(&mut self, at: &str) -> Result<(), SyncError> {
        self.last_push_at = Some(at.to_string());
        self.save()
    }

    fn save(&self) -> Result<(), SyncError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data)?;
        Ok(())
    }
}
