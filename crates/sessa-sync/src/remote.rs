//! Where a push goes: a sync server over HTTP, or another store file.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sessa_store::{FinalizeReport, Store, StoreError};

use crate::coordinator;
use crate::error::SyncError;
use crate::protocol::{
    SyncStatusRequest, SyncStatusResponse, UploadRequest, UploadResponse, FINALIZE_SYNC_PATH,
    SYNC_STATUS_PATH, UPLOAD_ENTRIES_PATH,
};

/// The three sync operations as seen by a pushing client.
#[allow(async_fn_in_trait)]
pub trait SyncRemote {
    /// Stable name of the target, used to tell push bookkeeping apart.
    fn describe(&self) -> String;

    /// Watermark per requested session; unknown sessions map to the epoch.
    async fn sync_status(&self, session_ids: &[String]) -> Result<BTreeMap<String, String>, SyncError>;

    async fn upload(&self, req: &UploadRequest) -> Result<UploadResponse, SyncError>;

    async fn finalize(&self) -> Result<FinalizeReport, SyncError>;
}

pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, SyncError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

impl SyncRemote for HttpRemote {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn sync_status(&self, session_ids: &[String]) -> Result<BTreeMap<String, String>, SyncError> {
        let req = SyncStatusRequest {
            session_ids: Some(session_ids.to_vec()),
        };
        let resp: SyncStatusResponse = self.call(SYNC_STATUS_PATH, &req).await?;
        Ok(resp.sessions)
    }

    async fn upload(&self, req: &UploadRequest) -> Result<UploadResponse, SyncError> {
        self.call(UPLOAD_ENTRIES_PATH, req).await
    }

    async fn finalize(&self) -> Result<FinalizeReport, SyncError> {
        self.call(FINALIZE_SYNC_PATH, &serde_json::json!({})).await
    }
}

/// Pushes straight into another store file, opened afresh per call so the
/// write lock is held for one batch only.
pub struct LocalRemote {
    db_path: PathBuf,
}

impl LocalRemote {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

impl LocalRemote {
    /// Run `f` against a freshly opened store on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Store) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, SyncError> {
            let mut store = Store::open(&db_path)?;
            Ok(f(&mut store)?)
        })
        .await?
    }
}

impl SyncRemote for LocalRemote {
    fn describe(&self) -> String {
        format!("file://{}", self.db_path.display())
    }

    async fn sync_status(&self, session_ids: &[String]) -> Result<BTreeMap<String, String>, SyncError> {
        let req = SyncStatusRequest {
            session_ids: Some(session_ids.to_vec()),
        };
        self.with_store(move |store| Ok(coordinator::get_sync_status(store, &req)?.sessions))
            .await
    }

    async fn upload(&self, req: &UploadRequest) -> Result<UploadResponse, SyncError> {
        let req = req.clone();
        self.with_store(move |store| coordinator::upload_entries(store, &req))
            .await
    }

    async fn finalize(&self) -> Result<FinalizeReport, SyncError> {
        self.with_store(coordinator::finalize_sync).await
    }
}
