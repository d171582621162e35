use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use sessa_store::{migrate, FinalizeReport, Store, StoreError, StoreStats};
use sessa_sync::protocol::{
    SyncStatusRequest, SyncStatusResponse, UploadRequest, UploadResponse, FINALIZE_SYNC_PATH,
    HEALTH_PATH, IDENTITY_HEADER, STATUS_PATH, SYNC_STATUS_PATH, UPLOAD_ENTRIES_PATH,
};
use sessa_sync::{finalize_sync, get_sync_status, upload_entries};

/// Uploads carry whole tool outputs; the axum default of 2 MiB is too small.
const UPLOAD_BODY_LIMIT: usize = 64 * 1024 * 1024;

// ── Config ──

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub db_path: PathBuf,
    pub bind: String,
    pub port: u16,
    /// Skip the identity-header check (direct access without the proxy).
    pub auth_disabled: bool,
}

// ── App State ──

struct AppState {
    db_path: PathBuf,
    auth_disabled: bool,
}

impl AppState {
    /// Run store work on the blocking pool with a fresh handle, so no
    /// connection outlives the request it serves.
    async fn with_store<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Store) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<T> {
            let mut store = Store::open(&db_path)?;
            Ok(f(&mut store)?)
        })
        .await?
    }
}

// ── Error Handling ──

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %format!("{:#}", self.0), "request failed");
        let body = serde_json::json!({ "error": self.0.to_string() });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

// ── Entrypoint ──

pub async fn serve(config: ServeConfig) -> anyhow::Result<()> {
    // Migrate up front so a bad store fails the start, not the first push.
    let store = Store::open(&config.db_path)
        .with_context(|| format!("cannot open store at {}", config.db_path.display()))?;
    let version = store.schema_version()?;
    drop(store);

    let app = router(&config.db_path, config.auth_disabled);
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    tracing::info!(
        %addr,
        db = %config.db_path.display(),
        schema_version = version,
        auth = !config.auth_disabled,
        "sessa sync server listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router (for testing without binding to a port).
pub fn router(db_path: &Path, auth_disabled: bool) -> Router {
    let state = Arc::new(AppState {
        db_path: db_path.to_path_buf(),
        auth_disabled,
    });
    let gated = Router::new()
        .route(STATUS_PATH, get(get_status))
        .route(SYNC_STATUS_PATH, post(post_sync_status))
        .route(
            UPLOAD_ENTRIES_PATH,
            post(post_upload_entries).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route(FINALIZE_SYNC_PATH, post(post_finalize_sync))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_identity));
    Router::new()
        .route(HEALTH_PATH, get(health))
        .merge(gated)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Identity ──

async fn require_identity(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.auth_disabled {
        return next.run(req).await;
    }
    let user = req
        .headers()
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match user {
        Some(user) => {
            tracing::debug!(%user, path = %req.uri().path(), "authenticated request");
            next.run(req).await
        }
        None => {
            tracing::warn!(path = %req.uri().path(), "rejected request without identity header");
            let body = serde_json::json!({
                "error": format!("missing {IDENTITY_HEADER} header")
            });
            (StatusCode::UNAUTHORIZED, Json(body)).into_response()
        }
    }
}

// ── Health ──

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

// ── GET /api/status ──

#[derive(Serialize)]
struct StatusResponse {
    latest_schema_version: u32,
    dirty_sessions: usize,
    #[serde(flatten)]
    stats: StoreStats,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, AppError> {
    let resp = state
        .with_store(|store| {
            Ok(StatusResponse {
                latest_schema_version: migrate::latest_version(),
                dirty_sessions: store.dirty_sessions()?.len(),
                stats: store.stats()?,
            })
        })
        .await?;
    Ok(Json(resp))
}

// ── POST /rpc/sync_status ──

async fn post_sync_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncStatusRequest>,
) -> Result<Json<SyncStatusResponse>, AppError> {
    let resp = state
        .with_store(move |store| get_sync_status(store, &req))
        .await?;
    Ok(Json(resp))
}

// ── POST /rpc/upload_entries ──

async fn post_upload_entries(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, AppError> {
    let resp = state
        .with_store(move |store| upload_entries(store, &req))
        .await?;
    Ok(Json(resp))
}

// ── POST /rpc/finalize_sync ──

async fn post_finalize_sync(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FinalizeReport>, AppError> {
    let report = state.with_store(finalize_sync).await?;
    Ok(Json(report))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn line(uuid: &str, ts: &str) -> String {
        serde_json::json!({"uuid": uuid, "sessionId": "s1", "timestamp": ts,
                           "type": "user", "message": {"content": "hi"}})
        .to_string()
    }

    fn post_json(uri: &str, body: serde_json::Value, user: Option<&str>) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            req = req.header(IDENTITY_HEADER, user);
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_is_exempt_from_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(&tmp.path().join("sessa.db"), false);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(HEALTH_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["ok"], true);
    }

    #[tokio::test]
    async fn missing_identity_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(&tmp.path().join("sessa.db"), false);

        let resp = app
            .oneshot(post_json(SYNC_STATUS_PATH, serde_json::json!({}), None))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let json = json_body(resp).await;
        assert!(json["error"].as_str().unwrap().contains(IDENTITY_HEADER));
    }

    #[tokio::test]
    async fn auth_disabled_lets_requests_through() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(&tmp.path().join("sessa.db"), true);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(STATUS_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        assert_eq!(json["schema_version"], json["latest_schema_version"]);
        assert_eq!(json["raw_entries"], 0);
    }

    #[tokio::test]
    async fn upload_status_finalize_round() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(&tmp.path().join("sessa.db"), false);
        let user = Some("me@example.com");
        let upload = serde_json::json!({
            "project_path": "-work-proj",
            "entries": [line("a", "2025-03-01T10:00:00Z"), line("b", "2025-03-01T10:05:00Z")],
        });

        let resp = app
            .clone()
            .oneshot(post_json(UPLOAD_ENTRIES_PATH, upload.clone(), user))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        assert_eq!(json["accepted"], 2);
        assert_eq!(json["duplicates"], 0);

        let resp = app
            .clone()
            .oneshot(post_json(UPLOAD_ENTRIES_PATH, upload, user))
            .await
            .unwrap();
        let json = json_body(resp).await;
        assert_eq!(json["accepted"], 0);
        assert_eq!(json["duplicates"], 2);

        let resp = app
            .clone()
            .oneshot(post_json(
                SYNC_STATUS_PATH,
                serde_json::json!({"session_ids": ["s1", "s9"]}),
                user,
            ))
            .await
            .unwrap();
        let json = json_body(resp).await;
        assert_eq!(json["sessions"]["s1"], "2025-03-01T10:05:00.000Z");
        assert_eq!(json["sessions"]["s9"], "1970-01-01T00:00:00.000Z");

        let resp = app
            .oneshot(post_json(FINALIZE_SYNC_PATH, serde_json::json!({}), user))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["sessions_refreshed"], 1);

        let store = Store::open(&tmp.path().join("sessa.db")).unwrap();
        assert_eq!(store.session("s1").unwrap().unwrap().entry_count, 2);
    }

    #[tokio::test]
    async fn malformed_body_is_a_client_error() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(&tmp.path().join("sessa.db"), true);

        let resp = app
            .oneshot(post_json(
                UPLOAD_ENTRIES_PATH,
                serde_json::json!({"entries": "nope"}),
                None,
            ))
            .await
            .unwrap();

        assert!(resp.status().is_client_error());
    }
}
