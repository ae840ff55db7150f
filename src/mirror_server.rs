//! Self-hosted remote mirror: a small JSON bin service.
//!
//! SYSTEM CONTEXT
//! ==============
//! Speaks the same protocol [`HttpMirror`](crate::remote::HttpMirror)
//! consumes, so a deployment can run its own mirror instead of a hosted bin:
//!
//! - `GET /b/{bin}/latest` returns `{"record": <body>, "metadata": {"id": bin}}`
//!   or `404` when nothing has been stored yet.
//! - `PUT /b/{bin}` stores the JSON body and echoes it in the same envelope.
//! - `GET /healthz` is unauthenticated.
//!
//! Bin routes require the `X-Master-Key` header to equal the configured key.
//!
//! TRADE-OFFS
//! ==========
//! Every PUT rewrites the whole persistence file while holding the write
//! lock. Bins are tiny and writes rare, so this keeps the file and memory in
//! the same order without a separate writer task. A failed file write is
//! reported as `500` but the in-memory value is kept.

use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::remote::ACCESS_KEY_HEADER;

#[derive(Debug, thiserror::Error)]
pub enum MirrorServerError {
    #[error("mirror file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mirror file {path} is not a JSON object: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Shared server state: access key, bins, optional persistence file.
#[derive(Clone)]
pub struct MirrorState {
    api_key: Arc<str>,
    bins: Arc<RwLock<HashMap<String, Value>>>,
    file: Option<Arc<PathBuf>>,
}

impl MirrorState {
    /// In-memory state with no persistence.
    #[must_use]
    pub fn in_memory(api_key: impl Into<Arc<str>>) -> Self {
        Self { api_key: api_key.into(), bins: Arc::new(RwLock::new(HashMap::new())), file: None }
    }

    /// State persisted to `file`, reloading whatever it already holds.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorServerError`] when an existing file cannot be read or
    /// parsed. A missing file starts empty.
    pub async fn persistent(api_key: impl Into<Arc<str>>, file: PathBuf) -> Result<Self, MirrorServerError> {
        let bins = match tokio::fs::read_to_string(&file).await {
            Ok(text) => serde_json::from_str::<HashMap<String, Value>>(&text)
                .map_err(|source| MirrorServerError::Parse { path: file.clone(), source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(MirrorServerError::Io { path: file, source }),
        };
        info!(path = %file.display(), bins = bins.len(), "mirror state loaded");
        Ok(Self { api_key: api_key.into(), bins: Arc::new(RwLock::new(bins)), file: Some(Arc::new(file)) })
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(ACCESS_KEY_HEADER)
            .is_some_and(|value| value == self.api_key.as_ref())
    }
}

async fn persist(path: &FsPath, bins: &HashMap<String, Value>) -> Result<(), MirrorServerError> {
    let io = |source| MirrorServerError::Io { path: path.to_path_buf(), source };
    let encoded = serde_json::to_vec_pretty(bins)
        .map_err(|source| MirrorServerError::Parse { path: path.to_path_buf(), source })?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, encoded).await.map_err(io)?;
    tokio::fs::rename(&tmp, path).await.map_err(io)
}

fn envelope(bin: &str, record: Value) -> Json<Value> {
    Json(json!({ "record": record, "metadata": { "id": bin } }))
}

// =============================================================================
// HANDLERS
// =============================================================================

/// `GET /b/{bin}/latest`
async fn latest(
    State(state): State<MirrorState>,
    Path(bin): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    if !state.authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let record = state.bins.read().await.get(&bin).cloned().ok_or(StatusCode::NOT_FOUND)?;
    Ok(envelope(&bin, record))
}

/// `PUT /b/{bin}`
async fn put(
    State(state): State<MirrorState>,
    Path(bin): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    if !state.authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let mut bins = state.bins.write().await;
    bins.insert(bin.clone(), body.clone());
    if let Some(path) = &state.file {
        if let Err(e) = persist(path, &bins).await {
            error!(error = %e, %bin, "mirror persist failed");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }
    drop(bins);

    info!(%bin, "bin updated");
    Ok(envelope(&bin, body))
}

async fn healthz() -> &'static str {
    "ok"
}

// =============================================================================
// ROUTER
// =============================================================================

pub fn router(state: MirrorState) -> Router {
    Router::new()
        .route("/b/{bin}", axum::routing::put(put))
        .route("/b/{bin}/latest", get(latest))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the mirror on an already-bound listener until the task is dropped.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve(listener: TcpListener, state: MirrorState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "mirror listening");
    }
    axum::serve(listener, router(state)).await
}

#[cfg(test)]
#[path = "mirror_server_test.rs"]
mod tests;
