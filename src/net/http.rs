//! HTTP collaborator surface: the `/api` bridge into the worker queue,
//! `/ping`, and the static web UI files.
//!
//! `/api` accepts the envelope as a `json` field, either in the query
//! string (GET) or an urlencoded form body (POST). The handler enqueues
//! the payload with a reply channel and waits up to two seconds for the
//! worker; enqueue and reply timeouts both surface as 500.

use crate::net::sender::Sender;
use crate::node::IngressMsg;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Form;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Component, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub const CONTENT_TYPE_JSON: &str = "text/x-json; charset=utf-8";

const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct HttpState {
    pub ingress: mpsc::Sender<IngressMsg>,
    pub web_root: PathBuf,
}

#[derive(Deserialize)]
pub struct ApiParams {
    json: String,
}

pub fn app(state: HttpState) -> axum::Router {
    axum::Router::new()
        .route("/api", get(api_get).post(api_post))
        .route("/ping", get(ping))
        .fallback(static_file)
        .with_state(state)
}

/// Serve until the shutdown flag flips.
pub async fn serve(
    port: u16,
    state: HttpState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http listening");
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await
}

async fn ping() -> &'static str {
    "pong"
}

async fn api_get(
    State(state): State<HttpState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ApiParams>,
) -> Response {
    handle_api(state, addr, params.json).await
}

async fn api_post(
    State(state): State<HttpState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Form(params): Form<ApiParams>,
) -> Response {
    handle_api(state, addr, params.json).await
}

async fn handle_api(state: HttpState, addr: SocketAddr, json: String) -> Response {
    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    let sender = Sender::http(reply_tx, addr);

    if let Err(e) = state
        .ingress
        .send_timeout((Some(json), Some(sender)), ENQUEUE_TIMEOUT)
        .await
    {
        warn!("api enqueue failed: {e}");
        return (StatusCode::INTERNAL_SERVER_ERROR, "engine unavailable").into_response();
    }

    match tokio::time::timeout(REPLY_TIMEOUT, reply_rx.recv()).await {
        Ok(Some(Ok(body))) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE_JSON)],
            body,
        )
            .into_response(),
        Ok(Some(Err(text))) => (StatusCode::INTERNAL_SERVER_ERROR, text).into_response(),
        Ok(None) | Err(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "engine timeout").into_response()
        }
    }
}

/// The web UI: `/` is the main page, everything else resolves under the
/// web root. Only plain path components are accepted.
async fn static_file(State(state): State<HttpState>, uri: Uri) -> Response {
    let path = match uri.path() {
        "/" => "litter.html",
        p => p.trim_start_matches('/'),
    };

    let rel = PathBuf::from(path);
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    }

    let content_type = match rel.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        _ => return (StatusCode::NOT_FOUND, "Not found").into_response(),
    };

    match tokio::fs::read(state.web_root.join(rel)).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type)],
            bytes,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}
