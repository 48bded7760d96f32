//! HTTP surface
//!
//! A single WebSocket execution endpoint plus read-only metadata. CORS is
//! wide open: the service is meant to sit behind a reverse proxy and serve
//! browser clients from anywhere.

use crate::session::Session;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use crucible_core::fingerprint::IpSalt;
use crucible_core::protocol::{self, MAX_REQUEST_SIZE};
use crucible_core::{BackendConfig, languages};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Process-wide state; read-only once the server is up.
#[derive(Clone)]
pub struct AppState {
    pub languages: Arc<HashSet<String>>,
    pub salt: Arc<IpSalt>,
    pub backend: Arc<BackendConfig>,
    pub trust_proxy: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/ws/execute", get(execute_ws))
        .route("/api/v1/metadata", get(metadata))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

/// Known language identifiers as a msgpack array.
async fn metadata(State(state): State<AppState>) -> impl IntoResponse {
    match protocol::encode(&languages::sorted(&state.languages)) {
        Ok(bytes) => {
            ([(header::CONTENT_TYPE, "application/msgpack")], bytes).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metadata");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn execute_ws(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let address = client_address(&headers, peer, state.trust_proxy);
    let client_fingerprint = state.salt.fingerprint(&address);
    tracing::debug!(client = %client_fingerprint, "connection accepted");
    // slack above the request limit so an oversized request is still read
    // whole and can be rejected with its observed size
    ws.max_message_size(MAX_REQUEST_SIZE + 16 * 1024)
        .on_upgrade(move |socket| {
            Session::run(
                socket,
                client_fingerprint,
                state.languages.clone(),
                state.backend.clone(),
            )
        })
}

fn client_address(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            return ip.to_string();
        }
        tracing::warn!("trusting proxy headers but request carried no X-Real-IP");
    }
    peer.ip().to_string()
}
