//! HTTP front for the session-auth multiplexer.
//!
//! The backend is pointed at this server instead of Mojang's session
//! service; `hasJoined` queries are fanned out to every configured
//! upstream. Some server software hits slightly different paths, so any
//! request whose path contains `hasJoined` is dispatched as well.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{RawQuery, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;

mod fanout;

use fanout::{AuthOutcome, SessionMux, HAS_JOINED_PATH};

/// A client may not take longer than this to send its request head.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Bounds the handler and response side; comfortably above the fan-out
/// deadline.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bind the auth listener and serve forever. Bind failure is fatal to
/// startup.
pub async fn serve(cfg: Arc<Config>) -> Result<()> {
    let mux = Arc::new(SessionMux::new(cfg.session_servers.clone())?);
    let listener = TcpListener::bind(&cfg.auth_listen)
        .await
        .with_context(|| format!("binding multiauth listener on {}", cfg.auth_listen))?;
    info!(auth_listen = %listener.local_addr()?, "multiauth server listening");

    serve_connections(listener, router(AuthState { mux })).await
}

/// Drives connections through hyper directly so the request head gets
/// its own read timeout; slow-header clients are cut off long before the
/// response-side bound in the router applies.
async fn serve_connections(listener: TcpListener, app: Router) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(HEADER_READ_TIMEOUT)
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(client = %peer, error = %e, "http connection ended");
            }
        });
    }
}

#[derive(Clone)]
struct AuthState {
    mux: Arc<SessionMux>,
}

fn router(state: AuthState) -> Router {
    Router::new()
        .route(HAS_JOINED_PATH, get(has_joined))
        .route("/health", get(health))
        .fallback(fallback)
        .method_not_allowed_fallback(fallback)
        .layer(TimeoutLayer::new(RESPONSE_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn has_joined(State(state): State<AuthState>, RawQuery(query): RawQuery) -> Response {
    dispatch(&state, query).await
}

async fn health() -> &'static str {
    "ok"
}

async fn fallback(
    State(state): State<AuthState>,
    uri: Uri,
    RawQuery(query): RawQuery,
) -> Response {
    if uri.path().contains("hasJoined") {
        return dispatch(&state, query).await;
    }
    (StatusCode::NOT_FOUND, "mc-edge multiauth front").into_response()
}

async fn dispatch(state: &AuthState, query: Option<String>) -> Response {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing query parameters").into_response();
    };

    let username = username_from_query(&query);
    match state.mux.fan_out(&query, &username).await {
        AuthOutcome::Match { body } => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        AuthOutcome::NoMatch => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Pulls the username parameter out of the raw query for log lines.
fn username_from_query(query: &str) -> String {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("username="))
        .unwrap_or("")
        .to_string()
}
