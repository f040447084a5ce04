//! Axum HTTP server: router, handlers, listener, graceful shutdown.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LAST_MODIFIED, RANGE};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::cache::MetadataCache;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::proxy::headers::{RelayHeaders, AUDIO_CONTENT_TYPE};
use crate::proxy::relay;
use crate::proxy::upstream::UpstreamClient;
use crate::service::AudioService;
use crate::validation::validate_request;

const SERVICE_NAME: &str = "audio-relay";

/// Response header carrying the per-request ID that also tags its log span.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Shared application state, owned by [`AudioService`].
pub struct AppState {
    pub config: ProxyConfig,
    pub upstream: UpstreamClient,
    pub cache: MetadataCache,
    pub cache_control: HeaderValue,
}

/// Build the router with all routes and layers.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route(
            "/audio/{conversation_id}",
            get(handle_stream).head(handle_head),
        )
        .route("/audio/{conversation_id}/info", get(handle_info))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind the listener and serve until SIGINT/SIGTERM.
pub async fn run(service: &AudioService) -> anyhow::Result<()> {
    let listen_addr = service.state().config.listen_address();
    let app = service.router();

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "audio-relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("audio-relay shut down gracefully");
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() || origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        }))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([CONTENT_LENGTH, CONTENT_RANGE, ACCEPT_RANGES])
}

/// GET /audio/{id}: stream the audio, forwarding any Range header.
async fn handle_stream(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let request_id = new_request_id();
    let span = relay_tracing::audio_request_span!(&request_id, &conversation_id, "stream");
    let started = Instant::now();

    async {
        // Forwarded as raw bytes; the upstream decides what the range means.
        let range = headers.get(RANGE);
        tracing::info!(range = ?range, "Audio request");

        let result = stream_audio(&state, &conversation_id, range, started).await;
        finish_request(result, &request_id, started)
    }
    .instrument(span)
    .await
}

async fn stream_audio(
    state: &AppState,
    conversation_id: &str,
    range: Option<&HeaderValue>,
    started: Instant,
) -> Result<Response, ProxyError> {
    let id = validate_request(&state.config, conversation_id)?;
    let upstream = state.upstream.fetch(id, range).await?;
    relay::relay(upstream, id, &state.cache_control, started)?.into_response()
}

/// HEAD /audio/{id}: relay headers only, served from the metadata cache when fresh.
async fn handle_head(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Response {
    let request_id = new_request_id();
    let span = relay_tracing::audio_request_span!(&request_id, &conversation_id, "head");
    let started = Instant::now();

    async {
        let result = head_audio(&state, &conversation_id).await;
        finish_request(result, &request_id, started)
    }
    .instrument(span)
    .await
}

async fn head_audio(state: &AppState, conversation_id: &str) -> Result<Response, ProxyError> {
    let id = validate_request(&state.config, conversation_id)?;

    let headers = match state.cache.get(id) {
        Some(cached) => {
            tracing::debug!("Metadata cache hit");
            cached
        }
        None => {
            let upstream_headers = state.upstream.fetch_metadata(id).await?;
            let fresh = RelayHeaders::from_upstream(&upstream_headers);
            state.cache.put(id, fresh.clone());
            fresh
        }
    };

    let mut response = Response::new(Body::empty());
    *response.headers_mut() = headers.to_header_map(&state.cache_control);
    Ok(response)
}

/// Structured metadata returned by the info endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioInfo {
    pub conversation_id: String,
    pub available: bool,
    pub content_type: String,
    pub supports_range: bool,
    pub size_bytes: Option<u64>,
    pub size_mb: Option<f64>,
    pub last_modified: Option<String>,
}

impl AudioInfo {
    pub fn from_headers(conversation_id: &str, headers: &HeaderMap) -> Self {
        let header_str = |name| headers.get(name).and_then(|v: &HeaderValue| v.to_str().ok());
        let size_bytes = header_str(CONTENT_LENGTH).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            conversation_id: conversation_id.to_string(),
            available: true,
            content_type: header_str(CONTENT_TYPE)
                .unwrap_or(AUDIO_CONTENT_TYPE)
                .to_string(),
            supports_range: header_str(ACCEPT_RANGES)
                .is_some_and(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes"))),
            size_bytes,
            size_mb: size_bytes.map(|b| (b as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0),
            last_modified: header_str(LAST_MODIFIED).map(str::to_string),
        }
    }
}

/// GET /audio/{id}/info: fresh upstream metadata as JSON. Not cached.
async fn handle_info(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Response {
    let request_id = new_request_id();
    let span = relay_tracing::audio_request_span!(&request_id, &conversation_id, "info");
    let started = Instant::now();

    async {
        let result = async {
            let id = validate_request(&state.config, &conversation_id)?;
            let headers = state.upstream.fetch_metadata(id).await?;
            Ok::<_, ProxyError>(axum::Json(AudioInfo::from_headers(id, &headers)).into_response())
        }
        .await;
        finish_request(result, &request_id, started)
    }
    .instrument(span)
    .await
}

/// Log the outcome, record it on the request span and tag the response.
fn finish_request(result: Result<Response, ProxyError>, request_id: &str, started: Instant) -> Response {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let span = tracing::Span::current();
    span.record("elapsed_ms", elapsed_ms);

    let mut response = match result {
        Ok(response) => response,
        Err(err) => {
            let status = err.status().as_u16();
            if err.status().is_server_error() {
                tracing::error!(error = %err, status, elapsed_ms, "Request failed");
            } else {
                tracing::warn!(error = %err, status, elapsed_ms, "Request rejected");
            }
            err.into_response()
        }
    };

    span.record("status", response.status().as_u16());
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// GET /: service info.
async fn handle_root() -> Response {
    axum::Json(serde_json::json!({
        "service": SERVICE_NAME,
        "status": "online",
        "version": env!("CARGO_PKG_VERSION"),
        "purpose": "Stream conversation audio from the upstream provider",
        "endpoints": {
            "/": "Service info",
            "/health": "Health check",
            "/audio/{conversation_id}": "Stream audio (GET, HEAD; Range supported)",
            "/audio/{conversation_id}/info": "Audio metadata",
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}

/// GET /health: liveness plus credential presence. Never calls upstream.
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "status": "ok",
            "upstream_configured": state.config.upstream.has_credentials(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received, draining connections...");
}
