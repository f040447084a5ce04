//! Error taxonomy and its mapping onto client-visible responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Failure talking to the upstream provider.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream timeout")]
    Timeout,

    #[error("connectivity error: {0}")]
    ConnectionFailed(String),

    #[error("resource not found upstream")]
    NotFound,

    #[error("upstream returned status {0}")]
    BadStatus(u16),

    /// The upstream request could not be constructed.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Classify an upstream status. `Ok` for any 2xx.
    pub fn check_status(status: StatusCode) -> Result<(), UpstreamError> {
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            Err(UpstreamError::NotFound)
        } else {
            Err(UpstreamError::BadStatus(status.as_u16()))
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_builder() {
            UpstreamError::InvalidRequest(e.to_string())
        } else {
            // connect refused, DNS, reset, truncated body
            UpstreamError::ConnectionFailed(e.to_string())
        }
    }
}

/// Request-level failure, rendered as a JSON error response.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("service misconfigured")]
    Misconfigured,

    #[error("invalid identifier")]
    InvalidId,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Misconfigured => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::InvalidId => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(e) => match e {
                UpstreamError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                UpstreamError::ConnectionFailed(_) => StatusCode::BAD_GATEWAY,
                UpstreamError::NotFound => StatusCode::NOT_FOUND,
                UpstreamError::BadStatus(_) => StatusCode::BAD_GATEWAY,
                UpstreamError::InvalidRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the client. Never includes transport details.
    pub fn client_message(&self) -> String {
        match self {
            ProxyError::Misconfigured => "service misconfigured".to_string(),
            ProxyError::InvalidId => "invalid identifier".to_string(),
            ProxyError::Upstream(e) => match e {
                UpstreamError::Timeout => "upstream timeout".to_string(),
                UpstreamError::ConnectionFailed(_) => "connectivity error".to_string(),
                UpstreamError::NotFound => "resource unavailable".to_string(),
                UpstreamError::BadStatus(code) => format!("upstream error: {code}"),
                UpstreamError::InvalidRequest(_) => "internal error".to_string(),
            },
            ProxyError::Internal(_) => "internal error".to_string(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            axum::Json(serde_json::json!({
                "error": self.client_message(),
                "status": status.as_u16(),
            })),
        )
            .into_response()
    }
}
