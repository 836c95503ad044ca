//! REST error types.

use reqwest::StatusCode;
use thiserror::Error;

/// Result type for REST operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors that can occur while talking to the backend.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 401 from a protected endpoint.
    #[error("Access credential expired or missing")]
    AuthExpired,

    /// The refresh endpoint rejected the stored refresh credential.
    #[error("Session is no longer valid: {0}")]
    AuthInvalid(String),

    /// Network failure or timeout before a response arrived.
    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    /// 400 or 422.
    #[error("Request rejected ({status}): {message}")]
    Validation { status: StatusCode, message: String },

    /// Any other non-success status.
    #[error("Unexpected status {status}: {message}")]
    Status { status: StatusCode, message: String },

    /// Body did not match the expected shape.
    #[error("Failed to parse response: {0}")]
    Decode(String),

    /// Credential store I/O.
    #[error("Credential store error: {0}")]
    Storage(#[from] std::io::Error),
}

impl ApiError {
    /// Map a non-success status and its body to an error.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = error_message(body);
        match status {
            StatusCode::UNAUTHORIZED => Self::AuthExpired,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Self::Validation { status, message }
            }
            _ => Self::Status { status, message },
        }
    }

    pub(crate) fn transport(url: &str, err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "timed out".to_string()
        } else {
            err.to_string()
        };
        Self::Transport {
            url: url.to_string(),
            message,
        }
    }

    /// HTTP status behind this error, if a response was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::AuthExpired => Some(StatusCode::UNAUTHORIZED),
            Self::Validation { status, .. } | Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Transient failures: no response at all, or a 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

/// Pull a human-readable message out of an error body.
///
/// The backend answers with `{"detail": "..."}` for most failures and with a
/// field map for validation errors; anything else is passed through.
fn error_message(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return "no response body".to_string();
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => match map.get("detail") {
            Some(serde_json::Value::String(detail)) => detail.clone(),
            _ => serde_json::Value::Object(map).to_string(),
        },
        _ => body.to_string(),
    }
}
