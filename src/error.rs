//! Error taxonomy for the sync engine.
//!
//! Transport failures are recovered locally by the dispatcher (cache
//! fallback, empty value, or enqueue) and never reach callers. Store
//! failures are best-effort except on the enqueue path, where losing a
//! mutation has no safe fallback.

use reqwest::StatusCode;

/// Failure of a single network transmission attempt.
///
/// All variants are treated identically by the dispatcher and sync engine:
/// the attempt failed. The distinction exists for logging and for the
/// user-facing `last_error` recorded on queued mutations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Cannot reach backend at {0}")]
    Connect(String),

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("No healthy backend available")]
    NoBackend,

    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("Invalid JSON from backend: {0}")]
    InvalidBody(String),

    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    /// Convert a `reqwest::Error` into a transport error with a
    /// user-friendly message.
    pub fn from_reqwest(base_url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(base_url.to_string());
        }
        if err.is_connect() {
            return Self::Connect(base_url.to_string());
        }
        if err.is_builder() {
            return Self::InvalidUrl(base_url.to_string());
        }
        Self::Connect(format!("{base_url}: {err}"))
    }
}

/// Map an HTTP status code to a user-friendly message.
pub fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session token is invalid or expired".to_string(),
        403 => "Not authorized for this resource".to_string(),
        404 => "Backend endpoint not found".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

/// Durable-storage failure (queue table or database file).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("mutation payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// The only error `Dispatcher::request` surfaces to callers.
///
/// Every transport failure resolves to a value (cached, optimistic, or
/// typed-empty). The exception is a write that can be neither sent nor
/// durably queued: dropping it silently would lose user data.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("cannot queue offline write: {0}")]
    QueueUnavailable(#[source] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_message_known_codes() {
        assert!(status_message(StatusCode::UNAUTHORIZED).contains("invalid or expired"));
        assert!(status_message(StatusCode::NOT_FOUND).contains("not found"));
        assert!(status_message(StatusCode::BAD_GATEWAY).contains("HTTP 502"));
        assert!(status_message(StatusCode::IM_A_TEAPOT).contains("HTTP 418"));
    }
}
