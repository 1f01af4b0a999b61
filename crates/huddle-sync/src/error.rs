//! Error types for the sync core.

use thiserror::Error;
use uuid::Uuid;

/// Maximum length for response bodies quoted in error messages.
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Errors that can occur in the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Record not found in the remote store.
    #[error("record not found: {table}/{id}")]
    NotFound { table: String, id: Uuid },

    /// The remote store refused the request.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Rate limited.
    #[error("rate limited - please wait before retrying")]
    RateLimited,

    /// Remote store failed on its side.
    #[error("server error: {0}")]
    Server(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid response from the remote store.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A change payload could not be decoded into its record type.
    #[error("failed to decode {table} change: {reason}")]
    Decode { table: String, reason: String },

    /// A change stream failed while receiving.
    #[error("change stream error: {0}")]
    Stream(String),

    /// A topic could not be subscribed.
    #[error("subscription to {topic} failed: {reason}")]
    Subscription { topic: String, reason: String },

    /// A write was rejected before or after reaching the remote store.
    #[error("write failed: {0}")]
    Write(String),
}

impl SyncError {
    /// Build an error from a non-success HTTP status and response body.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = truncate_body(body);
        match status.as_u16() {
            401 | 403 => SyncError::PermissionDenied(truncated),
            404 => SyncError::InvalidResponse(format!("endpoint not found: {}", truncated)),
            429 => SyncError::RateLimited,
            500..=599 => SyncError::Server(truncated),
            _ => SyncError::InvalidResponse(format!("status {}: {}", status, truncated)),
        }
    }

    /// Whether the failure is likely to go away on its own.
    ///
    /// The core never retries; callers use this to decide whether to.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::RateLimited | SyncError::Server(_) | SyncError::Stream(_) => true,
            SyncError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_mapping() {
        use reqwest::StatusCode;

        assert!(matches!(
            SyncError::from_status(StatusCode::UNAUTHORIZED, ""),
            SyncError::PermissionDenied(_)
        ));
        assert!(matches!(
            SyncError::from_status(StatusCode::FORBIDDEN, "nope"),
            SyncError::PermissionDenied(_)
        ));
        assert!(matches!(
            SyncError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            SyncError::RateLimited
        ));
        assert!(matches!(
            SyncError::from_status(StatusCode::BAD_GATEWAY, "down"),
            SyncError::Server(_)
        ));
        assert!(matches!(
            SyncError::from_status(StatusCode::BAD_REQUEST, "bad"),
            SyncError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_long_body_truncated() {
        let body = "x".repeat(2_000);
        let err = SyncError::from_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, &body);
        let msg = err.to_string();
        assert!(msg.contains("truncated, 2000 total bytes"));
        assert!(msg.len() < 700);
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::RateLimited.is_transient());
        assert!(SyncError::Server("boom".into()).is_transient());
        assert!(!SyncError::PermissionDenied("no".into()).is_transient());
        assert!(
            !SyncError::NotFound {
                table: "parties".into(),
                id: Uuid::nil()
            }
            .is_transient()
        );
    }
}
