//! Crate-wide error type.
//!
//! Mirrors the propagation policy of spec.md §7: every error raised inside a
//! request handler is caught at the dispatch boundary and serialized into the
//! RPC response's `error` field. Handlers never abort the process — only the
//! liveness monitor does that.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("key locked: {0}")]
    KeyLocked(String),

    #[error("bad passphrase or corrupt ciphertext")]
    BadPassphraseOrCorrupt,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("token already redeemed")]
    AlreadyRedeemed,

    #[error("expired")]
    Expired,

    #[error("denied")]
    Denied,

    #[error("timed out waiting for admin approval")]
    TimedOut,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Stable string tag used in the RPC `error` field and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "bad_request",
            Error::Unauthorized => "unauthorized",
            Error::KeyLocked(_) => "key_locked",
            Error::BadPassphraseOrCorrupt => "bad_passphrase_or_corrupt",
            Error::NotFound(_) => "not_found",
            Error::AlreadyRedeemed => "already_redeemed",
            Error::Expired => "expired",
            Error::Denied => "denied",
            Error::TimedOut => "timed_out",
            Error::Conflict(_) => "conflict",
            Error::Internal(_) => "internal",
            Error::Storage(_) => "internal",
            Error::Transport(_) => "internal",
        }
    }
}

/// Only the approval web UI surfaces errors as HTTP responses; the RPC
/// planes serialize `Error` into a response envelope's `error` field instead.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Expired | Error::AlreadyRedeemed => StatusCode::GONE,
            Error::Denied => StatusCode::FORBIDDEN,
            Error::TimedOut => StatusCode::REQUEST_TIMEOUT,
            Error::KeyLocked(_) | Error::BadPassphraseOrCorrupt => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage(_) | Error::Transport(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
