//! The single place in this workspace that turns an internal `Error` into
//! an OAuth-compliant HTTP response. No other layer should branch on a
//! specific error variant to decide what a caller sees.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use signage_types::Error;

#[derive(Serialize)]
struct OAuthErrorBody {
    error: &'static str,
    error_description: String,
}

/// Wraps the shared error taxonomy so this crate can implement a foreign
/// trait (`IntoResponse`) for it.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

fn map(err: &Error) -> (StatusCode, &'static str) {
    match err {
        Error::LimitExceeded => (StatusCode::TOO_MANY_REQUESTS, "slow_down"),
        Error::TokenExpired => (StatusCode::UNAUTHORIZED, "expired_token"),
        Error::TokenInvalid | Error::TokenNotFound => (StatusCode::UNAUTHORIZED, "invalid_client"),
        Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "invalid_request"),
        Error::Forbidden(_) => (StatusCode::FORBIDDEN, "access_denied"),
        Error::InvalidInput(_) | Error::InvalidKey(_) | Error::InvalidLimit(_) => {
            (StatusCode::BAD_REQUEST, "invalid_request")
        }
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "invalid_request"),
        Error::Conflict(_) => (StatusCode::CONFLICT, "invalid_request"),
        Error::CodeNotFound => (StatusCode::NOT_FOUND, "invalid_grant"),
        Error::CodeExpired => (StatusCode::BAD_REQUEST, "expired_token"),
        Error::AlreadyActive => (StatusCode::CONFLICT, "invalid_grant"),
        Error::VersionMismatch | Error::StoreError(_) | Error::Internal(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = map(&self.0);

        if !matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::warn!(kind = self.0.kind(), error = %self.0, "request rejected");
        } else {
            tracing::error!(kind = self.0.kind(), error = %self.0, "internal error handling request");
        }

        let body = OAuthErrorBody {
            error,
            error_description: self.0.to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, "no-store".parse().unwrap());
        headers.insert(header::PRAGMA, "no-cache".parse().unwrap());
        if status == StatusCode::TOO_MANY_REQUESTS {
            headers.insert("retry-after", "60".parse().unwrap());
        }
        response
    }
}

/// Renders a caught handler panic as the same OAuth-compliant `server_error`
/// body every other internal failure produces, so a panic is never visible
/// to a caller as a bare 500 with no body or a different shape.
pub fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "request handler panicked");

    let body = OAuthErrorBody {
        error: "server_error",
        error_description: "internal error handling request".to_string(),
    };
    let mut response = (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, "no-store".parse().unwrap());
    headers.insert(header::PRAGMA, "no-cache".parse().unwrap());
    response
}
