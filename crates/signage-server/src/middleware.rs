//! Request-scoped middleware: client-IP resolution, the rate-limit gate,
//! and bearer-token authentication for the protected sub-router.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use signage_types::{DisplayIdentity, Error, LimitKey};

use crate::oauth_error::ApiError;
use crate::AppState;

/// Deadline for the public device-grant endpoints.
const PUBLIC_ROUTE_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for the protected, bearer-authenticated surface.
const PROTECTED_ROUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// The authenticated display a request resolved to, stashed in extensions
/// by [`auth_middleware`] for handlers to pull out.
#[derive(Clone, Copy, Debug)]
pub struct AuthContext(pub DisplayIdentity);

/// Resolves the caller's address for rate-limit partitioning: `X-Real-IP`,
/// then the first hop of `X-Forwarded-For`, then the socket peer address
/// recorded by `ConnectInfo`. Reverse-proxy headers are trusted as-is; this
/// workspace assumes a proxy in front of it strips/overwrites them for
/// untrusted clients.
fn client_ip(req: &Request<Body>) -> String {
    if let Some(value) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return value.trim().to_string();
    }
    if let Some(value) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = value.split(',').next() {
            return first.trim().to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Classifies a request path into one of the baseline rate-limit kinds.
/// Path matching is prefix-based rather than route-templated, since this
/// middleware runs ahead of axum's route matching.
fn classify(path: &str, method: &axum::http::Method) -> &'static str {
    if path.ends_with("/device/code") {
        "device_code"
    } else if path.ends_with("/activate") && method == axum::http::Method::POST {
        "device_code"
    } else if path.ends_with("/token/refresh") {
        "token_refresh"
    } else if path.ends_with("/ws") {
        "ws_connection"
    } else {
        "api_request"
    }
}

/// Enforces the rate-limit policy registered for the request's endpoint
/// class. Runs ahead of authentication, so the key is partitioned by
/// remote IP rather than display identity.
pub async fn rate_limit_middleware(req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or_else(|| ApiError(Error::Internal("AppState missing from request extensions".into())))?
        .clone();

    let path = req.uri().path().to_string();
    let kind = classify(&path, req.method());
    let ip = client_ip(&req);
    let key = LimitKey::new(kind, path).with_remote_ip(ip);

    match state.rate_limiter.allow(&key) {
        Ok(()) => Ok(next.run(req).await),
        Err(Error::LimitExceeded) => {
            let mut response = ApiError(Error::LimitExceeded).into_response();
            if let Ok(status) = state.rate_limiter.status(&key) {
                let headers = response.headers_mut();
                headers.insert(
                    "ratelimit-limit",
                    status.policy.ceiling().to_string().parse().unwrap(),
                );
                headers.insert(
                    "ratelimit-remaining",
                    status.remaining.to_string().parse().unwrap(),
                );
                headers.insert(
                    "ratelimit-reset",
                    status.reset_after.as_secs().to_string().parse().unwrap(),
                );
            }
            Ok(response)
        }
        Err(e) => Err(ApiError(e)),
    }
}

/// Authenticates a bearer access token, stashing the resolved
/// [`AuthContext`] in request extensions. Only mounted on the protected
/// sub-router; public device-grant endpoints never see this layer.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or_else(|| ApiError(Error::Internal("AppState missing from request extensions".into())))?
        .clone();

    let secret = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| ApiError(Error::Unauthorized("missing bearer token".into())))?;

    let display_id = tokio::task::spawn_blocking(move || {
        let conn = state
            .pool
            .get()
            .map_err(|e| Error::StoreError(e.to_string()))?;
        signage_auth::validate_access_token(&conn, &secret)
    })
    .await
    .map_err(|e| ApiError(Error::Internal(e.to_string())))??;

    req.extensions_mut().insert(AuthContext(display_id));

    Ok(next.run(req).await)
}

/// Makes `Request-ID` and `X-Request-ID` interchangeable, in both
/// directions, around tower-http's request-id layers (which only know
/// about the single canonical `x-request-id` name): an inbound `Request-ID`
/// is accepted as an alias so a caller-supplied id survives instead of
/// being discarded in favor of a freshly generated one, and the id tower-
/// http settles on is mirrored onto `Request-ID` on the way out so both
/// names carry the same value on every response.
pub async fn request_id_alias_middleware(mut req: Request<Body>, next: Next) -> Response {
    if !req.headers().contains_key("x-request-id") {
        if let Some(value) = req.headers().get("request-id").cloned() {
            req.headers_mut().insert("x-request-id", value);
        }
    }

    let mut response = next.run(req).await;

    if let Some(value) = response.headers().get("x-request-id").cloned() {
        response.headers_mut().insert("request-id", value);
    }

    response
}

async fn enforce_timeout(duration: Duration, req: Request<Body>, next: Next) -> Response {
    match tokio::time::timeout(duration, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(?duration, "request exceeded its deadline");
            let mut response = (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": "server_error",
                    "error_description": "request did not complete within its deadline",
                })),
            )
                .into_response();
            let headers = response.headers_mut();
            headers.insert(header::CACHE_CONTROL, "no-store".parse().unwrap());
            headers.insert(header::PRAGMA, "no-cache".parse().unwrap());
            response
        }
    }
}

/// Caps total duration for the unauthenticated device-grant endpoints.
pub async fn public_timeout_middleware(req: Request<Body>, next: Next) -> Response {
    enforce_timeout(PUBLIC_ROUTE_TIMEOUT, req, next).await
}

/// Caps total duration for the bearer-authenticated surface, including the
/// WebSocket upgrade call itself — not the lifetime of the socket it hands
/// off to, since `ws.on_upgrade` detaches into its own task before this
/// layer's future resolves.
pub async fn protected_timeout_middleware(req: Request<Body>, next: Next) -> Response {
    enforce_timeout(PROTECTED_ROUTE_TIMEOUT, req, next).await
}
