//! Signage control-plane server: the device authorization grant, bearer
//! token lifecycle, display registry, and WebSocket hub, wired up behind
//! one axum router.

pub mod api;
pub mod config;
pub mod hub;
pub mod middleware;
pub mod oauth_error;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, Request},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use signage_db::DbPool;
use signage_ratelimit::RateLimiter;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use hub::HubHandle;

/// Maximum body accepted by `POST /activate`/`POST /device/code`, per §6.
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state, inserted into request extensions as
/// `Arc<AppState>` rather than pulled through axum's `State` extractor —
/// handlers and middleware both need it, and this keeps the two symmetric.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub rate_limiter: RateLimiter,
    pub hub: HubHandle,
    pub public_url: String,
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready(Extension(state): Extension<Arc<AppState>>) -> (axum::http::StatusCode, Json<Value>) {
    match state.pool.get() {
        Ok(_) => (axum::http::StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => {
            tracing::warn!(error = %e, "readiness probe failed to acquire a pool connection");
            (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}

/// Builds the application router. `/healthz` and `/readyz` sit outside the
/// versioned base path and are mounted on a router merged in *after* the
/// rate-limit layer, so they never consume any endpoint class's budget —
/// per §6, these two probes carry no rate limit at all.
pub fn app(state: AppState) -> Router {
    const BASE: &str = "/api/v1alpha1/displays";

    let protected_routes = Router::new()
        .route(&format!("{BASE}/{{id}}"), get(api::get_display_handler))
        .route(
            &format!("{BASE}/{{id}}/activate"),
            put(api::reactivate_display_handler),
        )
        .route(
            &format!("{BASE}/{{id}}/last-seen"),
            put(api::touch_last_seen_handler),
        )
        .route(&format!("{BASE}/ws"), get(api::ws_handler))
        .layer(axum::middleware::from_fn(middleware::auth_middleware))
        .layer(axum::middleware::from_fn(middleware::protected_timeout_middleware));

    let public_routes = Router::new()
        .route(&format!("{BASE}/device/code"), post(api::device_code_handler))
        .route(&format!("{BASE}/activate"), post(api::activate_handler))
        .route(
            &format!("{BASE}/token/refresh"),
            post(api::token_refresh_handler),
        )
        .layer(axum::middleware::from_fn(middleware::public_timeout_middleware));

    let rate_limited_routes = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(axum::middleware::from_fn(middleware::rate_limit_middleware));

    let health_routes = Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(ready));

    Router::new()
        .merge(health_routes)
        .merge(rate_limited_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::custom(oauth_error::handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(axum::middleware::from_fn(middleware::request_id_alias_middleware))
        .layer(Extension(Arc::new(state)))
}

/// Reads the request ID tower-http attached, for handlers that want to
/// echo it explicitly rather than relying on header propagation alone.
pub(crate) fn request_id(req: &Request<axum::body::Body>) -> Option<String> {
    req.headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use signage_db::{create_pool, run_migrations, PoolSettings};
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let pool = create_pool(":memory:", PoolSettings::default()).unwrap();
        run_migrations(&pool.get().unwrap()).unwrap();
        let rate_limiter = RateLimiter::new();
        rate_limiter.register_default_limits();
        let (the_hub, hub_handle) = hub::Hub::new(rate_limiter.clone());
        tokio::spawn(the_hub.run());
        AppState {
            pool,
            rate_limiter,
            hub: hub_handle,
            public_url: "https://signage.example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let app = app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_reports_ok_with_a_working_pool() {
        let app = app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/readyz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
