//! HTTP and WebSocket handlers for the device authorization grant, the
//! bearer token lifecycle, and the display registry surface.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use signage_auth::{activate_code, generate_code};
use signage_registry::DisplayRecord;
use signage_types::{DisplayLocation, Error};

use crate::hub;
use crate::middleware::AuthContext;
use crate::oauth_error::ApiError;
use crate::AppState;

#[derive(Serialize)]
pub struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    expires_in: i64,
    interval: i64,
    verification_uri: String,
    verification_uri_complete: String,
}

pub async fn device_code_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<DeviceCodeResponse>, ApiError> {
    let issued = tokio::task::spawn_blocking(move || {
        let conn = state.pool.get().map_err(|e| Error::StoreError(e.to_string()))?;
        let issued = generate_code(&conn)?;
        Ok::<_, Error>((issued, state.public_url.clone()))
    })
    .await
    .map_err(|e| ApiError(Error::Internal(e.to_string())))??;

    let (issued, public_url) = issued;
    let verification_uri = format!("{public_url}/api/v1alpha1/displays/activate");
    let verification_uri_complete = format!("{verification_uri}?user_code={}", issued.user_code);

    Ok(Json(DeviceCodeResponse {
        device_code: issued.device_code,
        user_code: issued.user_code,
        expires_in: (issued.expires_at - chrono::Utc::now()).num_seconds().max(0),
        interval: issued.poll_interval,
        verification_uri,
        verification_uri_complete,
    }))
}

#[derive(Deserialize)]
pub struct ActivateRequest {
    activation_code: String,
    name: String,
    location: DisplayLocation,
}

#[derive(Serialize)]
pub struct AuthDto {
    access_token: String,
    refresh_token: String,
    token_type: &'static str,
    expires_in: i64,
    refresh_expires_in: i64,
}

#[derive(Serialize)]
pub struct ActivateResponse {
    display: DisplayRecord,
    auth: AuthDto,
}

/// Creates the display and binds the device-authorization code to it in
/// one call. If code activation fails after the display was created, the
/// display is left in place rather than rolled back — a future retry with
/// a fresh code reuses it instead of hitting a name conflict.
pub async fn activate_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<ActivateRequest>,
) -> Result<Json<ActivateResponse>, ApiError> {
    let result = tokio::task::spawn_blocking(move || {
        let mut conn = state.pool.get().map_err(|e| Error::StoreError(e.to_string()))?;
        let display = signage_registry::create_display(&conn, &body.name, &body.location)?;
        activate_code(&conn, &body.activation_code, display.id)?;
        let token = signage_auth::create_token(&mut conn, display.id)?;
        Ok::<_, Error>((display, token))
    })
    .await
    .map_err(|e| ApiError(Error::Internal(e.to_string())))??;

    let (display, token) = result;
    Ok(Json(ActivateResponse {
        display,
        auth: AuthDto {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            token_type: "Bearer",
            expires_in: (token.access_expires_at - chrono::Utc::now()).num_seconds().max(0),
            refresh_expires_in: (token.refresh_expires_at - chrono::Utc::now()).num_seconds().max(0),
        },
    }))
}

fn extract_bearer(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| ApiError(Error::Unauthorized("missing bearer token".into())))
}

pub async fn token_refresh_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<AuthDto>, ApiError> {
    let secret = extract_bearer(&headers)?;

    let token = tokio::task::spawn_blocking(move || {
        let mut conn = state.pool.get().map_err(|e| Error::StoreError(e.to_string()))?;
        signage_auth::refresh_token(&mut conn, &secret)
    })
    .await
    .map_err(|e| ApiError(Error::Internal(e.to_string())))??;

    Ok(Json(AuthDto {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        token_type: "Bearer",
        expires_in: (token.access_expires_at - chrono::Utc::now()).num_seconds().max(0),
        refresh_expires_in: (token.refresh_expires_at - chrono::Utc::now()).num_seconds().max(0),
    }))
}

/// Resolves `{id}` and checks it names the calling display. All
/// self-scoped endpoints share this check: a valid bearer token only ever
/// authorizes its own display's record.
fn require_self(record: &DisplayRecord, auth: &AuthContext) -> Result<(), ApiError> {
    if record.id != auth.0 {
        return Err(ApiError(Error::Forbidden(
            "token does not authorize this display".into(),
        )));
    }
    Ok(())
}

pub async fn get_display_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<DisplayRecord>, ApiError> {
    let record = tokio::task::spawn_blocking(move || {
        let conn = state.pool.get().map_err(|e| Error::StoreError(e.to_string()))?;
        signage_registry::find_display(&conn, &id)?.ok_or_else(|| Error::NotFound(format!("display {id} not found")))
    })
    .await
    .map_err(|e| ApiError(Error::Internal(e.to_string())))??;

    require_self(&record, &auth)?;
    Ok(Json(record))
}

pub async fn reactivate_display_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<DisplayRecord>, ApiError> {
    let record = {
        let state = state.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = state.pool.get().map_err(|e| Error::StoreError(e.to_string()))?;
            signage_registry::find_display(&conn, &id)?.ok_or_else(|| Error::NotFound(format!("display {id} not found")))
        })
        .await
        .map_err(|e| ApiError(Error::Internal(e.to_string())))??
    };

    require_self(&record, &auth)?;

    let updated = tokio::task::spawn_blocking(move || {
        let conn = state.pool.get().map_err(|e| Error::StoreError(e.to_string()))?;
        signage_registry::set_state(&conn, record.id, signage_types::DisplayState::Active)?;
        signage_registry::get_display_by_id(&conn, record.id)?
            .ok_or_else(|| Error::Internal("display vanished after state update".into()))
    })
    .await
    .map_err(|e| ApiError(Error::Internal(e.to_string())))??;

    Ok(Json(updated))
}

pub async fn touch_last_seen_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let record = {
        let state = state.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = state.pool.get().map_err(|e| Error::StoreError(e.to_string()))?;
            signage_registry::find_display(&conn, &id)?.ok_or_else(|| Error::NotFound(format!("display {id} not found")))
        })
        .await
        .map_err(|e| ApiError(Error::Internal(e.to_string())))??
    };

    require_self(&record, &auth)?;

    tokio::task::spawn_blocking(move || {
        let conn = state.pool.get().map_err(|e| Error::StoreError(e.to_string()))?;
        signage_registry::touch_last_seen(&conn, record.id)
    })
    .await
    .map_err(|e| ApiError(Error::Internal(e.to_string())))??;

    Ok(StatusCode::NO_CONTENT)
}

/// Upgrades to a WebSocket, enforcing the per-frame read-rate limit for
/// the lifetime of the connection via the same rate limiter used for
/// every other endpoint, keyed under a distinct sub-endpoint so it draws
/// from its own budget rather than the connection-establishment one.
/// Refuses the upgrade outright if the bearer's bound display isn't
/// `ACTIVE` — a disabled display never exchanges a single frame.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let display_id = auth.0;

    let record = {
        let state = state.clone();
        tokio::task::spawn_blocking(move || {
            let conn = state.pool.get().map_err(|e| Error::StoreError(e.to_string()))?;
            signage_registry::get_display_by_id(&conn, display_id)?
                .ok_or_else(|| Error::NotFound(format!("display {display_id} not found")))
        })
        .await
        .map_err(|e| ApiError(Error::Internal(e.to_string())))??
    };

    if record.state != signage_types::DisplayState::Active {
        return Err(ApiError(Error::Forbidden(
            "display is not active".into(),
        )));
    }

    let hub_handle = state.hub.clone();
    let rate_limiter = state.rate_limiter.clone();

    Ok(ws
        .on_upgrade(move |socket| async move {
            let key = signage_types::LimitKey::new("ws_connection", "ws:frame")
                .with_token(display_id.to_string());
            let rate_check = move || rate_limiter.allow(&key).is_ok();
            hub::handle_socket(socket, display_id, hub_handle, rate_check).await;
        })
        .into_response())
}
