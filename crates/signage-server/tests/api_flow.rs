use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
};
use serde_json::{json, Value};
use signage_db::{create_pool, run_migrations, PoolSettings};
use signage_ratelimit::RateLimiter;
use signage_server::{app, hub, AppState};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tower::ServiceExt;

fn test_addr() -> ConnectInfo<SocketAddr> {
    ConnectInfo(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 40000))
}

fn build_state() -> AppState {
    let pool = create_pool(":memory:", PoolSettings::default()).unwrap();
    {
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
    }
    let rate_limiter = RateLimiter::new();
    rate_limiter.register_default_limits();
    let (the_hub, hub_handle) = hub::Hub::new(rate_limiter.clone());
    tokio::spawn(the_hub.run());
    AppState {
        pool,
        rate_limiter,
        hub: hub_handle,
        public_url: "http://localhost:8080".to_string(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn happy_path_provisioning() {
    let state = build_state();
    let app = app(state);

    let mut request = Request::builder()
        .uri("/api/v1alpha1/displays/device/code")
        .method("POST")
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(test_addr());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let code_body = body_json(response).await;
    let user_code = code_body["user_code"].as_str().unwrap().to_string();
    assert!(code_body["verification_uri"]
        .as_str()
        .unwrap()
        .ends_with("/api/v1alpha1/displays/activate"));

    let activate_body = json!({
        "activation_code": user_code,
        "name": "lobby-01",
        "location": { "site_id": "hq", "zone": "lobby", "position": "north" }
    });
    let mut request = Request::builder()
        .uri("/api/v1alpha1/displays/activate")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(activate_body.to_string()))
        .unwrap();
    request.extensions_mut().insert(test_addr());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let activated = body_json(response).await;
    let access_token = activated["auth"]["access_token"].as_str().unwrap().to_string();
    let display_id = activated["display"]["id"].as_str().unwrap().to_string();

    let mut request = Request::builder()
        .uri(format!("/api/v1alpha1/displays/{display_id}"))
        .header("authorization", format!("Bearer {access_token}"))
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(test_addr());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["state"], "ACTIVE");
}

#[tokio::test]
async fn expired_activation_code_is_rejected() {
    let state = build_state();
    {
        let conn = state.pool.get().unwrap();
        let issued = signage_auth::generate_code(&conn).unwrap();
        conn.execute(
            "UPDATE device_codes SET expires_at = ?1 WHERE user_code = ?2",
            rusqlite::params![
                (chrono::Utc::now() - chrono::Duration::minutes(16)).to_rfc3339(),
                issued.user_code
            ],
        )
        .unwrap();

        let app = app(state);
        let body = json!({
            "activation_code": issued.user_code,
            "name": "lobby-02",
            "location": { "site_id": "hq", "zone": "lobby", "position": "south" }
        });
        let mut request = Request::builder()
            .uri("/api/v1alpha1/displays/activate")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        request.extensions_mut().insert(test_addr());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = body_json(response).await;
        assert_eq!(error["error"], "expired_token");
    }
}

#[tokio::test]
async fn refresh_replaces_pair_and_old_refresh_is_rejected() {
    let state = build_state();
    let app = app(state.clone());

    let activated = {
        let conn = state.pool.get().unwrap();
        let issued = signage_auth::generate_code(&conn).unwrap();
        let display = signage_registry::create_display(
            &conn,
            "lobby-03",
            &signage_types::DisplayLocation {
                site_id: "hq".into(),
                zone: "lobby".into(),
                position: "east".into(),
            },
        )
        .unwrap();
        signage_auth::activate_code(&conn, &issued.user_code, display.id).unwrap();
        display
    };
    let mut conn = state.pool.get().unwrap();
    let first = signage_auth::create_token(&mut conn, activated.id).unwrap();
    drop(conn);

    let mut request = Request::builder()
        .uri("/api/v1alpha1/displays/token/refresh")
        .method("POST")
        .header("authorization", format!("Bearer {}", first.refresh_token))
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(test_addr());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let second = body_json(response).await;
    let second_refresh = second["refresh_token"].as_str().unwrap().to_string();

    let mut request = Request::builder()
        .uri("/api/v1alpha1/displays/token/refresh")
        .method("POST")
        .header("authorization", format!("Bearer {second_refresh}"))
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(test_addr());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut request = Request::builder()
        .uri("/api/v1alpha1/displays/token/refresh")
        .method("POST")
        .header("authorization", format!("Bearer {}", first.refresh_token))
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(test_addr());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error = body_json(response).await;
    assert_eq!(error["error"], "invalid_client");
}

#[tokio::test]
async fn device_code_flood_is_rate_limited() {
    let state = build_state();
    let app = app(state);

    for i in 1..=11 {
        let mut request = Request::builder()
            .uri("/api/v1alpha1/displays/device/code")
            .method("POST")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(test_addr());
        let response = app.clone().oneshot(request).await.unwrap();

        if i <= 10 {
            assert_eq!(response.status(), StatusCode::OK, "request {i} should succeed");
        } else {
            assert_eq!(
                response.status(),
                StatusCode::TOO_MANY_REQUESTS,
                "request {i} should be rate limited"
            );
            let headers = response.headers().clone();
            assert!(headers.contains_key("retry-after"));
            assert_eq!(headers.get("ratelimit-remaining").unwrap(), "0");
            let body = body_json(response).await;
            assert_eq!(body["error"], "slow_down");
        }
    }
}
