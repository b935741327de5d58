//! Signage control-plane server binary: config, structured logging,
//! database init, and graceful shutdown around the axum app built in
//! `lib.rs`.

use std::net::SocketAddr;

use signage_db::{create_pool, run_migrations, PoolSettings};
use signage_ratelimit::{LimitPolicy, RateLimiter};
use signage_server::config;
use signage_server::{app, hub, AppState};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn build_rate_limiter(overrides: &config::RateLimitOverrides) -> RateLimiter {
    let limiter = RateLimiter::new();
    limiter.register_default_limits();

    for (kind, rate) in [
        ("token_refresh", overrides.token_refresh_rate),
        ("api_request", overrides.api_request_rate),
        ("device_code", overrides.device_code_rate),
        ("ws_connection", overrides.ws_connection_rate),
    ] {
        if let Some(rate) = rate {
            let policy = limiter
                .get_limit(kind)
                .expect("baseline policy registered for every overridable kind");
            limiter
                .register_limit(kind, LimitPolicy::new(rate, policy.period, policy.burst_size, policy.wait_timeout))
                .expect("rate override from config should be a valid policy");
        }
    }

    limiter
}

#[tokio::main]
async fn main() {
    let config = config::load_config(Some("signage.toml"))
        .expect("failed to load configuration — the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let pool = create_pool(
        &config.database.path,
        PoolSettings {
            max_size: config.database.pool_max_size,
            busy_timeout_ms: config.database.busy_timeout_ms,
        },
    )
    .expect("failed to create database pool — check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let rate_limiter = build_rate_limiter(&config.rate_limit);

    let (the_hub, hub_handle) = hub::Hub::new(rate_limiter.clone());
    tokio::spawn(the_hub.run());

    let state = AppState {
        pool,
        rate_limiter,
        hub: hub_handle,
        public_url: config.server.public_url.clone(),
    };

    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting signage server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    tracing::info!("signage server shut down");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
