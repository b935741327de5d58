use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Composite identity of a rate-limit counter. `kind` names the limit
/// class ("device_code", "api_request", "token_refresh", "ws_connection");
/// `token` and `remote_ip` partition the counter space by caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    pub kind: String,
    pub token: Option<String>,
    pub remote_ip: Option<String>,
    pub endpoint: String,
}

impl LimitKey {
    pub fn new(kind: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            token: None,
            remote_ip: None,
            endpoint: endpoint.into(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_remote_ip(mut self, ip: impl Into<String>) -> Self {
        self.remote_ip = Some(ip.into());
        self
    }

    /// The flat string key used by the counter store, e.g.
    /// `rate:api_request:tok123:203.0.113.4:/api/v1alpha1/displays/ws`.
    pub fn store_key(&self) -> String {
        format!(
            "rate:{}:{}:{}:{}",
            self.kind,
            self.token.as_deref().unwrap_or("-"),
            self.remote_ip.as_deref().unwrap_or("-"),
            self.endpoint
        )
    }
}

/// Concrete rate/period/burst/wait parameters for one limit class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitPolicy {
    pub rate: u32,
    pub period: Duration,
    pub burst_size: u32,
    pub wait_timeout: Duration,
}

impl LimitPolicy {
    pub fn new(rate: u32, period: Duration, burst_size: u32, wait_timeout: Duration) -> Self {
        Self {
            rate,
            period,
            burst_size,
            wait_timeout,
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.rate + self.burst_size
    }
}

/// The default policy table installed by `RegisterDefaultLimits`.
pub fn baseline_policies() -> Vec<(&'static str, LimitPolicy)> {
    vec![
        (
            "token_refresh",
            LimitPolicy::new(5, Duration::from_secs(3600), 2, Duration::ZERO),
        ),
        (
            "api_request",
            LimitPolicy::new(120, Duration::from_secs(60), 30, Duration::from_secs(1)),
        ),
        (
            "device_code",
            LimitPolicy::new(10, Duration::from_secs(60), 0, Duration::ZERO),
        ),
        (
            "ws_connection",
            LimitPolicy::new(60, Duration::from_secs(60), 15, Duration::ZERO),
        ),
    ]
}
