use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use signage_types::{baseline_policies, Error, LimitKey, LimitPolicy};

use crate::store::{CounterStore, InMemoryCounterStore};

/// Snapshot of a key's current standing against its policy, returned by
/// `Status` without mutating the underlying counter.
#[derive(Debug, Clone, Copy)]
pub struct LimitStatus {
    pub remaining: u32,
    /// Approximate: `now + period`, not the true window-end instant. See
    /// the design notes on `Status.reset` for why this is accepted.
    pub reset_after: Duration,
    pub policy: LimitPolicy,
}

/// Policy-driven decision engine over a `CounterStore`.
#[derive(Clone)]
pub struct RateLimiter {
    policies: Arc<RwLock<HashMap<String, LimitPolicy>>>,
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            policies: Arc::new(RwLock::new(HashMap::new())),
            store: Arc::new(InMemoryCounterStore::new()),
        }
    }

    pub fn with_store(store: Arc<dyn CounterStore>) -> Self {
        Self {
            policies: Arc::new(RwLock::new(HashMap::new())),
            store,
        }
    }

    /// Installs the baseline policy table (token_refresh, api_request,
    /// device_code, ws_connection).
    pub fn register_default_limits(&self) {
        let mut policies = self.policies.write().unwrap_or_else(|p| p.into_inner());
        for (kind, policy) in baseline_policies() {
            policies.insert(kind.to_string(), policy);
        }
    }

    pub fn register_limit(&self, kind: impl Into<String>, policy: LimitPolicy) -> Result<(), Error> {
        if policy.rate == 0 {
            return Err(Error::InvalidLimit("rate must be greater than zero".into()));
        }
        if policy.period.is_zero() {
            return Err(Error::InvalidLimit("period must be greater than zero".into()));
        }
        let mut policies = self.policies.write().unwrap_or_else(|p| p.into_inner());
        policies.insert(kind.into(), policy);
        Ok(())
    }

    pub fn get_limit(&self, kind: &str) -> Option<LimitPolicy> {
        let policies = self.policies.read().unwrap_or_else(|p| p.into_inner());
        policies.get(kind).copied()
    }

    /// Renders an allow/deny decision for `key`, incrementing its counter
    /// as a side effect of an allowed call. A key whose `kind` has no
    /// registered policy is allowed unconditionally (logged once as a
    /// misconfiguration signal, never silently in production logs).
    pub fn allow(&self, key: &LimitKey) -> Result<(), Error> {
        if key.kind.is_empty() {
            return Err(Error::InvalidKey("limit key kind must not be empty".into()));
        }

        let Some(policy) = self.get_limit(&key.kind) else {
            tracing::warn!(kind = %key.kind, "no rate limit policy registered for this key kind, allowing");
            return Ok(());
        };

        let count = self.store.increment(&key.store_key(), policy.period)?;

        if count > policy.ceiling() as u64 {
            return Err(Error::LimitExceeded);
        }

        Ok(())
    }

    pub fn status(&self, key: &LimitKey) -> Result<LimitStatus, Error> {
        let policy = self
            .get_limit(&key.kind)
            .ok_or_else(|| Error::InvalidKey(format!("no policy registered for {}", key.kind)))?;

        let count = self.store.peek(&key.store_key())?;
        let remaining = policy.rate.saturating_sub(count as u32);

        Ok(LimitStatus {
            remaining,
            reset_after: policy.period,
            policy,
        })
    }

    pub fn reset(&self, key: &LimitKey) -> Result<(), Error> {
        self.store.reset(&key.store_key())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
