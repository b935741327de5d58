//! In-process counter store: an atomic integer per key with a sliding TTL.
//!
//! A production deployment would back this with a shared key/value store
//! (the persisted-state section of the spec this crate implements calls
//! for `rate:{type}:{token}:{remoteIp}:{endpoint}` keys with TTL equal to
//! the policy period) so counters are consistent across server instances.
//! The in-memory implementation here satisfies the same contract for a
//! single process and is what every test in this workspace exercises.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use signage_types::Error;

/// Atomic increment-with-TTL counter, keyed by an opaque string.
pub trait CounterStore: Send + Sync {
    /// Increments the counter for `key`, resetting it to 1 if the previous
    /// window has expired or the key is new. Returns the post-increment
    /// count.
    fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Error>;

    /// Reads the current count without mutating it. Returns 0 for an
    /// unknown or expired key.
    fn peek(&self, key: &str) -> Result<u64, Error>;

    /// Clears the counter for `key`.
    fn reset(&self, key: &str) -> Result<(), Error>;
}

struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

/// Eviction threshold: once the table grows past this many entries, a
/// sweep drops everything whose window has already lapsed. Mirrors the
/// housekeeping a process-local rate limiter needs so abandoned keys
/// (one-off IPs, expired tokens) don't accumulate forever.
const EVICTION_THRESHOLD: usize = 10_000;

#[derive(Clone, Default)]
pub struct InMemoryCounterStore {
    state: Arc<Mutex<HashMap<String, CounterEntry>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CounterEntry>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("rate limiter counter store lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        }
    }
}

impl CounterStore for InMemoryCounterStore {
    fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Error> {
        let mut state = self.lock();
        let now = Instant::now();

        if state.len() > EVICTION_THRESHOLD {
            state.retain(|_, entry| entry.expires_at > now);
        }

        let entry = state.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at: now + ttl,
        });

        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + ttl;
        }

        entry.count += 1;
        Ok(entry.count)
    }

    fn peek(&self, key: &str) -> Result<u64, Error> {
        let state = self.lock();
        let now = Instant::now();
        Ok(match state.get(key) {
            Some(entry) if entry.expires_at > now => entry.count,
            _ => 0,
        })
    }

    fn reset(&self, key: &str) -> Result<(), Error> {
        let mut state = self.lock();
        state.remove(key);
        Ok(())
    }
}
