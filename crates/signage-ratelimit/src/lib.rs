//! Rate-limit decision engine: a policy table over an atomic counter store.

mod limiter;
mod store;

pub use limiter::{LimitStatus, RateLimiter};
pub use store::{CounterStore, InMemoryCounterStore};

pub use signage_types::{LimitKey, LimitPolicy};
