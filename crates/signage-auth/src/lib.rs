//! Token lifecycle and device-authorization-grant state machine for the
//! signage control plane. No HTTP or OAuth-vocabulary concerns live here —
//! those belong to the server crate's boundary mapping.

mod constant_time;
mod device_code;
mod token;

pub use constant_time::constant_time_eq;
pub use device_code::{
    activate_code, generate_code, poll_device_code, DeviceCodeIssued, PollOutcome, CODE_TTL,
    POLL_INTERVAL_SECONDS,
};
pub use token::{
    create_token, refresh_token, revoke_tokens, validate_access_token, TokenRecord,
    ACCESS_TOKEN_TTL, REFRESH_TOKEN_TTL,
};
