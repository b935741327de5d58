//! Shared types for the signage control plane.
//!
//! No crate in this workspace depends on anything except `signage-types`
//! and its own leaf dependencies. Error kinds, identifiers, and policy
//! shapes that cross crate boundaries live here so every layer agrees on
//! their meaning.

mod error;
mod limit;

pub use error::Error;
pub use limit::{LimitKey, LimitPolicy};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque 128-bit identifier for a display endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplayIdentity(pub Uuid);

impl DisplayIdentity {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for DisplayIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DisplayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a display record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DisplayState {
    Pending,
    Active,
    Disabled,
}

impl DisplayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayState::Pending => "PENDING",
            DisplayState::Active => "ACTIVE",
            DisplayState::Disabled => "DISABLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(DisplayState::Pending),
            "ACTIVE" => Some(DisplayState::Active),
            "DISABLED" => Some(DisplayState::Disabled),
            _ => None,
        }
    }
}

/// Physical placement of a display. Deliberately minimal: scheduling and
/// content-health fields are out of scope for the authentication/connection
/// plane this workspace implements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayLocation {
    pub site_id: String,
    pub zone: String,
    pub position: String,
}
