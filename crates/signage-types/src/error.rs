use thiserror::Error as ThisError;

/// The full internal error taxonomy shared by every store and service in
/// this workspace. The HTTP boundary (and only the HTTP boundary) maps
/// these onto the OAuth-compliant error vocabulary; no other layer should
/// match on a specific variant to decide what to tell a caller.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("version mismatch")]
    VersionMismatch,

    #[error("token expired")]
    TokenExpired,

    #[error("token invalid")]
    TokenInvalid,

    #[error("token not found")]
    TokenNotFound,

    #[error("activation code not found")]
    CodeNotFound,

    #[error("activation code expired")]
    CodeExpired,

    #[error("activation code already active")]
    AlreadyActive,

    #[error("rate limit exceeded")]
    LimitExceeded,

    #[error("store error: {0}")]
    StoreError(String),

    #[error("invalid limit definition: {0}")]
    InvalidLimit(String),

    #[error("invalid rate limit key: {0}")]
    InvalidKey(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-stable tag, used in log fields where a full `Display`
    /// string would be noisy.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::InvalidInput(_) => "invalid_input",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::VersionMismatch => "version_mismatch",
            Error::TokenExpired => "token_expired",
            Error::TokenInvalid => "token_invalid",
            Error::TokenNotFound => "token_not_found",
            Error::CodeNotFound => "code_not_found",
            Error::CodeExpired => "code_expired",
            Error::AlreadyActive => "already_active",
            Error::LimitExceeded => "limit_exceeded",
            Error::StoreError(_) => "store_error",
            Error::InvalidLimit(_) => "invalid_limit",
            Error::InvalidKey(_) => "invalid_key",
            Error::Internal(_) => "internal",
        }
    }
}
