//! Error types for the SARK gateway
//!
//! The variants mirror the gateway's user-visible error taxonomy. `Display`
//! strings are user-safe: they never carry upstream payloads or credential
//! material. Internal detail goes to the log at the point of failure.

use std::io;

use thiserror::Error;

/// Result type alias for the SARK gateway
pub type Result<T> = std::result::Result<T, Error>;

/// SARK gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Wrong password, expired or invalid assertion, bad API key.
    ///
    /// Deliberately carries no detail: the message must be identical whether
    /// the identity does not exist or the credential was wrong.
    #[error("Invalid credentials")]
    InvalidCredential,

    /// Authenticated but not permitted
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// API key lacks one or more scopes required by the endpoint
    #[error("Insufficient scope: missing {missing:?}")]
    InsufficientScope {
        /// Scopes required but not granted
        missing: Vec<String>,
    },

    /// Access token failed signature or structural validation
    #[error("Token invalid")]
    TokenInvalid,

    /// Access token expired
    #[error("Token expired")]
    TokenExpired,

    /// Refresh-token reuse detected; the whole session chain is revoked
    #[error("Session compromised")]
    SessionCompromised,

    /// Token bucket exhausted
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the next token is available
        retry_after_secs: u64,
        /// Configured limit for the bucket
        limit: u32,
        /// Unix timestamp at which the bucket refills
        reset_at: u64,
    },

    /// Identity provider, rule engine, or SIEM destination not reachable
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Circuit breaker is open; the protected call was not attempted
    #[error("Circuit open for '{destination}', retry in {retry_after_ms}ms")]
    CircuitOpen {
        /// Destination guarded by the breaker
        destination: String,
        /// Milliseconds until a probe is allowed
        retry_after_ms: u64,
    },

    /// Configuration error (fatal at startup, 500 at runtime)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed policy input or API key shape
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Session not found or already revoked in a context that requires it
    #[error("Session not found")]
    SessionNotFound,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Machine-readable error code surfaced to the façade.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredential => "invalid_credential",
            Self::Forbidden(_) => "forbidden",
            Self::InsufficientScope { .. } => "insufficient_scope",
            Self::TokenInvalid => "token_invalid",
            Self::TokenExpired => "token_expired",
            Self::SessionCompromised => "session_compromised",
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Config(_) => "configuration_error",
            Self::InvalidInput(_) => "invalid_input",
            Self::SessionNotFound => "session_not_found",
            Self::Io(_) | Self::Json(_) | Self::Http(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for the façade layer.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidCredential
            | Self::TokenInvalid
            | Self::TokenExpired
            | Self::SessionCompromised => 401,
            Self::Forbidden(_) | Self::InsufficientScope { .. } => 403,
            Self::RateLimited { .. } => 429,
            Self::UpstreamUnavailable(_) | Self::CircuitOpen { .. } => 503,
            Self::InvalidInput(_) => 400,
            Self::SessionNotFound => 404,
            Self::Config(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Http(_)
            | Self::Internal(_) => 500,
        }
    }
}
