//! Error types for the authorization layer

use thiserror::Error;

/// Authorization layer errors
///
/// Pending states (identity loading, resolvers in flight) are not errors and never
/// appear here; see [`crate::engine::PendingCause`].
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Role or subscription lookup failed (transport or query)
    #[error("Lookup failed: {0}")]
    Lookup(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Bearer token missing, malformed, expired, or badly signed
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Data-tier authorization failure. Carries no reason on purpose.
    #[error("Forbidden")]
    Forbidden,

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;
