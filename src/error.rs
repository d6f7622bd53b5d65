// Error types for the flash-sale core
//
// Business rejections (sold out, duplicate, window closed) are outcomes, not
// errors; everything here is an infrastructure or data problem.
use std::fmt;

use crate::models::PersistedOrder;

/// Fast-store failures
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    Connection(String),
    Script(String),
    Protocol(String),
    Unsupported(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "Fast store connection error: {}", msg),
            Self::Script(msg) => write!(f, "Fast store script failed: {}", msg),
            Self::Protocol(msg) => write!(f, "Unexpected fast store reply: {}", msg),
            Self::Unsupported(msg) => write!(f, "Unsupported fast store operation: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            StoreError::Connection(err.to_string())
        } else if err.code() == Some("NOSCRIPT") || err.kind() == redis::ErrorKind::ResponseError {
            StoreError::Script(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// System-of-record failures
#[derive(Debug, Clone, PartialEq)]
pub enum RepoError {
    NotFound(u64),
    /// The (buyer, coupon) uniqueness constraint rejected the insert
    DuplicateOrder { existing: PersistedOrder },
    Unavailable(String),
    Corrupt(String),
    Invalid(String),
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "Record {} not found", id),
            Self::DuplicateOrder { existing } => write!(
                f,
                "Order already exists for buyer {} coupon {} (order {})",
                existing.buyer_id, existing.coupon_id, existing.order_id
            ),
            Self::Unavailable(msg) => write!(f, "System of record unavailable: {}", msg),
            Self::Corrupt(msg) => write!(f, "Corrupt record: {}", msg),
            Self::Invalid(msg) => write!(f, "Invalid request: {}", msg),
        }
    }
}

impl std::error::Error for RepoError {}

impl From<scylla::transport::errors::QueryError> for RepoError {
    fn from(err: scylla::transport::errors::QueryError) -> Self {
        RepoError::Unavailable(err.to_string())
    }
}

impl From<scylla::cql_to_rust::FromRowError> for RepoError {
    fn from(err: scylla::cql_to_rust::FromRowError) -> Self {
        RepoError::Corrupt(err.to_string())
    }
}

/// Error surfaced by the public operations of the crate
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    Store(StoreError),
    Repository(RepoError),
    Timeout(&'static str),
    Invalid(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "{}", e),
            Self::Repository(e) => write!(f, "{}", e),
            Self::Timeout(operation) => write!(f, "Operation timed out: {}", operation),
            Self::Invalid(msg) => write!(f, "Invalid request: {}", msg),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        CoreError::Store(err)
    }
}

impl From<RepoError> for CoreError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::Invalid(msg) => CoreError::Invalid(msg),
            other => CoreError::Repository(other),
        }
    }
}

// Error code mapping for API responses
impl CoreError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Store(StoreError::Connection(_)) => "STORE_UNAVAILABLE",
            Self::Store(_) => "STORE_ERROR",
            Self::Repository(RepoError::NotFound(_)) => "NOT_FOUND",
            Self::Repository(RepoError::DuplicateOrder { .. }) => "DUPLICATE_ORDER",
            Self::Repository(RepoError::Unavailable(_)) => "DB_UNAVAILABLE",
            Self::Repository(RepoError::Corrupt(_)) => "DATA_CORRUPTION",
            Self::Repository(RepoError::Invalid(_)) | Self::Invalid(_) => "INVALID_REQUEST",
            Self::Timeout(_) => "TIMEOUT",
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Connection(_))
                | Self::Repository(RepoError::Unavailable(_))
                | Self::Timeout(_)
        )
    }
}
