//! Error types for quota operations.
//!
//! Errors fall into three groups: configuration errors raised while building
//! or validating a bucket, storage errors raised by the counter store, and
//! internal-consistency errors raised when bucket bookkeeping is broken.

use thiserror::Error;

/// Result type for quota operations.
pub type Result<T> = std::result::Result<T, QuotaError>;

/// Main error type for quota operations.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// Counter store error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An asynchronous distributed bucket is missing its async state.
    #[error("async quota bucket state is empty for {0}")]
    AsyncStateMissing(String),

    /// A quota request body could not be decoded.
    #[error("Invalid quota request: {0}")]
    InvalidRequest(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QuotaError {
    /// Check whether this error comes from bucket configuration.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Get the configuration error, if any.
    pub fn as_config(&self) -> Option<&ConfigError> {
        match self {
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

/// Counter store errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Generic storage operation failed.
    #[error("{message}")]
    OperationFailed {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The store returned a value that is not a counter.
    #[error("Invalid counter value for {key}: {value}")]
    InvalidCounter {
        /// Store key that held the value.
        key: String,
        /// Raw value.
        value: String,
    },

    /// Failed to connect to the store.
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    /// Connection pool exhausted.
    #[error("Connection pool exhausted")]
    PoolExhausted,
}

impl StorageError {
    /// Create a new operation failed error.
    pub fn operation_failed(message: impl Into<String>, retryable: bool) -> Self {
        Self::OperationFailed {
            message: message.into(),
            retryable,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OperationFailed { retryable, .. } => *retryable,
            Self::ConnectionFailed(_) => true,
            Self::PoolExhausted => true,
            Self::InvalidCounter { .. } => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Time unit outside second, minute, hour, day, week and month.
    #[error("invalid quota time unit type: {0}")]
    InvalidTimeUnit(String),

    /// Quota kind outside calendar and rolling window.
    #[error("invalid quota type: {0}")]
    InvalidQuotaType(String),

    /// Unknown bucket mode name.
    #[error("unrecognized quota bucket type: {0}")]
    UnrecognizedBucketType(String),

    /// Both a sync interval and a sync message threshold were set.
    #[error(
        "sync interval ({sync_time_in_sec}s) and sync message count ({sync_message_count}) are mutually exclusive"
    )]
    ConflictingSyncSettings {
        /// Configured sync interval in seconds.
        sync_time_in_sec: i64,
        /// Configured sync message threshold.
        sync_message_count: i64,
    },

    /// Asynchronous counting was requested for a non-distributed bucket.
    #[error("a non-distributed quota bucket cannot be asynchronous")]
    AsyncRequiresDistributed,

    /// Interval must be positive.
    #[error("interval must be greater than 0, got {0}")]
    InvalidInterval(u32),

    /// Start time cannot be represented as a timestamp.
    #[error("invalid start time: {0}")]
    InvalidStartTime(i64),

    /// Window boundaries overflow the supported time range.
    #[error("quota window out of range: {0}")]
    PeriodOutOfRange(String),

    /// Missing required configuration.
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}
