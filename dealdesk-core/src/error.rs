//! Error types for DealDesk operations

use thiserror::Error;

use crate::TableName;

/// Authentication and authorization failures. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Session expired")]
    SessionExpired,

    #[error("Not authenticated for {action}")]
    Unauthenticated { action: String },

    #[error("Permission denied on {table}: {reason}")]
    PermissionDenied { table: TableName, reason: String },
}

/// Input rejected before or by the backend. Surfaced to the user.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },
}

/// Network-level failures that may succeed on retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Backend unavailable with status {status}: {message}")]
    Unavailable { status: u16, message: String },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

/// Write rejected by the backend after the client already assumed success.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConflictError {
    #[error("Write to {table} row {id} rejected: {reason}")]
    WriteRejected {
        table: TableName,
        id: String,
        reason: String,
    },

    #[error("Row {id} in {table} was modified concurrently")]
    ConcurrentModification { table: TableName, id: String },
}

/// Query cache failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Fetch for {key} was superseded")]
    Cancelled { key: String },

    #[error("Cached value for {key} has unexpected shape: {reason}")]
    Deserialize { key: String, reason: String },

    #[error("Value could not be serialized: {reason}")]
    Serialize { reason: String },

    #[error("No fetcher registered for {key}")]
    MissingFetcher { key: String },

    #[error("Invalid mutation definition: {reason}")]
    InvalidMutation { reason: String },
}

/// Realtime channel failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("Subscribe to channel {channel} failed: {reason}")]
    SubscribeFailed { channel: String, reason: String },

    #[error("Channel {channel} closed")]
    ChannelClosed { channel: String },
}

/// Serverless function invocation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FunctionError {
    #[error("Function {function} failed with status {status}: {message}")]
    InvocationFailed {
        function: String,
        status: u16,
        message: String,
    },

    #[error("Function {function} returned an invalid response: {reason}")]
    InvalidResponse { function: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or DEALDESK_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Coarse classification used by retry and notification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    Validation,
    Transient,
    Conflict,
    Internal,
}

/// Master error type for all DealDesk errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DealDeskError {
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transient error: {0}")]
    Transient(#[from] TransportError),

    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    #[error("Function error: {0}")]
    Function(#[from] FunctionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Row {id} not found in {table}")]
    NotFound { table: TableName, id: String },
}

impl DealDeskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DealDeskError::Auth(_) => ErrorKind::Auth,
            DealDeskError::Validation(_) | DealDeskError::Config(_) => ErrorKind::Validation,
            DealDeskError::Transient(_) => ErrorKind::Transient,
            DealDeskError::Conflict(_) | DealDeskError::NotFound { .. } => ErrorKind::Conflict,
            DealDeskError::Realtime(RealtimeError::ChannelClosed { .. }) => ErrorKind::Transient,
            DealDeskError::Function(FunctionError::InvocationFailed { status, .. })
                if *status >= 500 =>
            {
                ErrorKind::Transient
            }
            DealDeskError::Cache(_)
            | DealDeskError::Realtime(_)
            | DealDeskError::Function(_) => ErrorKind::Internal,
        }
    }

    /// Only transient failures are worth another attempt, and only on reads.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Auth failures send the user back through sign-in.
    pub fn requires_reauth(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }
}

/// Result type alias for DealDesk operations.
pub type DealDeskResult<T> = Result<T, DealDeskError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialize {
            reason: e.to_string(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
