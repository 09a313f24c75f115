//! Error types for the gateway core

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// How an error should be treated by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Misuse of an API; fails immediately and is never retried
    Programming,
    /// Store unavailable, I/O or network trouble; retried with backoff
    Transient,
    /// The data or the peer rejected the work; recorded without retry
    Domain,
    /// Retry budget exhausted
    Permanent,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Schema mismatch for table '{table}': {reason}")]
    SchemaMismatch { table: String, reason: String },

    #[error("Invalid state transition for work item {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Duplicate key '{0}'")]
    DuplicateKey(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Missing channel: {0}")]
    MissingChannel(String),

    #[error("Inference rejected the request: {0}")]
    InferenceRejected(String),

    #[error("Inference reported an error: {0}")]
    InferenceFailed(String),

    #[error("Inference did not finish within {0} seconds")]
    InferenceTimeout(u64),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Create a new invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new store unavailable error
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// The class this error belongs to
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::InvalidArgument(_)
            | GatewayError::SchemaMismatch { .. }
            | GatewayError::InvalidTransition { .. }
            | GatewayError::DuplicateKey(_)
            | GatewayError::Serialization(_) => ErrorClass::Programming,

            GatewayError::StoreUnavailable(_)
            | GatewayError::Io(_)
            | GatewayError::Network(_)
            | GatewayError::Timeout(_)
            | GatewayError::Transfer(_) => ErrorClass::Transient,

            GatewayError::MalformedPayload(_)
            | GatewayError::MissingChannel(_)
            | GatewayError::InferenceRejected(_)
            | GatewayError::InferenceFailed(_)
            | GatewayError::InferenceTimeout(_) => ErrorClass::Domain,

            GatewayError::RetriesExhausted { .. } => ErrorClass::Permanent,
        }
    }

    /// Check if this error is worth retrying
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<dimse::DimseError> for GatewayError {
    fn from(err: dimse::DimseError) -> Self {
        use dimse::DimseError as D;
        match err {
            D::Config(msg) | D::InvalidAeTitle(msg) => GatewayError::InvalidArgument(msg),
            D::Network(e) => GatewayError::Network(e.to_string()),
            D::Timeout(msg) => GatewayError::Timeout(msg),
            D::DicomParsing(msg) | D::DicomObject(msg) => GatewayError::MalformedPayload(msg),
            D::UnsupportedTransferSyntax(uid) => {
                GatewayError::MalformedPayload(format!("unsupported transfer syntax {}", uid))
            }
            other if other.is_recoverable() => GatewayError::Network(other.to_string()),
            other => GatewayError::Transfer(other.to_string()),
        }
    }
}
