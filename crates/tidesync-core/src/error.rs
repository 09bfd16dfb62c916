use std::path::PathBuf;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Error codes the object store uses for transient conditions
const TRANSIENT_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "TooManyRequests",
    "ServiceUnavailable",
    "RequestTimeout",
    "RequestTimeoutException",
];

/// Failure of a single remote-store call, classified for retry
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist. Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Service-level error carrying an error code and HTTP status
    #[error("{code} (HTTP {status}): {message}")]
    Api {
        code: String,
        status: u16,
        message: String,
    },

    #[error("network timeout: {0}")]
    Timeout(String),

    #[error("unexpected end of stream: {0}")]
    UnexpectedEof(String),

    /// Backend flagged the failure as temporary without a more specific code
    #[error("temporary failure: {0}")]
    Temporary(String),

    /// Client-side validation failure. Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Other(String),

    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn api(code: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        StoreError::Api {
            code: code.into(),
            status,
            message: message.into(),
        }
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Api { code, status, .. } => {
                TRANSIENT_CODES.contains(&code.as_str()) || (500..600).contains(status)
            }
            StoreError::Timeout(_) | StoreError::UnexpectedEof(_) | StoreError::Temporary(_) => {
                true
            }
            StoreError::NotFound(_)
            | StoreError::InvalidRequest(_)
            | StoreError::Other(_)
            | StoreError::RetryExhausted { .. }
            | StoreError::Cancelled => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, StoreError::RetryExhausted { .. })
    }
}

/// Why a single plan item could not be applied
#[derive(Debug, Error)]
pub enum ExecutionFailure {
    #[error("reading {}: {source}", path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Remote(#[from] StoreError),

    #[error("{0}")]
    Rejected(String),
}

/// Stage-level errors of a sync run
#[derive(Debug, Error)]
pub enum SyncError {
    /// Directory unreadable (permission errors are skipped, not reported)
    #[error("scanning {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("listing {location}: {source}")]
    List {
        location: String,
        #[source]
        source: StoreError,
    },

    #[error("fingerprinting {}: {source}", path.display())]
    LocalFingerprint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fetching remote fingerprint for {key}: {source}")]
    RemoteFingerprint {
        key: String,
        #[source]
        source: StoreError,
    },

    /// Per-item failure, recorded in the execution result
    #[error("{action} {key}: {source}")]
    Execution {
        action: &'static str,
        key: String,
        #[source]
        source: ExecutionFailure,
    },

    #[error("invalid exclude pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid remote location: {0}")]
    InvalidLocation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
