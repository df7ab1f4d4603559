//! Alerting Agent Error Hierarchy
//!
//! Errors are grouped by the collaborator that produced them: the registry
//! facade, the notification handlers and the lock coordinator. Only
//! configuration and unrecoverable startup errors are allowed to terminate
//! the process; everything else is logged and retried by the watch loops.

use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Settings could not be loaded or deserialized
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Settings were loaded but violate a validation rule
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Registry facade failures (transport, decoding, unexpected responses)
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Notification handler failures
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Cluster-wide lock failures
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Transient errors are retried with backoff; everything else is
    /// reported to the caller immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Registry(e) => e.is_transient(),
            Error::Lock(LockError::Registry { source, .. }) => source.is_transient(),
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Transport level failures (connection refused, reset, TLS)
    #[error("Registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status code from the registry API
    #[error("Registry returned status {status} for {path}")]
    UnexpectedStatus { path: String, status: u16 },

    /// Blocking query response carried no usable index header
    #[error("Missing or malformed X-Consul-Index header for {path}")]
    MissingIndex { path: String },

    /// Response body did not match the expected shape
    #[error("Failed to decode registry response: {0}")]
    Decode(String),

    /// The registry cluster has no elected leader
    #[error("Registry cluster has no leader")]
    NoLeader,

    /// Registry endpoint refused or could not serve the request
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// A single attempt exceeded its deadline
    #[error("Registry request timed out after {0:?}")]
    Timeout(Duration),

    /// Retry policy exhaustion
    #[error("Registry request failed after {attempts} attempts")]
    RetryExhausted { attempts: usize },
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Http(_)
            | RegistryError::NoLeader
            | RegistryError::Unavailable(_)
            | RegistryError::Timeout(_) => true,
            RegistryError::UnexpectedStatus { status, .. } => *status >= 500 || *status == 429,
            RegistryError::MissingIndex { .. }
            | RegistryError::Decode(_)
            | RegistryError::RetryExhausted { .. } => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler reported a delivery failure
    #[error("Handler {handler} failed: {reason}")]
    Failed { handler: String, reason: String },

    /// The handler did not finish within the dispatch timeout
    #[error("Handler {handler} timed out after {duration:?}")]
    Timeout { handler: String, duration: Duration },

    /// The handler panicked while delivering
    #[error("Handler {handler} panicked")]
    Panicked { handler: String },

    /// A service referenced a handler that is not configured
    #[error("Unknown handler: {0}")]
    Unknown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Registry failure while talking to the lock primitive
    #[error("Lock {key}: {source}")]
    Registry {
        key: String,
        #[source]
        source: RegistryError,
    },

    /// Renewal task could not be joined during release
    #[error("Lock {key} renewal task failed: {reason}")]
    Renewal { key: String, reason: String },
}
