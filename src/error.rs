use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone)]
pub enum ScanError {
    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Lease expired")]
    LeaseExpired,

    #[error("Resource exhausted")]
    ResourceExhausted,

    #[error("Worker {0} unreachable")]
    NodeUnreachable(u64),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Not the leader, current leader is replica {0:?}")]
    NotLeader(Option<u64>),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ScanError>;

/// Failure classification recorded on fault records and consulted by the
/// retry policy. Transient failures consume retry budget; lease expiry and
/// resource exhaustion do not; permanent failures are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Transient,
    Permanent,
    LeaseExpired,
    ResourceExhausted,
    NodeUnreachable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::LeaseExpired => write!(f, "leaseExpired"),
            ErrorKind::ResourceExhausted => write!(f, "resourceExhausted"),
            ErrorKind::NodeUnreachable => write!(f, "nodeUnreachable"),
        }
    }
}

impl ScanError {
    /// Classify an error for task-level failure handling. `None` means the
    /// error is not a task failure (e.g. a rejected submission).
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ScanError::Transient(_) => Some(ErrorKind::Transient),
            ScanError::Permanent(_) | ScanError::InvalidRequest(_) => Some(ErrorKind::Permanent),
            ScanError::LeaseExpired => Some(ErrorKind::LeaseExpired),
            ScanError::ResourceExhausted => Some(ErrorKind::ResourceExhausted),
            ScanError::NodeUnreachable(_) => Some(ErrorKind::NodeUnreachable),
            _ => None,
        }
    }
}
