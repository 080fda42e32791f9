// Debugger error types
//
// One error enum shared by the engine, the jobs and the target collaborators

use crate::types::TargetAddr;
use thiserror::Error;

pub type DebuggerResult<T> = Result<T, DebuggerError>;

#[derive(Debug, Error)]
pub enum DebuggerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already in progress: {0}")]
    AlreadyInProgress(String),

    #[error("Target I/O failure: {0}")]
    TargetIo(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Operation aborted")]
    Aborted,

    #[error("Bad address: {0:#x}")]
    BadAddress(TargetAddr),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Worker shut down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DebuggerError {
    /// Benign errors: the entity vanished or another party is already on it.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            DebuggerError::NotFound(_) | DebuggerError::AlreadyInProgress(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DebuggerError::BadAddress(0x1000);
        assert_eq!(err.to_string(), "Bad address: 0x1000");

        let err = DebuggerError::TargetIo("read failed".to_string());
        assert_eq!(err.to_string(), "Target I/O failure: read failed");
    }

    #[test]
    fn test_benign_errors() {
        assert!(DebuggerError::NotFound("thread".into()).is_benign());
        assert!(DebuggerError::AlreadyInProgress("job".into()).is_benign());
        assert!(!DebuggerError::Aborted.is_benign());
        assert!(!DebuggerError::OutOfMemory.is_benign());
    }
}
