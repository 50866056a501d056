//! Retrieval errors

use lightcore_state_sync::SyncError;
use lightcore_storage::{short_hex, Hash, StorageError};
use thiserror::Error;

/// Result type alias for retrieval operations
pub type Result<T> = std::result::Result<T, OdrError>;

/// Errors returned to retrieval callers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OdrError {
    /// The content could not be obtained from any peer, or arrived in a form
    /// that can never be used
    #[error("retrieval of {} failed: {reason}", short_hex(.hash))]
    RetrievalFailed {
        /// Hash that could not be retrieved
        hash: Hash,
        /// Why
        reason: String,
    },

    /// The caller's cancellation token fired
    #[error("retrieval canceled")]
    Canceled,

    /// The execution queue refused the request
    #[error("execution queue saturated")]
    QueueSaturated,

    /// Local store failure
    #[error("store failure: {0}")]
    StoreFailure(String),

    /// The coordinator was shut down
    #[error("retrieval coordinator closed")]
    Closed,

    /// Retrieved data did not decode into the requested type
    #[error("decode error: {0}")]
    Decode(String),

    /// Not called from within a tokio runtime
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The execution queue thread could not be started
    #[error("failed to start execution queue: {0}")]
    Spawn(String),
}

impl From<StorageError> for OdrError {
    fn from(e: StorageError) -> Self {
        OdrError::StoreFailure(e.to_string())
    }
}

impl From<SyncError> for OdrError {
    fn from(error: SyncError) -> Self {
        match error.root_cause() {
            SyncError::Store(reason) => OdrError::StoreFailure(reason.clone()),
            SyncError::CorruptResponse { hash, .. }
            | SyncError::NotRequested { hash }
            | SyncError::AlreadyProcessed { hash }
            | SyncError::NoPeerAvailable { hash, .. }
            | SyncError::DependencyFailed { hash, .. } => OdrError::RetrievalFailed {
                hash: *hash,
                reason: error.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_failure_maps_to_root_cause() {
        let error = SyncError::DependencyFailed {
            hash: [2u8; 32],
            cause: Box::new(SyncError::NoPeerAvailable {
                hash: [1u8; 32],
                attempts: 3,
            }),
        };
        match OdrError::from(error) {
            OdrError::RetrievalFailed { hash, reason } => {
                assert_eq!(hash, [1u8; 32]);
                assert!(reason.contains("no peer available"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let error = SyncError::DependencyFailed {
            hash: [2u8; 32],
            cause: Box::new(SyncError::Store("disk full".into())),
        };
        assert_eq!(
            OdrError::from(error),
            OdrError::StoreFailure("disk full".into())
        );
    }
}
