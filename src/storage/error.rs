//! Storage Error Types

use crate::queue::message::PersistId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Storage is closed")]
    Closed,

    #[error("Backend operation '{operation}' failed: {message}")]
    Backend { operation: String, message: String },

    #[error("{failed} of {total} items failed to persist")]
    ItemsFailed { failed: usize, total: usize },

    #[error("Unknown item: {persist_id}")]
    UnknownItem { persist_id: PersistId },

    #[error("Synchronisation error: {message}")]
    Synchronisation { message: String },
}

impl crate::core::error_handling::ContextualError for StorageError {
    fn is_user_actionable(&self) -> bool {
        false // Backend failures are never fixable by the submitting client
    }

    fn user_message(&self) -> Option<&str> {
        None
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
