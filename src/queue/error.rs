//! Queue Error Types

use crate::core::sync::handle_mutex_poison;
use crate::queue::message::PersistId;
use crate::storage::error::StorageError;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Queue '{client_id}' cannot end the message stream: no request was ever submitted")]
    EmptyEndOfMessage { client_id: String },

    #[error("Queue '{client_id}' belongs to user '{expected}', not '{actual}'")]
    UserMismatch {
        client_id: String,
        expected: String,
        actual: String,
    },

    #[error("Flush of queue '{client_id}' timed out after {timeout_ms}ms waiting for {waiting_for}")]
    FlushTimeout {
        client_id: String,
        timeout_ms: u128,
        waiting_for: String,
    },

    #[error("Flush declared {declared} requests but {submitted} are waiting to be committed")]
    FlushCountExceeded { declared: u64, submitted: u64 },

    #[error("Persistence failed for queue '{client_id}': {source}")]
    Persistence {
        client_id: String,
        #[source]
        source: StorageError,
    },

    #[error("Item {persist_id} exceeded the resend limit of {limit}")]
    ResendLimitExceeded { persist_id: PersistId, limit: u32 },

    #[error("Queue '{client_id}' is closed")]
    QueueClosed { client_id: String },

    #[error("Synchronisation error: {message}")]
    Synchronisation { message: String },

    #[error("Operation failed: {message}")]
    OperationFailed { message: String },
}

impl crate::core::error_handling::ContextualError for QueueError {
    fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            QueueError::InvalidArgument { .. }
                | QueueError::EmptyEndOfMessage { .. }
                | QueueError::UserMismatch { .. }
                | QueueError::FlushCountExceeded { .. }
                | QueueError::FlushTimeout { .. }
        )
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            QueueError::InvalidArgument { message } => Some(message),
            QueueError::EmptyEndOfMessage { .. } => {
                Some("End of message requested on a queue that never received a request")
            }
            QueueError::UserMismatch { .. } => Some("Client id is owned by another user"),
            QueueError::FlushCountExceeded { .. } => {
                Some("More requests were submitted than the flush declared")
            }
            QueueError::FlushTimeout { .. } => Some("Timed out waiting for requests to arrive"),
            _ => None,
        }
    }
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> QueueResult<MutexGuard<'_, T>> {
    handle_mutex_poison(mutex.lock(), |message| QueueError::Synchronisation { message })
}
