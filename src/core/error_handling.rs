//! Generic error handling utilities
//!
//! Provides unified error handling across the queue and storage error types
//! while keeping domain-specific logging patterns.

/// Trait for errors that can distinguish between user-actionable and system errors
///
/// Usage errors raised back to a client (flushing an empty queue with
/// end-of-message, a user-name mismatch) are user-actionable. Backend failures
/// and synchronisation faults are system errors.
///
/// When `is_user_actionable()` returns `true`, `user_message()` should return
/// `Some(message)`. When it returns `false`, `user_message()` returns `None`.
pub trait ContextualError: std::error::Error {
    /// Returns true if this error carries a message the caller can act on
    fn is_user_actionable(&self) -> bool;

    /// Returns the specific user message if this is a user-actionable error
    fn user_message(&self) -> Option<&str>;
}

/// Log errors with appropriate detail level based on error specificity
///
/// # Examples
/// ```rust,no_run
/// # use brokerqueue::core::error_handling::log_error_with_context;
/// # use brokerqueue::queue::api::QueueError;
/// let err = QueueError::EmptyEndOfMessage {
///     client_id: "client-a".to_string(),
/// };
/// log_error_with_context(&err, "Flushing client queue");
/// ```
pub fn log_error_with_context<E: ContextualError + std::fmt::Display + std::fmt::Debug>(
    error: &E,
    operation_context: &str,
) {
    if error.is_user_actionable() {
        if let Some(user_msg) = error.user_message() {
            log::error!("FATAL: {}", user_msg);
        } else {
            log::error!("FATAL: {}", operation_context);
        }
    } else {
        log::error!("FATAL: {}", operation_context);
    }
    log::debug!("DETAIL: {}", error);
    log::debug!("DEBUG_DETAILS: {:?}", error);
}
