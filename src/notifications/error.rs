//! Error types for queue notifications

use std::fmt;

#[derive(Debug, Clone)]
pub enum NotificationError {
    PublishFailed {
        event_type: String,
        failed_subscribers: Vec<String>,
    },
    Synchronisation(String),
}

impl fmt::Display for NotificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationError::PublishFailed {
                event_type,
                failed_subscribers,
            } => {
                write!(
                    f,
                    "Failed to publish {} event to {} subscribers: {:?}",
                    event_type,
                    failed_subscribers.len(),
                    failed_subscribers
                )
            }
            NotificationError::Synchronisation(message) => {
                write!(f, "Notification synchronisation error: {message}")
            }
        }
    }
}

impl std::error::Error for NotificationError {}

impl crate::core::error_handling::ContextualError for NotificationError {
    fn is_user_actionable(&self) -> bool {
        false // All notification errors are system-level
    }

    fn user_message(&self) -> Option<&str> {
        None
    }
}
