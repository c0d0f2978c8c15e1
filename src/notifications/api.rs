//! Public API for queue notifications
//!
//! Every client queue owns one [`NotificationManager`]. Subscribers receive
//! exception, fatal-exception, responses-persisted and lifecycle events over
//! an unbounded channel, filtered by [`EventFilter`].
//! External modules should import from here rather than directly from internal modules.

pub use crate::notifications::event::{
    Event, EventFilter, ExceptionEvent, LifecycleEvent, LifecycleEventType,
    ResponsesPersistedEvent,
};

pub use crate::notifications::error::NotificationError;
pub use crate::notifications::manager::{EventReceiver, NotificationManager};

pub use crate::notifications::traits::{StatisticsSnapshot, SubscriberStatistics};
