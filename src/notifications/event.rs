//! Event types for queue notifications

use crate::queue::error::QueueError;
use crate::queue::message::PersistId;
use std::time::SystemTime;

/// Flow-control transitions raised to the surrounding broker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum LifecycleEventType {
    AllRequestsDispatched,
    AllRequestsProcessed,
    AllResponsesDispatched,
    AvailableResponsesDispatched,
}

#[derive(Clone, Debug)]
pub struct LifecycleEvent {
    pub event_type: LifecycleEventType,
    pub timestamp: SystemTime,
    pub client_id: String,
}

impl LifecycleEvent {
    pub fn new(event_type: LifecycleEventType, client_id: impl Into<String>) -> Self {
        Self {
            event_type,
            timestamp: SystemTime::now(),
            client_id: client_id.into(),
        }
    }
}

/// Background failure raised on the exception or fatal-exception channel
#[derive(Clone, Debug)]
pub struct ExceptionEvent {
    pub timestamp: SystemTime,
    pub client_id: String,
    pub error: QueueError,
    /// Items affected by the failure, when known
    pub persist_ids: Vec<PersistId>,
}

impl ExceptionEvent {
    pub fn new(client_id: impl Into<String>, error: QueueError) -> Self {
        Self {
            timestamp: SystemTime::now(),
            client_id: client_id.into(),
            error,
            persist_ids: Vec::new(),
        }
    }

    pub fn with_items(mut self, persist_ids: Vec<PersistId>) -> Self {
        self.persist_ids = persist_ids;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResponsesPersistedEvent {
    pub client_id: String,
    pub count: usize,
    pub fault_count: usize,
}

#[derive(Clone, Debug)]
pub enum Event {
    Lifecycle(LifecycleEvent),
    Exception(ExceptionEvent),
    Fatal(ExceptionEvent),
    ResponsesPersisted(ResponsesPersistedEvent),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Lifecycle(_) => "Lifecycle",
            Event::Exception(_) => "Exception",
            Event::Fatal(_) => "Fatal",
            Event::ResponsesPersisted(_) => "ResponsesPersisted",
        }
    }

    pub fn lifecycle_type(&self) -> Option<LifecycleEventType> {
        match self {
            Event::Lifecycle(event) => Some(event.event_type),
            _ => None,
        }
    }
}

/// Event filter for subscribers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventFilter {
    LifecycleOnly,
    ErrorsOnly,
    ResponsesOnly,
    All,
}

impl EventFilter {
    pub fn accepts(&self, event: &Event) -> bool {
        matches!(
            (self, event),
            (EventFilter::LifecycleOnly, Event::Lifecycle(_))
                | (EventFilter::ErrorsOnly, Event::Exception(_))
                | (EventFilter::ErrorsOnly, Event::Fatal(_))
                | (EventFilter::ResponsesOnly, Event::ResponsesPersisted(_))
                | (EventFilter::All, _)
        )
    }
}
