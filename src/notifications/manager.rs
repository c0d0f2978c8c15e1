//! NotificationManager implementation

use crate::core::sync::{handle_mutex_poison, lock_recovering};
use crate::notifications::error::NotificationError;
use crate::notifications::event::{Event, EventFilter};
use crate::notifications::traits::{StatisticsSnapshot, SubscriberStatistics};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub type EventReceiver = UnboundedReceiver<Event>;

struct SubscriberInfo {
    filter: EventFilter,
    source: String,
    sender: UnboundedSender<Event>,
    statistics: SubscriberStatistics,
}

/// Per-queue event fan-out
///
/// Publishing is synchronous so that the engine can raise events from inside
/// its own state transitions without awaiting. Subscribers whose receiver has
/// been dropped are pruned on the next publish.
pub struct NotificationManager {
    owner: String,
    subscribers: Mutex<HashMap<String, SubscriberInfo>>,
}

impl NotificationManager {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(
        &self,
        subscriber_id: String,
        filter: EventFilter,
        source: String,
    ) -> Result<EventReceiver, NotificationError> {
        let (sender, receiver) = unbounded_channel();

        let subscriber_info = SubscriberInfo {
            filter,
            source: source.clone(),
            sender,
            statistics: SubscriberStatistics::new(),
        };

        let mut subscribers = handle_mutex_poison(self.subscribers.lock(), |message| {
            NotificationError::Synchronisation(message)
        })?;
        // Warn if overwriting existing subscriber
        if let Some(existing) = subscribers.insert(subscriber_id.clone(), subscriber_info) {
            log::warn!(
                "{}: subscriber '{}' replaced existing subscription (source: {} -> {})",
                self.owner,
                subscriber_id,
                existing.source,
                source
            );
        }

        Ok(receiver)
    }

    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        lock_recovering(self.subscribers.lock(), "notification unsubscribe")
            .remove(subscriber_id)
            .is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        lock_recovering(self.subscribers.lock(), "notification subscriber count").len()
    }

    pub fn has_subscriber(&self, subscriber_id: &str) -> bool {
        lock_recovering(self.subscribers.lock(), "notification lookup").contains_key(subscriber_id)
    }

    pub fn subscriber_statistics(&self, subscriber_id: &str) -> Option<StatisticsSnapshot> {
        let subscribers = lock_recovering(self.subscribers.lock(), "notification statistics");
        subscribers
            .get(subscriber_id)
            .map(|info| info.statistics.snapshot(&info.source))
    }

    pub fn publish(&self, event: Event) -> Result<(), NotificationError> {
        let mut subscribers = handle_mutex_poison(self.subscribers.lock(), |message| {
            NotificationError::Synchronisation(message)
        })?;
        let mut failed_subscribers = Vec::new();

        for (subscriber_id, subscriber_info) in subscribers.iter() {
            if !subscriber_info.filter.accepts(&event) {
                subscriber_info.statistics.record_filtered();
                continue;
            }

            if subscriber_info.sender.send(event.clone()).is_err() {
                // Channel is closed, mark for removal
                failed_subscribers.push(subscriber_id.clone());
            } else {
                subscriber_info.statistics.record_delivered();
            }
        }

        for subscriber_id in &failed_subscribers {
            subscribers.remove(subscriber_id);
        }

        if !failed_subscribers.is_empty() {
            return Err(NotificationError::PublishFailed {
                event_type: event.kind().to_string(),
                failed_subscribers,
            });
        }

        Ok(())
    }

    /// Drop every subscription, ending all receivers
    pub fn close(&self) {
        let mut subscribers = lock_recovering(self.subscribers.lock(), "notification close");
        if !subscribers.is_empty() {
            log::trace!(
                "{}: closing {} event subscriptions",
                self.owner,
                subscribers.len()
            );
        }
        subscribers.clear();
    }
}
