//! Test suites for the broker queue
//!
//! Organized by component: the client queue engine on its own, the
//! dispatcher in front of registered queues, the factory, and end-to-end
//! session scenarios.

mod engine;
mod factory;

use crate::notifications::api::{Event, EventReceiver};
use crate::queue::api::{ClientQueue, QueueSettings};
use crate::storage::api::MemoryStorage;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Settings with short timers so tests never sit on a default delay
pub(crate) fn fast_settings() -> QueueSettings {
    QueueSettings {
        request_batch_size: 1,
        response_batch_size: 1,
        quick_cache_capacity: 0,
        resend_limit: 2,
        response_idle_flush_ms: 20,
        retry_delay_ms: 1,
        durable: false,
    }
}

pub(crate) fn standalone_queue(
    client_id: &str,
    settings: QueueSettings,
) -> (Arc<ClientQueue>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new(client_id));
    let queue = ClientQueue::standalone(client_id, "alice", settings, storage.clone());
    (queue, storage)
}

pub(crate) async fn next_event(receiver: &mut EventReceiver) -> Event {
    match timeout(Duration::from_secs(2), receiver.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event channel closed"),
        Err(_) => panic!("timed out waiting for an event"),
    }
}

/// Poll `condition` until it holds, failing the test after two seconds
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}
