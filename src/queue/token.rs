//! Correlation and reemission tokens

use crate::queue::message::PersistId;
use crate::queue::traits::BrokerQueue;
use crate::storage::record::StorageHandle;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{OnceLock, Weak};

/// Bridges an item's persist id to the backend's native handle
///
/// The handle stays unknown between the hand-off of a quick-cached item to a
/// worker and the backend confirming it; it is set at most once. Item clones
/// share one token, so resolving it through any copy is visible to all.
/// Dispatch and try counters belong to each item copy, not to the token.
#[derive(Debug)]
pub struct AsyncToken {
    persist_id: PersistId,
    handle: OnceLock<StorageHandle>,
    client_id: String,
    queue: Weak<dyn BrokerQueue>,
}

impl AsyncToken {
    pub fn new(
        persist_id: PersistId,
        client_id: impl Into<String>,
        queue: Weak<dyn BrokerQueue>,
    ) -> Self {
        Self {
            persist_id,
            handle: OnceLock::new(),
            client_id: client_id.into(),
            queue,
        }
    }

    pub fn resolved(
        persist_id: PersistId,
        handle: StorageHandle,
        client_id: impl Into<String>,
        queue: Weak<dyn BrokerQueue>,
    ) -> Self {
        let token = Self::new(persist_id, client_id, queue);
        let _ = token.handle.set(handle);
        token
    }

    /// Record the backend handle; returns false if one was already known
    pub fn resolve(&self, handle: StorageHandle) -> bool {
        self.handle.set(handle).is_ok()
    }

    pub fn is_resolved(&self) -> bool {
        self.handle.get().is_some()
    }

    pub fn handle(&self) -> Option<StorageHandle> {
        self.handle.get().copied()
    }

    pub fn persist_id(&self) -> PersistId {
        self.persist_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Engine owning the item, if it is still alive
    pub fn queue(&self) -> Option<std::sync::Arc<dyn BrokerQueue>> {
        self.queue.upgrade()
    }

    pub(crate) fn weak_queue(&self) -> Weak<dyn BrokerQueue> {
        Weak::clone(&self.queue)
    }
}

const AVAILABLE: u8 = 0;
const FINISHED: u8 = 1;

/// Single-use flag arbitrating the response-versus-timeout race
///
/// The original request and every reemitted clone share one token. Whoever
/// calls [`ReemitToken::finish`] first wins; later responders are discarded.
#[derive(Debug, Default)]
pub struct ReemitToken {
    state: AtomicU8,
}

impl ReemitToken {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(AVAILABLE),
        }
    }

    /// Transition available -> finished; true for exactly one caller
    pub fn finish(&self) -> bool {
        self.state
            .compare_exchange(AVAILABLE, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_available(&self) -> bool {
        self.state.load(Ordering::Acquire) == AVAILABLE
    }
}
