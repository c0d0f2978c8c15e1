//! Records exchanged with storage backends

use crate::queue::message::{Message, PersistId, RequestContext};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque backend handle identifying a stored item
///
/// Backends assign handles only once an item is durably stored and fetched
/// back; until then the engine knows an item by its persist id alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageHandle(pub u64);

impl fmt::Display for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Serialisable form of a queue item as handed to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub persist_id: PersistId,
    pub message: Message,
    pub context: RequestContext,
    pub dispatch_number: u32,
    pub try_count: u32,
    /// Set on responses: the request this response retires
    pub peer_persist_id: Option<PersistId>,
}

impl ItemRecord {
    pub fn is_fault(&self) -> bool {
        self.message.is_fault()
    }
}

/// A record pulled back out of a backend together with its handle
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub record: ItemRecord,
    pub handle: StorageHandle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedItem {
    pub persist_id: PersistId,
    pub reason: String,
}

/// Per-item result of a batch put
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistOutcome {
    pub failed: Vec<FailedItem>,
}

impl PersistOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn has_failed(&self, persist_id: &PersistId) -> bool {
        self.failed.iter().any(|item| &item.persist_id == persist_id)
    }
}

/// Final counters reported by a backend when it closes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageSnapshot {
    pub all_requests: u64,
    pub pending_requests: u64,
    pub responses: u64,
    pub failed_requests: u64,
    pub eom_received: bool,
}
