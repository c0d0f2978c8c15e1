//! Public API for the storage contract
//!
//! External modules should import from here rather than directly from
//! internal modules.

pub use crate::storage::error::{StorageError, StorageResult};
pub use crate::storage::memory::{MemoryStorage, MemoryStorageProvider};
pub use crate::storage::record::{
    FailedItem, FetchedRecord, ItemRecord, PersistOutcome, StorageHandle, StorageSnapshot,
};
pub use crate::storage::traits::{PersistStorage, StorageProvider};
