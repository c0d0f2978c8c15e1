//! Storage contract consumed by the queue engine
//!
//! The engine never touches a storage format. It batches [`ItemRecord`]s into
//! a [`PersistStorage`] implementation, commits or aborts the staged batch,
//! and pulls records back out together with the backend's opaque handle.
//! [`MemoryStorage`] is the in-process backend used for non-durable sessions,
//! the simulation binary and the test-suite.
//!
//! [`ItemRecord`]: record::ItemRecord
//! [`PersistStorage`]: traits::PersistStorage
//! [`MemoryStorage`]: memory::MemoryStorage

pub(crate) mod error;
pub(crate) mod memory;
pub(crate) mod record;
pub(crate) mod traits;

pub mod api;
