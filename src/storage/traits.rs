//! Traits for the storage contract

use crate::storage::error::StorageResult;
use crate::storage::record::{FetchedRecord, ItemRecord, PersistOutcome, StorageSnapshot};
use crate::queue::message::PersistId;
use async_trait::async_trait;
use std::sync::Arc;

/// Backend persisting one client's requests and responses
///
/// Requests are staged by `put_requests` and become fetchable only after
/// `commit_request`; `abort_request` drops whatever is staged. Persisting a
/// response retires the request named by its `peer_persist_id`.
///
/// Batch puts report two failure levels: an `Err` means nothing in the batch
/// was stored, an `Ok` outcome lists the individual items that were not.
#[async_trait]
pub trait PersistStorage: Send + Sync {
    async fn put_requests(&self, records: Vec<ItemRecord>) -> StorageResult<PersistOutcome>;

    async fn put_request(&self, record: ItemRecord) -> StorageResult<PersistOutcome> {
        self.put_requests(vec![record]).await
    }

    async fn put_responses(&self, records: Vec<ItemRecord>) -> StorageResult<PersistOutcome>;

    async fn put_response(&self, record: ItemRecord) -> StorageResult<PersistOutcome> {
        self.put_responses(vec![record]).await
    }

    /// Next committed request not currently handed out
    async fn get_request(&self) -> StorageResult<Option<FetchedRecord>>;

    /// Next persisted response not yet fetched or acknowledged
    async fn get_response(&self) -> StorageResult<Option<FetchedRecord>>;

    async fn commit_request(&self) -> StorageResult<()>;

    async fn abort_request(&self) -> StorageResult<()>;

    async fn mark_end_of_message(&self) -> StorageResult<()>;

    /// Acknowledge a fetched response; `success == false` returns it to the cursor
    async fn ack_response(&self, persist_id: PersistId, success: bool) -> StorageResult<()>;

    /// Make every unacknowledged response fetchable again
    async fn reset_response_cursor(&self) -> StorageResult<()>;

    fn all_requests_count(&self) -> u64;

    /// Committed requests not yet answered
    fn requests_count(&self) -> u64;

    fn responses_count(&self) -> u64;

    fn failed_requests_count(&self) -> u64;

    fn eom_received(&self) -> bool;

    fn is_new_created(&self) -> bool;

    fn is_in_memory(&self) -> bool;

    async fn close(&self) -> StorageResult<StorageSnapshot>;
}

/// Opens the backend for one client of one session
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn open(&self, session_id: &str, client_id: &str)
        -> StorageResult<Arc<dyn PersistStorage>>;
}
