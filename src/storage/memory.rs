//! In-process storage backend
//!
//! Keeps one client's records in memory: staged requests wait for a commit,
//! committed requests move from the available list to the in-flight map when
//! fetched, and responses sit behind a cursor until acknowledged. Handles are
//! handed out on fetch, which reproduces the "handle unknown until the backend
//! confirms" window the dispatcher has to correlate across.

use crate::core::sync::handle_mutex_poison;
use crate::queue::message::PersistId;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::record::{
    FailedItem, FetchedRecord, ItemRecord, PersistOutcome, StorageHandle, StorageSnapshot,
};
use crate::storage::traits::{PersistStorage, StorageProvider};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

struct StoredResponse {
    record: ItemRecord,
    fetched: bool,
    acked: bool,
}

#[derive(Default)]
struct MemoryState {
    closed: bool,
    staged: Vec<ItemRecord>,
    available: VecDeque<ItemRecord>,
    in_flight: HashMap<PersistId, ItemRecord>,
    answered: HashSet<PersistId>,
    responses: Vec<StoredResponse>,
    all_requests: u64,
    failed_requests: u64,
    eom: bool,
    next_handle: u64,
    fail_request_puts: u32,
    fail_response_items: u32,
}

impl MemoryState {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn assign_handle(&mut self) -> StorageHandle {
        self.next_handle += 1;
        StorageHandle(self.next_handle)
    }

    fn pending_requests(&self) -> u64 {
        (self.available.len() + self.in_flight.len()) as u64
    }
}

/// Memory-backed [`PersistStorage`] for one client
pub struct MemoryStorage {
    client_id: String,
    new_created: AtomicBool,
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            new_created: AtomicBool::new(true),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Make the next `count` request batches fail as a whole
    pub fn fail_next_request_puts(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_request_puts = count;
        }
    }

    /// Report the next `count` response items as individually failed
    pub fn fail_next_response_items(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_response_items = count;
        }
    }

    /// Number of requests staged but not yet committed
    pub fn staged_count(&self) -> usize {
        self.state.lock().map(|state| state.staged.len()).unwrap_or(0)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, MemoryState>> {
        handle_mutex_poison(self.state.lock(), |message| StorageError::Synchronisation {
            message,
        })
    }

    fn read<T: Default>(&self, reader: impl FnOnce(&MemoryState) -> T) -> T {
        self.state.lock().map(|state| reader(&state)).unwrap_or_default()
    }
}

#[async_trait]
impl PersistStorage for MemoryStorage {
    async fn put_requests(&self, records: Vec<ItemRecord>) -> StorageResult<PersistOutcome> {
        let mut state = self.lock()?;
        state.ensure_open()?;

        if state.fail_request_puts > 0 {
            state.fail_request_puts -= 1;
            return Err(StorageError::Backend {
                operation: "put_requests".to_string(),
                message: format!("injected failure for {} records", records.len()),
            });
        }

        log::trace!("{}: staging {} requests", self.client_id, records.len());
        for record in records {
            if !state.answered.contains(&record.persist_id) {
                state.staged.push(record);
            }
        }
        Ok(PersistOutcome::default())
    }

    async fn put_responses(&self, records: Vec<ItemRecord>) -> StorageResult<PersistOutcome> {
        let mut state = self.lock()?;
        state.ensure_open()?;

        let mut outcome = PersistOutcome::default();
        for record in records {
            if state.fail_response_items > 0 {
                state.fail_response_items -= 1;
                outcome.failed.push(FailedItem {
                    persist_id: record.persist_id,
                    reason: "injected item failure".to_string(),
                });
                continue;
            }

            if let Some(peer) = record.peer_persist_id {
                state.in_flight.remove(&peer);
                state.available.retain(|request| request.persist_id != peer);
                state.staged.retain(|request| request.persist_id != peer);
                state.answered.insert(peer);
            }
            if record.is_fault() {
                state.failed_requests += 1;
            }
            state.responses.push(StoredResponse {
                record,
                fetched: false,
                acked: false,
            });
        }
        Ok(outcome)
    }

    async fn get_request(&self) -> StorageResult<Option<FetchedRecord>> {
        let mut state = self.lock()?;
        state.ensure_open()?;

        let Some(record) = state.available.pop_front() else {
            return Ok(None);
        };
        let handle = state.assign_handle();
        state.in_flight.insert(record.persist_id, record.clone());
        Ok(Some(FetchedRecord { record, handle }))
    }

    async fn get_response(&self) -> StorageResult<Option<FetchedRecord>> {
        let mut state = self.lock()?;
        state.ensure_open()?;

        let Some(index) = state
            .responses
            .iter()
            .position(|response| !response.fetched && !response.acked)
        else {
            return Ok(None);
        };
        let handle = state.assign_handle();
        let response = &mut state.responses[index];
        response.fetched = true;
        Ok(Some(FetchedRecord {
            record: response.record.clone(),
            handle,
        }))
    }

    async fn commit_request(&self) -> StorageResult<()> {
        let mut state = self.lock()?;
        state.ensure_open()?;

        let staged = std::mem::take(&mut state.staged);
        state.all_requests += staged.len() as u64;
        state.available.extend(staged);
        Ok(())
    }

    async fn abort_request(&self) -> StorageResult<()> {
        let mut state = self.lock()?;
        let dropped = state.staged.len();
        state.staged.clear();
        if dropped > 0 {
            log::debug!("{}: aborted {} staged requests", self.client_id, dropped);
        }
        Ok(())
    }

    async fn mark_end_of_message(&self) -> StorageResult<()> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        state.eom = true;
        Ok(())
    }

    async fn ack_response(&self, persist_id: PersistId, success: bool) -> StorageResult<()> {
        let mut state = self.lock()?;
        state.ensure_open()?;

        let response = state
            .responses
            .iter_mut()
            .find(|response| response.record.persist_id == persist_id)
            .ok_or(StorageError::UnknownItem { persist_id })?;
        if success {
            response.acked = true;
        } else {
            response.fetched = false;
        }
        Ok(())
    }

    async fn reset_response_cursor(&self) -> StorageResult<()> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        for response in state.responses.iter_mut().filter(|r| !r.acked) {
            response.fetched = false;
        }
        Ok(())
    }

    fn all_requests_count(&self) -> u64 {
        self.read(|state| state.all_requests)
    }

    fn requests_count(&self) -> u64 {
        self.read(MemoryState::pending_requests)
    }

    fn responses_count(&self) -> u64 {
        self.read(|state| state.responses.len() as u64)
    }

    fn failed_requests_count(&self) -> u64 {
        self.read(|state| state.failed_requests)
    }

    fn eom_received(&self) -> bool {
        self.read(|state| state.eom)
    }

    fn is_new_created(&self) -> bool {
        self.new_created.load(Ordering::Acquire)
    }

    fn is_in_memory(&self) -> bool {
        true
    }

    async fn close(&self) -> StorageResult<StorageSnapshot> {
        let mut state = self.lock()?;
        state.closed = true;
        Ok(StorageSnapshot {
            all_requests: state.all_requests,
            pending_requests: state.pending_requests(),
            responses: state.responses.len() as u64,
            failed_requests: state.failed_requests,
            eom_received: state.eom,
        })
    }
}

/// Provider handing out one [`MemoryStorage`] per session and client
///
/// Opened stores stay reachable through [`MemoryStorageProvider::storage_for`]
/// so callers can inspect backend counters or inject faults.
#[derive(Default)]
pub struct MemoryStorageProvider {
    stores: Mutex<HashMap<(String, String), Arc<MemoryStorage>>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage_for(&self, session_id: &str, client_id: &str) -> Option<Arc<MemoryStorage>> {
        self.stores
            .lock()
            .ok()?
            .get(&(session_id.to_string(), client_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    async fn open(
        &self,
        session_id: &str,
        client_id: &str,
    ) -> StorageResult<Arc<dyn PersistStorage>> {
        let mut stores = handle_mutex_poison(self.stores.lock(), |message| {
            StorageError::Synchronisation { message }
        })?;
        let key = (session_id.to_string(), client_id.to_string());

        if let Some(existing) = stores.get(&key) {
            let reusable = existing.state.lock().map(|state| !state.closed).unwrap_or(false);
            if reusable {
                existing.new_created.store(false, Ordering::Release);
                let storage: Arc<dyn PersistStorage> = existing.clone();
                return Ok(storage);
            }
        }

        log::debug!("Opening in-memory storage for {}/{}", session_id, client_id);
        let storage = Arc::new(MemoryStorage::new(client_id));
        stores.insert(key, storage.clone());
        Ok(storage)
    }
}
