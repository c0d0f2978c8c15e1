//! Cross-queue dispatcher
//!
//! Session-wide prefetch cache in front of every client queue. Workers pull
//! from one shared FIFO; the dispatcher keeps at most one outstanding pull per
//! queue and parks queues while the cache sits at the high watermark.
//!
//! The dispatcher also owns the correlation tables. A quick-cached request is
//! handed to a worker before the backend has assigned it a handle, so the
//! same persist id can come back from the backend, or be answered, before
//! its token resolves. Both tables live under one lock so that checking for
//! a parked response and parking one are a single step.

use crate::core::sync::lock_recovering;
use crate::queue::error::{QueueError, QueueResult};
use crate::queue::item::QueueItem;
use crate::queue::message::{FaultCode, Message, PersistId};
use crate::queue::settings::DispatcherSettings;
use crate::queue::token::AsyncToken;
use crate::queue::traits::BrokerQueue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;

#[derive(Default)]
struct PrefetchState {
    cache: VecDeque<QueueItem>,
    waiters: VecDeque<oneshot::Sender<QueueItem>>,
    parked: VecDeque<Arc<dyn BrokerQueue>>,
    pulling: HashSet<String>,
}

struct ParkedResponse {
    message: Message,
    request: QueueItem,
}

#[derive(Default)]
struct CorrelationTables {
    pending: HashMap<PersistId, Arc<AsyncToken>>,
    early: HashMap<PersistId, ParkedResponse>,
}

enum Arrival {
    Deliver(QueueItem),
    Duplicate,
    Resolved(ParkedResponse),
}

enum ResponseRoute {
    Now(Message, QueueItem),
    Parked,
    AlreadyParked,
}

pub struct CrossQueueDispatcher {
    settings: DispatcherSettings,
    self_ref: Weak<CrossQueueDispatcher>,
    prefetch: Mutex<PrefetchState>,
    tables: Mutex<CorrelationTables>,
    closed: AtomicBool,
    reemitted: AtomicU64,
    duplicates_discarded: AtomicU64,
}

impl CrossQueueDispatcher {
    pub fn new(settings: DispatcherSettings) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            settings,
            self_ref: self_ref.clone(),
            prefetch: Mutex::new(PrefetchState::default()),
            tables: Mutex::new(CorrelationTables::default()),
            closed: AtomicBool::new(false),
            reemitted: AtomicU64::new(0),
            duplicates_discarded: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Start pulling a queue, or park it if the cache is already full
    pub fn register_queue(&self, queue: Arc<dyn BrokerQueue>) {
        log::debug!("Dispatcher registering queue '{}'", queue.client_id());
        self.schedule_pull(queue);
    }

    /// Next request for a worker; `None` once the dispatcher is closed
    pub async fn get_request(&self) -> Option<QueueItem> {
        let receiver = {
            let mut state = lock_recovering(self.prefetch.lock(), "dispatcher prefetch");
            if self.is_closed() {
                return None;
            }
            if let Some(item) = state.cache.pop_front() {
                drop(state);
                self.after_take();
                self.arm_reemission(&item);
                return Some(item);
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        let mut pull = PendingPull {
            receiver: Some(receiver),
            dispatcher: self.self_ref.clone(),
        };
        let item = pull.wait().await?;
        self.after_take();
        self.arm_reemission(&item);
        Some(item)
    }

    /// Worker answer for `request`, or a redispatch when `message` is `None`
    pub async fn put_response(&self, message: Option<Message>, request: QueueItem) -> QueueResult<()> {
        let Some(message) = message else {
            return self.route(None, request).await;
        };

        let persist_id = request.persist_id();
        let decision = {
            let mut tables = lock_recovering(self.tables.lock(), "dispatcher correlation");
            let token = request.async_token();
            if !token.is_resolved() {
                if let Some(handle) = tables.pending.get(&persist_id).and_then(|t| t.handle()) {
                    token.resolve(handle);
                }
            }

            if token.is_resolved() {
                tables.pending.remove(&persist_id);
                ResponseRoute::Now(message, request)
            } else if tables.early.contains_key(&persist_id) {
                ResponseRoute::AlreadyParked
            } else {
                tables
                    .pending
                    .entry(persist_id)
                    .or_insert_with(|| Arc::clone(token));
                tables
                    .early
                    .insert(persist_id, ParkedResponse { message, request });
                ResponseRoute::Parked
            }
        };

        match decision {
            ResponseRoute::Now(message, request) => self.route(Some(message), request).await,
            ResponseRoute::Parked => {
                log::debug!("Parked early response for {} until its handle is known", persist_id);
                Ok(())
            }
            ResponseRoute::AlreadyParked => {
                log::debug!("Response for {} already parked, dropping the later one", persist_id);
                Ok(())
            }
        }
    }

    /// Requests copied by a queue before its first flush
    pub async fn offer_quick_cache(&self, items: Vec<QueueItem>) {
        for item in items {
            self.accept(item).await;
        }
    }

    pub fn reemitted_count(&self) -> u64 {
        self.reemitted.load(Ordering::Acquire)
    }

    pub fn duplicates_discarded(&self) -> u64 {
        self.duplicates_discarded.load(Ordering::Acquire)
    }

    pub fn cached_count(&self) -> usize {
        lock_recovering(self.prefetch.lock(), "dispatcher prefetch").cache.len()
    }

    pub fn parked_queue_count(&self) -> usize {
        lock_recovering(self.prefetch.lock(), "dispatcher prefetch").parked.len()
    }

    pub fn pending_token_count(&self) -> usize {
        lock_recovering(self.tables.lock(), "dispatcher correlation").pending.len()
    }

    pub fn early_response_count(&self) -> usize {
        lock_recovering(self.tables.lock(), "dispatcher correlation").early.len()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut state = lock_recovering(self.prefetch.lock(), "dispatcher prefetch");
            let dropped = state.cache.len();
            state.cache.clear();
            state.waiters.clear();
            state.parked.clear();
            state.pulling.clear();
            dropped
        };
        let unanswered = {
            let mut tables = lock_recovering(self.tables.lock(), "dispatcher correlation");
            let unanswered = tables.early.len();
            tables.pending.clear();
            tables.early.clear();
            unanswered
        };
        log::info!(
            "Dispatcher closed: {} reemitted, {} duplicates discarded, {} cached and {} parked responses dropped",
            self.reemitted_count(),
            self.duplicates_discarded(),
            dropped,
            unanswered
        );
    }

    fn schedule_pull(&self, queue: Arc<dyn BrokerQueue>) {
        if self.is_closed() {
            return;
        }
        let client_id = queue.client_id().to_string();
        {
            let mut state = lock_recovering(self.prefetch.lock(), "dispatcher prefetch");
            if state.pulling.contains(&client_id) {
                return;
            }
            if state.cache.len() >= self.settings.high_watermark {
                if !state.parked.iter().any(|q| q.client_id() == client_id) {
                    log::trace!("Cache full, parking queue '{}'", client_id);
                    state.parked.push_back(queue);
                }
                return;
            }
            state.pulling.insert(client_id);
        }

        let dispatcher = self.self_ref.clone();
        tokio::spawn(async move {
            let result = queue.get_request().await;
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.complete_pull(queue, result).await;
            }
        });
    }

    async fn complete_pull(&self, queue: Arc<dyn BrokerQueue>, result: QueueResult<Option<QueueItem>>) {
        lock_recovering(self.prefetch.lock(), "dispatcher prefetch")
            .pulling
            .remove(queue.client_id());

        match result {
            Ok(Some(item)) => {
                self.accept(item).await;
                self.schedule_pull(queue);
            }
            Ok(None) => {
                log::debug!("Queue '{}' closed, no longer pulled", queue.client_id());
            }
            Err(e) => {
                log::warn!("Pull from queue '{}' failed, dropping it: {}", queue.client_id(), e);
            }
        }
    }

    async fn accept(&self, item: QueueItem) {
        match self.correlate_arrival(item) {
            Arrival::Deliver(item) => self.deliver(item, false),
            Arrival::Duplicate => {}
            Arrival::Resolved(parked) => {
                let persist_id = parked.request.persist_id();
                if let Err(e) = self.route(Some(parked.message), parked.request).await {
                    log::warn!("Parked response for {} could not be submitted: {}", persist_id, e);
                }
            }
        }
    }

    fn correlate_arrival(&self, item: QueueItem) -> Arrival {
        let persist_id = item.persist_id();
        let mut tables = lock_recovering(self.tables.lock(), "dispatcher correlation");

        let Some(pending) = tables.pending.get(&persist_id).cloned() else {
            if !item.async_token().is_resolved() {
                tables
                    .pending
                    .insert(persist_id, Arc::clone(item.async_token()));
            }
            return Arrival::Deliver(item);
        };

        if let Some(handle) = item.async_token().handle() {
            if pending.resolve(handle) {
                log::debug!("Handle {} now known for {}", handle, persist_id);
            }
        }

        if pending.is_resolved() {
            if let Some(parked) = tables.early.remove(&persist_id) {
                tables.pending.remove(&persist_id);
                log::debug!("Submitting parked response for {}", persist_id);
                return Arrival::Resolved(parked);
            }
        }

        if item.dispatch_number() == 0 {
            self.duplicates_discarded.fetch_add(1, Ordering::AcqRel);
            log::trace!("Discarding duplicate dispatch of {}", persist_id);
            return Arrival::Duplicate;
        }
        Arrival::Deliver(item)
    }

    fn deliver(&self, item: QueueItem, front: bool) {
        let mut state = lock_recovering(self.prefetch.lock(), "dispatcher prefetch");
        let mut item = item;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return,
                Err(returned) => item = returned,
            }
        }
        if front {
            state.cache.push_front(item);
        } else {
            state.cache.push_back(item);
        }
    }

    fn after_take(&self) {
        let parked: Vec<_> = {
            let mut state = lock_recovering(self.prefetch.lock(), "dispatcher prefetch");
            if state.cache.len() < self.settings.low_watermark {
                state.parked.drain(..).collect()
            } else {
                Vec::new()
            }
        };
        for queue in parked {
            self.schedule_pull(queue);
        }
    }

    fn arm_reemission(&self, item: &QueueItem) {
        if !self.settings.reemission_enabled() {
            return;
        }
        let dispatcher = self.self_ref.clone();
        let item = item.clone();
        let delay = self.settings.reemit_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.reemit(item).await;
            }
        });
    }

    async fn reemit(&self, item: QueueItem) {
        if self.is_closed() || !item.reemit_token().is_available() {
            return;
        }

        let limit = self.settings.resend_limit;
        let persist_id = item.persist_id();
        if item.try_count() < limit {
            let clone = item.reemit_clone();
            self.reemitted.fetch_add(1, Ordering::AcqRel);
            log::info!(
                "No response for {} after {:?}, reemitting (try {} of {})",
                persist_id,
                self.settings.reemit_timeout(),
                clone.try_count(),
                limit
            );
            if let Err(e) = self.route(None, clone).await {
                log::warn!("Reemission of {} failed: {}", persist_id, e);
            }
        } else {
            log::warn!(
                "No response for {} after {} attempts, answering with a fault",
                persist_id,
                item.try_count() + 1
            );
            let fault = Message::fault_for(
                item.message(),
                FaultCode::RetryLimitExceeded,
                &format!("no response after {} attempts", item.try_count() + 1),
            );
            if let Err(e) = self.put_response(Some(fault), item).await {
                log::warn!("Fault response for {} failed: {}", persist_id, e);
            }
        }
    }

    async fn route(&self, message: Option<Message>, request: QueueItem) -> QueueResult<()> {
        let Some(owner) = request.async_token().queue() else {
            return Err(QueueError::QueueClosed {
                client_id: request.async_token().client_id().to_string(),
            });
        };
        owner.put_response(message, request).await
    }
}

/// Worker pull waiting on the prefetch cache
///
/// An item sent to a pull that is dropped before receiving it goes back to
/// the front of the cache.
struct PendingPull {
    receiver: Option<oneshot::Receiver<QueueItem>>,
    dispatcher: Weak<CrossQueueDispatcher>,
}

impl PendingPull {
    async fn wait(&mut self) -> Option<QueueItem> {
        let receiver = self.receiver.as_mut()?;
        let item = receiver.await.ok();
        self.receiver = None;
        item
    }
}

impl Drop for PendingPull {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        receiver.close();
        if let Ok(item) = receiver.try_recv() {
            if let Some(dispatcher) = self.dispatcher.upgrade() {
                dispatcher.deliver(item, true);
            }
        }
    }
}
