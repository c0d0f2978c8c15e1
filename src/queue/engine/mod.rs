//! Client queue engine
//!
//! One [`ClientQueue`] owns the ordered request/response stream of one client
//! within a session. Requests are batched into the backend and released for
//! fetching by [`flush`](BrokerQueue::flush); responses are batched back,
//! retire their request and feed the registered response consumers.
//!
//! State is split across small std mutexes that are never held across an
//! await. Counters are atomics; waiting is done on tokio `Notify` signals,
//! always enabled before the condition is re-checked.

mod requests;
mod responses;

use crate::notifications::api::{
    Event, EventFilter, EventReceiver, ExceptionEvent, LifecycleEvent, LifecycleEventType,
    NotificationManager,
};
use crate::queue::dispatcher::CrossQueueDispatcher;
use crate::queue::error::{QueueError, QueueResult};
use crate::queue::factory::QueueFactory;
use crate::queue::item::QueueItem;
use crate::queue::message::{Message, PersistId, RequestContext};
use crate::queue::settings::QueueSettings;
use crate::queue::traits::{BrokerQueue, QueueCounters, ResponseFilter, ResponseStream};
use crate::storage::traits::PersistStorage;
use async_trait::async_trait;
use responses::ResponseConsumer;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

/// Who a queue belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueIdentity {
    pub client_id: String,
    pub session_id: String,
    pub user_name: String,
}

/// Session collaborators a queue reports to
#[derive(Default, Clone)]
pub struct QueueLinks {
    pub dispatcher: Weak<CrossQueueDispatcher>,
    pub factory: Weak<QueueFactory>,
}

#[derive(Default)]
struct Counters {
    all_requests: AtomicU64,
    persisted_requests: AtomicU64,
    committed_requests: AtomicU64,
    available_requests: AtomicU64,
    fetched_requests: AtomicU64,
    failed_requests: AtomicU64,
    processed_requests: AtomicU64,
    all_responses: AtomicU64,
    fetched_responses: AtomicU64,
    filtered_responses: AtomicU64,
    dispatched_responses: AtomicU64,
}

/// Guards so each one-shot lifecycle event is raised at most once
#[derive(Default)]
struct LifecycleGuards {
    all_dispatched: AtomicBool,
    all_processed: AtomicBool,
    all_responses_dispatched: AtomicBool,
}

struct QuickCache {
    enabled: bool,
    items: Vec<QueueItem>,
}

pub struct ClientQueue {
    identity: QueueIdentity,
    settings: QueueSettings,
    storage: Arc<dyn PersistStorage>,
    links: QueueLinks,
    self_ref: Weak<ClientQueue>,
    notifications: NotificationManager,
    counters: Counters,
    guards: LifecycleGuards,
    end_of_message: AtomicBool,
    disposed: AtomicBool,

    pending_requests: Mutex<Vec<QueueItem>>,
    quick_cache: Mutex<QuickCache>,
    redispatch: Mutex<VecDeque<QueueItem>>,
    persist_failure: Mutex<Option<QueueError>>,
    request_arrived: Notify,
    request_persisted: Notify,
    request_available: Notify,
    pull_gate: tokio::sync::Mutex<()>,
    flush_gate: tokio::sync::Mutex<()>,

    pending_responses: Mutex<Vec<QueueItem>>,
    idle_flush: Mutex<Option<(u64, AbortHandle)>>,
    idle_generation: AtomicU64,
    consumers: Mutex<VecDeque<ResponseConsumer>>,
    next_consumer_id: AtomicU64,
    pump_active: AtomicBool,
    pump_pending: AtomicBool,
}

impl ClientQueue {
    pub fn new(
        identity: QueueIdentity,
        settings: QueueSettings,
        storage: Arc<dyn PersistStorage>,
        links: QueueLinks,
    ) -> Arc<Self> {
        let quick_cache_enabled =
            settings.quick_cache_capacity > 0 && links.dispatcher.upgrade().is_some();
        log::debug!(
            "Creating queue '{}' for user '{}' (session {}, quick cache {})",
            identity.client_id,
            identity.user_name,
            identity.session_id,
            if quick_cache_enabled { "on" } else { "off" }
        );

        Arc::new_cyclic(|self_ref| Self {
            notifications: NotificationManager::new(identity.client_id.clone()),
            identity,
            settings,
            storage,
            links,
            self_ref: self_ref.clone(),
            counters: Counters::default(),
            guards: LifecycleGuards::default(),
            end_of_message: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            pending_requests: Mutex::new(Vec::new()),
            quick_cache: Mutex::new(QuickCache {
                enabled: quick_cache_enabled,
                items: Vec::new(),
            }),
            redispatch: Mutex::new(VecDeque::new()),
            persist_failure: Mutex::new(None),
            request_arrived: Notify::new(),
            request_persisted: Notify::new(),
            request_available: Notify::new(),
            pull_gate: tokio::sync::Mutex::new(()),
            flush_gate: tokio::sync::Mutex::new(()),
            pending_responses: Mutex::new(Vec::new()),
            idle_flush: Mutex::new(None),
            idle_generation: AtomicU64::new(0),
            consumers: Mutex::new(VecDeque::new()),
            next_consumer_id: AtomicU64::new(1),
            pump_active: AtomicBool::new(false),
            pump_pending: AtomicBool::new(false),
        })
    }

    /// Queue without dispatcher or factory, driven directly by its caller
    pub fn standalone(
        client_id: &str,
        user_name: &str,
        settings: QueueSettings,
        storage: Arc<dyn PersistStorage>,
    ) -> Arc<Self> {
        Self::new(
            QueueIdentity {
                client_id: client_id.to_string(),
                session_id: "standalone".to_string(),
                user_name: user_name.to_string(),
            },
            settings,
            storage,
            QueueLinks::default(),
        )
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn storage(&self) -> &Arc<dyn PersistStorage> {
        &self.storage
    }

    fn weak_self(&self) -> Weak<dyn BrokerQueue> {
        let weak: Weak<dyn BrokerQueue> = self.self_ref.clone();
        weak
    }

    fn is_disposed_flag(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn is_durable(&self) -> bool {
        self.settings.durable || !self.storage.is_in_memory()
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Acquire)
    }

    fn publish(&self, event: Event) {
        if let Err(e) = self.notifications.publish(event) {
            log::trace!("{}: {}", self.identity.client_id, e);
        }
    }

    fn raise_exception(&self, error: QueueError, persist_ids: Vec<PersistId>) {
        log::warn!("{}: {}", self.identity.client_id, error);
        self.publish(Event::Exception(
            ExceptionEvent::new(&self.identity.client_id, error).with_items(persist_ids),
        ));
    }

    fn raise_fatal(&self, error: QueueError, persist_ids: Vec<PersistId>) {
        log::error!("{}: fatal: {}", self.identity.client_id, error);
        self.publish(Event::Fatal(
            ExceptionEvent::new(&self.identity.client_id, error).with_items(persist_ids),
        ));
    }

    fn raise_lifecycle(&self, event_type: LifecycleEventType) {
        log::info!("{}: {}", self.identity.client_id, event_type);
        self.publish(Event::Lifecycle(LifecycleEvent::new(
            event_type,
            &self.identity.client_id,
        )));
    }

    fn raise_once(&self, guard: &AtomicBool, event_type: LifecycleEventType) -> bool {
        if guard.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.raise_lifecycle(event_type);
        true
    }

    /// All committed requests have been fetched from the backend at least once
    fn check_all_dispatched(&self) {
        let committed = Self::load(&self.counters.committed_requests);
        if self.end_of_message.load(Ordering::Acquire)
            && committed > 0
            && Self::load(&self.counters.fetched_requests) >= committed
        {
            self.raise_once(
                &self.guards.all_dispatched,
                LifecycleEventType::AllRequestsDispatched,
            );
        }
    }

    /// End of message seen and no committed request is left unanswered
    ///
    /// Every request retired by the backend has its response in the response
    /// store, so the response side is complete at the same moment.
    fn check_all_processed(&self) {
        let all = Self::load(&self.counters.all_requests);
        let committed = Self::load(&self.counters.committed_requests);
        if self.end_of_message.load(Ordering::Acquire)
            && committed > 0
            && committed == all
            && self.storage.requests_count() == 0
            && self.raise_once(
                &self.guards.all_processed,
                LifecycleEventType::AllRequestsProcessed,
            )
        {
            self.raise_once(
                &self.guards.all_responses_dispatched,
                LifecycleEventType::AllResponsesDispatched,
            );
        }
    }

    fn all_processed(&self) -> bool {
        self.guards.all_processed.load(Ordering::Acquire)
    }

    /// Acked or filtered responses have caught up with persisted responses
    fn check_responses_dispatched(&self) {
        let persisted = Self::load(&self.counters.processed_requests);
        let handled = Self::load(&self.counters.dispatched_responses)
            + Self::load(&self.counters.filtered_responses);
        if persisted > 0 && handled >= persisted {
            self.raise_lifecycle(LifecycleEventType::AvailableResponsesDispatched);
        }
    }

    fn trace_disposed(&self, operation: &str) {
        log::trace!(
            "{}: ignoring {} on disposed queue",
            self.identity.client_id,
            operation
        );
    }
}

#[async_trait]
impl BrokerQueue for ClientQueue {
    fn client_id(&self) -> &str {
        &self.identity.client_id
    }

    fn session_id(&self) -> &str {
        &self.identity.session_id
    }

    fn user_name(&self) -> &str {
        &self.identity.user_name
    }

    fn counters(&self) -> QueueCounters {
        let c = &self.counters;
        QueueCounters {
            all_requests: Self::load(&c.all_requests),
            committed_requests: Self::load(&c.committed_requests),
            available_requests: Self::load(&c.available_requests),
            dispatched_requests: Self::load(&c.fetched_requests),
            failed_requests: Self::load(&c.failed_requests),
            processed_requests: Self::load(&c.processed_requests),
            all_responses: Self::load(&c.all_responses),
            fetched_responses: Self::load(&c.fetched_responses),
            filtered_responses: Self::load(&c.filtered_responses),
            dispatched_responses: Self::load(&c.dispatched_responses),
            end_of_message: self.end_of_message.load(Ordering::Acquire),
        }
    }

    fn is_disposed(&self) -> bool {
        self.is_disposed_flag()
    }

    fn subscribe(&self, subscriber_id: &str, filter: EventFilter) -> QueueResult<EventReceiver> {
        self.notifications
            .subscribe(
                subscriber_id.to_string(),
                filter,
                format!("queue:{}", self.identity.client_id),
            )
            .map_err(|e| QueueError::OperationFailed {
                message: e.to_string(),
            })
    }

    async fn put_request(&self, context: RequestContext, message: Message) -> QueueResult<()> {
        self.enqueue_request(context, message).await
    }

    async fn get_request(&self) -> QueueResult<Option<QueueItem>> {
        self.pull_request().await
    }

    async fn put_response(
        &self,
        message: Option<Message>,
        request: QueueItem,
    ) -> QueueResult<()> {
        match message {
            None => self.redispatch_request(request),
            Some(message) => self.enqueue_response(message, request).await,
        }
    }

    async fn register_responses_callback(
        &self,
        expected: u64,
        filter: ResponseFilter,
    ) -> QueueResult<Option<ResponseStream>> {
        self.register_consumer(expected, filter).await
    }

    async fn reset_responses_callback(&self) -> QueueResult<()> {
        self.reset_consumers().await
    }

    async fn ack_response(&self, response: &QueueItem, success: bool) -> QueueResult<()> {
        self.acknowledge(response, success).await
    }

    async fn flush(
        &self,
        msg_count: u64,
        timeout: Duration,
        end_of_message: bool,
    ) -> QueueResult<()> {
        self.flush_requests(msg_count, timeout, end_of_message).await
    }

    async fn discard_unflushed(&self) -> QueueResult<u64> {
        if self.is_disposed_flag() {
            self.trace_disposed("discard_unflushed");
            return Ok(0);
        }
        let _flush = self.flush_gate.lock().await;
        self.discard_uncommitted().await
    }

    async fn close(&self) -> QueueResult<QueueCounters> {
        if self.is_disposed_flag() {
            return Ok(self.counters());
        }

        // Responses still buffered are persisted before the backend goes away
        self.cancel_idle_flush();
        let leftover = std::mem::take(&mut *crate::queue::error::lock(&self.pending_responses)?);
        if !leftover.is_empty() {
            self.persist_responses(leftover).await;
        }

        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(self.counters());
        }

        if let Some(factory) = self.links.factory.upgrade() {
            factory.unregister(&self.identity.client_id, self);
        }

        self.request_arrived.notify_waiters();
        self.request_persisted.notify_waiters();
        self.request_available.notify_waiters();
        crate::queue::error::lock(&self.consumers)?.clear();
        self.notifications.close();

        let counters = self.counters();
        match self.storage.close().await {
            Ok(snapshot) => log::debug!(
                "{}: closed storage ({} requests, {} responses, {} pending)",
                self.identity.client_id,
                snapshot.all_requests,
                snapshot.responses,
                snapshot.pending_requests
            ),
            Err(e) => log::warn!(
                "{}: storage close failed: {}",
                self.identity.client_id,
                e
            ),
        }
        log::info!(
            "Queue '{}' closed: {} requests, {} processed",
            self.identity.client_id,
            counters.all_requests,
            counters.processed_requests
        );
        Ok(counters)
    }
}
