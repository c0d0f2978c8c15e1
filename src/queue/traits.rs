//! Queue contract
//!
//! Capabilities every client queue variant provides to the broker: request
//! intake and pull consumption, response intake and pull-style response
//! consumers, batch commit, discard and close. Identity and counters are
//! read-only; failures that happen in the background surface as events.

use crate::notifications::api::{EventFilter, EventReceiver};
use crate::queue::error::QueueResult;
use crate::queue::item::QueueItem;
use crate::queue::message::{Message, RequestContext};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Snapshot of a queue's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCounters {
    /// Requests ever submitted through `put_request`
    pub all_requests: u64,
    /// Requests committed by successful flushes
    pub committed_requests: u64,
    /// Committed requests released for fetching from the backend
    pub available_requests: u64,
    /// Requests fetched from the backend at least once
    pub dispatched_requests: u64,
    /// Requests answered with a fault response
    pub failed_requests: u64,
    /// Requests whose response has been persisted
    pub processed_requests: u64,
    /// Responses accepted by `put_response`
    pub all_responses: u64,
    pub fetched_responses: u64,
    pub filtered_responses: u64,
    /// Responses acknowledged by a consumer
    pub dispatched_responses: u64,
    pub end_of_message: bool,
}

/// Selects which responses a consumer wants to see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFilter {
    All,
    /// Responses whose action matches exactly
    Action(String),
}

impl ResponseFilter {
    pub fn accepts(&self, response: &QueueItem) -> bool {
        match self {
            ResponseFilter::All => true,
            ResponseFilter::Action(action) => response.message().header.action == *action,
        }
    }
}

/// Pull-style handle for a registered responses consumer
///
/// Yields up to the requested number of responses, then ends. Each response
/// must be acknowledged through [`BrokerQueue::ack_response`]; dropping the
/// stream hands undelivered responses to the next registered consumer.
pub struct ResponseStream {
    receiver: UnboundedReceiver<QueueItem>,
    expected: u64,
}

impl ResponseStream {
    pub(crate) fn new(receiver: UnboundedReceiver<QueueItem>, expected: u64) -> Self {
        Self { receiver, expected }
    }

    pub async fn next(&mut self) -> Option<QueueItem> {
        self.receiver.recv().await
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }
}

#[async_trait]
pub trait BrokerQueue: Send + Sync {
    fn client_id(&self) -> &str;

    fn session_id(&self) -> &str;

    fn user_name(&self) -> &str;

    fn counters(&self) -> QueueCounters;

    fn is_disposed(&self) -> bool;

    /// Subscribe to this queue's exception, fatal and lifecycle events
    fn subscribe(&self, subscriber_id: &str, filter: EventFilter) -> QueueResult<EventReceiver>;

    async fn put_request(&self, context: RequestContext, message: Message) -> QueueResult<()>;

    /// Next request to process; `None` once the queue is disposed
    async fn get_request(&self) -> QueueResult<Option<QueueItem>>;

    /// Answer `request`, or redispatch it when `message` is `None`
    async fn put_response(&self, message: Option<Message>, request: QueueItem)
        -> QueueResult<()>;

    /// Register a consumer for up to `expected` responses
    ///
    /// Returns `Ok(None)` when the queue has nothing left to hand out.
    async fn register_responses_callback(
        &self,
        expected: u64,
        filter: ResponseFilter,
    ) -> QueueResult<Option<ResponseStream>>;

    async fn reset_responses_callback(&self) -> QueueResult<()>;

    async fn ack_response(&self, response: &QueueItem, success: bool) -> QueueResult<()>;

    /// Commit a batch boundary of `msg_count` requests
    async fn flush(&self, msg_count: u64, timeout: Duration, end_of_message: bool)
        -> QueueResult<()>;

    /// Drop every request not yet committed; returns how many were dropped
    async fn discard_unflushed(&self) -> QueueResult<u64>;

    async fn close(&self) -> QueueResult<QueueCounters>;
}
