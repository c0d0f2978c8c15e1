//! Queue items

use crate::queue::error::{QueueError, QueueResult};
use crate::queue::message::{Message, PersistId, RequestContext};
use crate::queue::token::{AsyncToken, ReemitToken};
use crate::queue::traits::BrokerQueue;
use crate::storage::record::{FetchedRecord, ItemRecord};
use std::sync::{Arc, Weak};

/// Unit of work flowing through a client queue
///
/// `Clone` yields another handle on the same logical item: same message id,
/// same tokens. [`QueueItem::reemit_clone`] is the copy used for resends.
#[derive(Debug, Clone)]
pub struct QueueItem {
    message: Message,
    context: RequestContext,
    persist_id: PersistId,
    dispatch_number: u32,
    try_count: u32,
    peer: Option<Box<QueueItem>>,
    async_token: Arc<AsyncToken>,
    reemit_token: Arc<ReemitToken>,
}

impl QueueItem {
    /// New request whose backend handle is not yet known
    pub fn new_request(
        message: Message,
        context: RequestContext,
        client_id: &str,
        queue: Weak<dyn BrokerQueue>,
    ) -> Self {
        let persist_id = PersistId::new();
        Self {
            message,
            context,
            persist_id,
            dispatch_number: 0,
            try_count: 0,
            peer: None,
            async_token: Arc::new(AsyncToken::new(persist_id, client_id, queue)),
            reemit_token: Arc::new(ReemitToken::new()),
        }
    }

    /// Response answering `request`, linked to it as peer
    pub fn new_response(message: Message, request: QueueItem) -> Self {
        let persist_id = PersistId::new();
        let async_token = Arc::new(AsyncToken::new(
            persist_id,
            request.async_token.client_id(),
            request.async_token.weak_queue(),
        ));
        Self {
            message,
            context: request.context.clone(),
            persist_id,
            dispatch_number: 0,
            try_count: 0,
            peer: Some(Box::new(request)),
            async_token,
            reemit_token: Arc::new(ReemitToken::new()),
        }
    }

    /// Rebuild an item fetched from the backend, with its handle known
    pub fn from_fetched(fetched: FetchedRecord, client_id: &str, queue: Weak<dyn BrokerQueue>) -> Self {
        let FetchedRecord { record, handle } = fetched;
        let async_token = Arc::new(AsyncToken::resolved(
            record.persist_id,
            handle,
            client_id,
            queue,
        ));
        Self {
            message: record.message,
            context: record.context,
            persist_id: record.persist_id,
            dispatch_number: record.dispatch_number,
            try_count: record.try_count,
            peer: None,
            async_token,
            reemit_token: Arc::new(ReemitToken::new()),
        }
    }

    pub fn to_record(&self) -> ItemRecord {
        ItemRecord {
            persist_id: self.persist_id,
            message: self.message.clone(),
            context: self.context.clone(),
            dispatch_number: self.dispatch_number,
            try_count: self.try_count,
            peer_persist_id: self.peer.as_ref().map(|peer| peer.persist_id),
        }
    }

    /// Link a response to its request; a peer can only be set once
    pub fn set_peer(&mut self, peer: QueueItem) -> QueueResult<()> {
        if let Some(existing) = &self.peer {
            return Err(QueueError::InvalidArgument {
                message: format!(
                    "item {} is already linked to {}",
                    self.persist_id, existing.persist_id
                ),
            });
        }
        self.peer = Some(Box::new(peer));
        Ok(())
    }

    /// Copy for a timeout resend
    ///
    /// Deep-copies the message under a fresh message id, keeps persist id,
    /// async token and dispatch lineage, bumps the try count and shares the
    /// reemit token so only one of the copies can be answered.
    pub fn reemit_clone(&self) -> Self {
        Self {
            message: self.message.fresh_copy(),
            context: self.context.clone(),
            persist_id: self.persist_id,
            dispatch_number: self.dispatch_number,
            try_count: self.try_count + 1,
            peer: self.peer.clone(),
            async_token: Arc::clone(&self.async_token),
            reemit_token: Arc::clone(&self.reemit_token),
        }
    }

    pub(crate) fn bump_dispatch_number(&mut self) {
        self.dispatch_number += 1;
    }

    pub(crate) fn bump_try_count(&mut self) {
        self.try_count += 1;
    }

    /// Give a request whose answer was lost a fresh chance to be answered
    pub(crate) fn renew_reemit_token(&mut self) {
        self.reemit_token = Arc::new(ReemitToken::new());
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn persist_id(&self) -> PersistId {
        self.persist_id
    }

    pub fn dispatch_number(&self) -> u32 {
        self.dispatch_number
    }

    pub fn try_count(&self) -> u32 {
        self.try_count
    }

    pub fn peer(&self) -> Option<&QueueItem> {
        self.peer.as_deref()
    }

    pub fn async_token(&self) -> &Arc<AsyncToken> {
        &self.async_token
    }

    pub fn reemit_token(&self) -> &Arc<ReemitToken> {
        &self.reemit_token
    }

    pub fn is_fault(&self) -> bool {
        self.message.is_fault()
    }
}
