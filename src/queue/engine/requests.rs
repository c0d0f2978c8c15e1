//! Request side of the client queue: intake, persistence, flush and pull

use super::ClientQueue;
use crate::core::retry::RetryPolicy;
use crate::core::sync::lock_recovering;
use crate::queue::error::{lock, QueueError, QueueResult};
use crate::queue::item::QueueItem;
use crate::queue::message::{Message, RequestContext};
use crate::storage::error::StorageError;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};

impl ClientQueue {
    pub(super) async fn enqueue_request(
        &self,
        context: RequestContext,
        message: Message,
    ) -> QueueResult<()> {
        if self.is_disposed_flag() {
            self.trace_disposed("put_request");
            return Ok(());
        }

        let item = QueueItem::new_request(
            message,
            context,
            &self.identity.client_id,
            self.weak_self(),
        );

        {
            let mut cache = lock(&self.quick_cache)?;
            if cache.enabled && cache.items.len() < self.settings.quick_cache_capacity {
                cache.items.push(item.clone());
            }
        }

        let threshold = self.settings.request_batch_size;
        if threshold <= 1 {
            self.counters.all_requests.fetch_add(1, Ordering::AcqRel);
            self.request_arrived.notify_waiters();
            self.persist_requests(vec![item]).await;
            return Ok(());
        }

        // The total is bumped under the batch lock so a flush that sees the
        // new total also finds the item when it swaps the batch out.
        let batch = {
            let mut pending = lock(&self.pending_requests)?;
            pending.push(item);
            self.counters.all_requests.fetch_add(1, Ordering::AcqRel);
            if pending.len() >= threshold {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };
        self.request_arrived.notify_waiters();

        if let Some(batch) = batch {
            self.persist_requests(batch).await;
        }
        Ok(())
    }

    /// Store a batch, retrying failed items up to the resend limit
    ///
    /// Failures never propagate to the submitting call: each failed attempt
    /// raises an exception event, and running out of retries raises a fatal
    /// event and parks the error for the next flush to report.
    pub(super) async fn persist_requests(&self, mut batch: Vec<QueueItem>) {
        let policy =
            RetryPolicy::with_resend_limit(self.settings.resend_limit, self.settings.retry_delay());
        let mut attempts = 0;

        while !batch.is_empty() {
            let total = batch.len();
            let records = batch.iter().map(QueueItem::to_record).collect();
            let failure = match self.storage.put_requests(records).await {
                Ok(outcome) => {
                    batch.retain(|item| outcome.has_failed(&item.persist_id()));
                    self.mark_persisted((total - batch.len()) as u64);
                    if batch.is_empty() {
                        log::debug!(
                            "{}: persisted {} requests",
                            self.identity.client_id,
                            total
                        );
                        return;
                    }
                    StorageError::ItemsFailed {
                        failed: batch.len(),
                        total,
                    }
                }
                Err(e) => e,
            };

            attempts += 1;
            let persist_ids = batch.iter().map(QueueItem::persist_id).collect();
            let error = QueueError::Persistence {
                client_id: self.identity.client_id.clone(),
                source: failure,
            };

            if !policy.allows_retry(attempts) {
                self.raise_fatal(error.clone(), persist_ids);
                *lock_recovering(self.persist_failure.lock(), "request persistence") = Some(error);
                self.request_persisted.notify_waiters();
                return;
            }

            self.raise_exception(error, persist_ids);
            for item in batch.iter_mut() {
                item.bump_try_count();
            }
            sleep(policy.delay).await;
        }
    }

    fn mark_persisted(&self, count: u64) {
        if count > 0 {
            self.counters
                .persisted_requests
                .fetch_add(count, Ordering::AcqRel);
            self.request_persisted.notify_waiters();
        }
    }

    pub(super) async fn flush_requests(
        &self,
        msg_count: u64,
        timeout: Duration,
        end_of_message: bool,
    ) -> QueueResult<()> {
        if self.is_disposed_flag() {
            self.trace_disposed("flush");
            return Ok(());
        }
        let _flush = self.flush_gate.lock().await;

        if end_of_message
            && msg_count == 0
            && Self::load(&self.counters.all_requests) == 0
        {
            return Err(QueueError::EmptyEndOfMessage {
                client_id: self.identity.client_id.clone(),
            });
        }

        let deadline = Instant::now() + timeout;
        let base = Self::load(&self.counters.committed_requests);

        self.await_arrivals(base, msg_count, deadline, timeout).await?;

        let leftover = std::mem::take(&mut *lock(&self.pending_requests)?);
        if !leftover.is_empty() {
            self.persist_requests(leftover).await;
        }

        self.await_persisted(base, msg_count, deadline, timeout).await?;

        if end_of_message {
            if let Err(e) = self.storage.mark_end_of_message().await {
                return Err(self.abort_flush(e).await);
            }
        }
        if let Err(e) = self.storage.commit_request().await {
            return Err(self.abort_flush(e).await);
        }
        if end_of_message {
            self.end_of_message.store(true, Ordering::Release);
        }

        self.hand_over_quick_cache().await?;

        self.counters
            .available_requests
            .fetch_add(msg_count, Ordering::AcqRel);
        self.request_available.notify_waiters();
        self.counters
            .committed_requests
            .fetch_add(msg_count, Ordering::AcqRel);

        log::info!(
            "{}: flushed {} requests ({} committed{})",
            self.identity.client_id,
            msg_count,
            base + msg_count,
            if end_of_message { ", end of message" } else { "" }
        );

        self.check_all_processed();
        self.check_all_dispatched();
        Ok(())
    }

    async fn await_arrivals(
        &self,
        base: u64,
        msg_count: u64,
        deadline: Instant,
        timeout: Duration,
    ) -> QueueResult<()> {
        loop {
            let notified = self.request_arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_disposed_flag() {
                return Err(self.closed_error());
            }
            let submitted = Self::load(&self.counters.all_requests).saturating_sub(base);
            if submitted > msg_count {
                return Err(QueueError::FlushCountExceeded {
                    declared: msg_count,
                    submitted,
                });
            }
            if submitted == msg_count {
                return Ok(());
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(QueueError::FlushTimeout {
                    client_id: self.identity.client_id.clone(),
                    timeout_ms: timeout.as_millis(),
                    waiting_for: format!("{} of {} requests to arrive", submitted, msg_count),
                });
            }
        }
    }

    async fn await_persisted(
        &self,
        base: u64,
        msg_count: u64,
        deadline: Instant,
        timeout: Duration,
    ) -> QueueResult<()> {
        loop {
            let notified = self.request_persisted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let failure = lock(&self.persist_failure)?.take();
            if let Some(error) = failure {
                if let Err(e) = self.storage.abort_request().await {
                    log::warn!("{}: abort after failed flush: {}", self.identity.client_id, e);
                }
                self.rollback_uncommitted()?;
                return Err(error);
            }
            if self.is_disposed_flag() {
                return Err(self.closed_error());
            }
            let persisted = Self::load(&self.counters.persisted_requests).saturating_sub(base);
            if persisted >= msg_count {
                return Ok(());
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(QueueError::FlushTimeout {
                    client_id: self.identity.client_id.clone(),
                    timeout_ms: timeout.as_millis(),
                    waiting_for: format!("{} of {} requests to persist", persisted, msg_count),
                });
            }
        }
    }

    async fn abort_flush(&self, source: StorageError) -> QueueError {
        if let Err(e) = self.storage.abort_request().await {
            log::warn!("{}: abort after failed flush: {}", self.identity.client_id, e);
        }
        if let Err(e) = self.rollback_uncommitted() {
            log::warn!("{}: {}", self.identity.client_id, e);
        }
        QueueError::Persistence {
            client_id: self.identity.client_id.clone(),
            source,
        }
    }

    /// First flush only: give the dispatcher its head start, then stop caching
    async fn hand_over_quick_cache(&self) -> QueueResult<()> {
        let items = {
            let mut cache = lock(&self.quick_cache)?;
            if !cache.enabled {
                return Ok(());
            }
            cache.enabled = false;
            std::mem::take(&mut cache.items)
        };

        if items.is_empty() {
            return Ok(());
        }
        match self.links.dispatcher.upgrade() {
            Some(dispatcher) => {
                log::debug!(
                    "{}: handing {} quick-cached requests to the dispatcher",
                    self.identity.client_id,
                    items.len()
                );
                dispatcher.offer_quick_cache(items).await;
            }
            None => log::trace!(
                "{}: dispatcher gone, dropping {} quick-cached requests",
                self.identity.client_id,
                items.len()
            ),
        }
        Ok(())
    }

    /// Forget every request not yet committed; returns how many were dropped
    pub(super) fn rollback_uncommitted(&self) -> QueueResult<u64> {
        lock(&self.pending_requests)?.clear();
        lock(&self.persist_failure)?.take();
        {
            let mut cache = lock(&self.quick_cache)?;
            if cache.enabled {
                cache.items.clear();
            }
        }

        let committed = Self::load(&self.counters.committed_requests);
        let all = self
            .counters
            .all_requests
            .swap(committed, Ordering::AcqRel);
        self.counters
            .persisted_requests
            .store(committed, Ordering::Release);
        Ok(all.saturating_sub(committed))
    }

    pub(super) async fn discard_uncommitted(&self) -> QueueResult<u64> {
        self.storage
            .abort_request()
            .await
            .map_err(|source| QueueError::Persistence {
                client_id: self.identity.client_id.clone(),
                source,
            })?;
        let discarded = self.rollback_uncommitted()?;
        if discarded > 0 {
            log::info!(
                "{}: discarded {} unflushed requests",
                self.identity.client_id,
                discarded
            );
        }
        Ok(discarded)
    }

    pub(super) async fn pull_request(&self) -> QueueResult<Option<QueueItem>> {
        if self.is_disposed_flag() {
            self.trace_disposed("get_request");
            return Ok(None);
        }
        let _pull = self.pull_gate.lock().await;

        loop {
            let notified = self.request_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_disposed_flag() {
                return Ok(None);
            }

            let redispatched = lock(&self.redispatch)?.pop_front();
            if let Some(item) = redispatched {
                log::trace!(
                    "{}: redispatching {} (dispatch {})",
                    self.identity.client_id,
                    item.persist_id(),
                    item.dispatch_number()
                );
                return Ok(Some(item));
            }

            let available = Self::load(&self.counters.available_requests);
            if available > Self::load(&self.counters.fetched_requests) {
                match self.storage.get_request().await {
                    Ok(Some(fetched)) => {
                        self.counters
                            .fetched_requests
                            .fetch_add(1, Ordering::AcqRel);
                        let item = QueueItem::from_fetched(
                            fetched,
                            &self.identity.client_id,
                            self.weak_self(),
                        );
                        self.check_all_dispatched();
                        return Ok(Some(item));
                    }
                    Ok(None) => {
                        // Everything left was answered before the backend handed it out
                        self.counters
                            .fetched_requests
                            .fetch_max(available, Ordering::AcqRel);
                        self.check_all_dispatched();
                        continue;
                    }
                    Err(source) => {
                        let error = QueueError::Persistence {
                            client_id: self.identity.client_id.clone(),
                            source,
                        };
                        self.raise_exception(error.clone(), Vec::new());
                        return Err(error);
                    }
                }
            }

            notified.await;
        }
    }

    pub(super) fn redispatch_request(&self, mut request: QueueItem) -> QueueResult<()> {
        if self.is_disposed_flag() {
            self.trace_disposed("redispatch");
            return Ok(());
        }
        request.bump_dispatch_number();
        log::debug!(
            "{}: request {} queued for redispatch (dispatch {}, try {})",
            self.identity.client_id,
            request.persist_id(),
            request.dispatch_number(),
            request.try_count()
        );
        lock(&self.redispatch)?.push_back(request);
        self.request_available.notify_waiters();
        Ok(())
    }

    fn closed_error(&self) -> QueueError {
        QueueError::QueueClosed {
            client_id: self.identity.client_id.clone(),
        }
    }
}
