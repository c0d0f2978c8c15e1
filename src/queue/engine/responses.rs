//! Response side of the client queue: intake, persistence and consumers

use super::ClientQueue;
use crate::core::sync::lock_recovering;
use crate::notifications::api::{Event, ResponsesPersistedEvent};
use crate::queue::error::{lock, QueueError, QueueResult};
use crate::queue::item::QueueItem;
use crate::queue::message::Message;
use crate::queue::traits::{ResponseFilter, ResponseStream};
use crate::storage::error::StorageError;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

/// A registered pull-style response consumer
pub(super) struct ResponseConsumer {
    id: u64,
    expected: u64,
    delivered: u64,
    filter: ResponseFilter,
    sender: UnboundedSender<QueueItem>,
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
        Some(value.saturating_sub(1))
    });
}

impl ClientQueue {
    pub(super) async fn enqueue_response(
        &self,
        message: Message,
        request: QueueItem,
    ) -> QueueResult<()> {
        if self.is_disposed_flag() {
            self.trace_disposed("put_response");
            return Ok(());
        }

        if !request.reemit_token().finish() {
            log::debug!(
                "{}: request {} already answered, discarding response (try {})",
                self.identity.client_id,
                request.persist_id(),
                request.try_count()
            );
            return Ok(());
        }

        self.counters.all_responses.fetch_add(1, Ordering::AcqRel);
        let response = QueueItem::new_response(message, request);

        let threshold = self.settings.response_batch_size;
        if threshold <= 1 {
            self.persist_responses(vec![response]).await;
            return Ok(());
        }

        let batch = {
            let mut pending = lock(&self.pending_responses)?;
            pending.push(response);
            let buffered = pending.len() as u64;
            let persisted = Self::load(&self.counters.processed_requests);
            let committed = Self::load(&self.counters.committed_requests);
            // Flush early once this batch could complete the committed set
            if pending.len() >= threshold || (committed > 0 && buffered + persisted >= committed) {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };

        match batch {
            Some(batch) => {
                self.cancel_idle_flush();
                self.persist_responses(batch).await;
            }
            None => self.arm_idle_flush(),
        }
        Ok(())
    }

    fn arm_idle_flush(&self) {
        let mut slot = lock_recovering(self.idle_flush.lock(), "response idle flush");
        if slot.is_some() {
            return;
        }

        let generation = self.idle_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let queue = self.self_ref.clone();
        let delay = self.settings.response_idle_flush();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.fire_idle_flush(generation).await;
            }
        });
        *slot = Some((generation, task.abort_handle()));
    }

    pub(super) fn cancel_idle_flush(&self) {
        let armed = lock_recovering(self.idle_flush.lock(), "response idle flush").take();
        if let Some((_, handle)) = armed {
            handle.abort();
        }
    }

    async fn fire_idle_flush(&self, generation: u64) {
        {
            let mut slot = lock_recovering(self.idle_flush.lock(), "response idle flush");
            // A cancelled or re-armed timer no longer owns the batch
            if slot.as_ref().map(|(armed, _)| *armed) != Some(generation) {
                return;
            }
            *slot = None;
        }

        let batch = std::mem::take(&mut *lock_recovering(
            self.pending_responses.lock(),
            "response idle flush",
        ));
        if !batch.is_empty() {
            log::debug!(
                "{}: idle timer flushing {} responses",
                self.identity.client_id,
                batch.len()
            );
            self.persist_responses(batch).await;
        }
    }

    /// Store a response batch, retiring the answered requests
    pub(super) async fn persist_responses(&self, batch: Vec<QueueItem>) {
        let total = batch.len();
        let records = batch.iter().map(QueueItem::to_record).collect();

        let (stored, failed, error): (Vec<QueueItem>, Vec<QueueItem>, StorageError) =
            match self.storage.put_responses(records).await {
                Ok(outcome) => {
                    let (failed, stored): (Vec<_>, Vec<_>) = batch
                        .into_iter()
                        .partition(|response| outcome.has_failed(&response.persist_id()));
                    let error = StorageError::ItemsFailed {
                        failed: failed.len(),
                        total,
                    };
                    (stored, failed, error)
                }
                Err(e) => (Vec::new(), batch, e),
            };

        if !stored.is_empty() {
            let count = stored.len();
            let fault_count = stored.iter().filter(|r| r.is_fault()).count();
            self.counters
                .processed_requests
                .fetch_add(count as u64, Ordering::AcqRel);
            self.counters
                .failed_requests
                .fetch_add(fault_count as u64, Ordering::AcqRel);
            log::debug!(
                "{}: persisted {} responses ({} faults)",
                self.identity.client_id,
                count,
                fault_count
            );
            self.publish(Event::ResponsesPersisted(ResponsesPersistedEvent {
                client_id: self.identity.client_id.clone(),
                count,
                fault_count,
            }));
        }

        if !failed.is_empty() {
            self.recover_failed_responses(failed, error);
        }

        if !stored.is_empty() {
            self.check_all_processed();
            self.pump_consumers().await;
        }
    }

    /// Send the requests behind unstored responses back out for another answer
    fn recover_failed_responses(&self, failed: Vec<QueueItem>, error: StorageError) {
        let persist_ids = failed.iter().map(QueueItem::persist_id).collect();
        self.raise_exception(
            QueueError::Persistence {
                client_id: self.identity.client_id.clone(),
                source: error,
            },
            persist_ids,
        );

        let limit = self.settings.resend_limit;
        for response in failed {
            let Some(mut request) = response.peer().cloned() else {
                continue;
            };
            if request.try_count() >= limit {
                let persist_id = request.persist_id();
                self.raise_fatal(
                    QueueError::ResendLimitExceeded { persist_id, limit },
                    vec![persist_id],
                );
                continue;
            }

            request.bump_try_count();
            request.renew_reemit_token();
            if let Err(e) = self.redispatch_request(request) {
                log::warn!("{}: {}", self.identity.client_id, e);
            }
        }
    }

    pub(super) async fn register_consumer(
        &self,
        expected: u64,
        filter: ResponseFilter,
    ) -> QueueResult<Option<ResponseStream>> {
        if self.is_disposed_flag() {
            self.trace_disposed("register_responses_callback");
            return Ok(None);
        }
        if expected == 0 {
            return Err(QueueError::InvalidArgument {
                message: "a responses consumer must expect at least one response".to_string(),
            });
        }
        if self.all_processed()
            && Self::load(&self.counters.fetched_responses)
                >= Self::load(&self.counters.processed_requests)
        {
            log::debug!(
                "{}: refusing responses consumer, nothing left to hand out",
                self.identity.client_id
            );
            return Ok(None);
        }

        let (sender, receiver) = unbounded_channel();
        let id = self.next_consumer_id.fetch_add(1, Ordering::AcqRel);
        lock(&self.consumers)?.push_back(ResponseConsumer {
            id,
            expected,
            delivered: 0,
            filter,
            sender,
        });
        log::trace!(
            "{}: registered responses consumer {} for {} responses",
            self.identity.client_id,
            id,
            expected
        );

        self.pump_consumers().await;
        Ok(Some(ResponseStream::new(receiver, expected)))
    }

    pub(super) async fn reset_consumers(&self) -> QueueResult<()> {
        if self.is_disposed_flag() {
            self.trace_disposed("reset_responses_callback");
            return Ok(());
        }

        self.storage
            .reset_response_cursor()
            .await
            .map_err(|source| self.persistence_error(source))?;
        let restart = if self.is_durable() {
            0
        } else {
            Self::load(&self.counters.dispatched_responses)
        };
        self.counters
            .fetched_responses
            .store(restart, Ordering::Release);

        self.pump_consumers().await;
        Ok(())
    }

    pub(super) async fn acknowledge(&self, response: &QueueItem, success: bool) -> QueueResult<()> {
        if self.is_disposed_flag() {
            self.trace_disposed("ack_response");
            return Ok(());
        }

        self.storage
            .ack_response(response.persist_id(), success)
            .await
            .map_err(|source| self.persistence_error(source))?;

        if success {
            self.counters
                .dispatched_responses
                .fetch_add(1, Ordering::AcqRel);
            self.check_responses_dispatched();
        } else {
            log::debug!(
                "{}: response {} returned by its consumer",
                self.identity.client_id,
                response.persist_id()
            );
            decrement(&self.counters.fetched_responses);
            self.pump_consumers().await;
        }
        Ok(())
    }

    /// Feed persisted responses to the current consumer
    ///
    /// Only one pump runs at a time; a request arriving while one is active
    /// makes the active pump go round once more.
    async fn pump_consumers(&self) {
        if self.pump_active.swap(true, Ordering::AcqRel) {
            self.pump_pending.store(true, Ordering::Release);
            return;
        }

        loop {
            self.pump_pending.store(false, Ordering::Release);
            self.drain_to_consumers().await;
            self.pump_active.store(false, Ordering::Release);

            if !self.pump_pending.load(Ordering::Acquire)
                || self.pump_active.swap(true, Ordering::AcqRel)
            {
                break;
            }
        }
    }

    fn current_consumer(&self) -> Option<(u64, ResponseFilter, UnboundedSender<QueueItem>)> {
        let mut consumers = lock_recovering(self.consumers.lock(), "responses consumers");
        while let Some(front) = consumers.front() {
            if front.sender.is_closed() {
                log::debug!(
                    "{}: responses consumer {} went away",
                    self.identity.client_id,
                    front.id
                );
                consumers.pop_front();
                continue;
            }
            return Some((front.id, front.filter.clone(), front.sender.clone()));
        }
        None
    }

    fn record_delivery(&self, consumer_id: u64) {
        let mut consumers = lock_recovering(self.consumers.lock(), "responses consumers");
        let satisfied = match consumers.front_mut() {
            Some(front) if front.id == consumer_id => {
                front.delivered += 1;
                front.delivered >= front.expected
            }
            _ => false,
        };
        if satisfied {
            // Dropping the sender ends the consumer's stream
            consumers.pop_front();
        }
    }

    fn drop_consumer(&self, consumer_id: u64) {
        lock_recovering(self.consumers.lock(), "responses consumers")
            .retain(|consumer| consumer.id != consumer_id);
    }

    async fn drain_to_consumers(&self) {
        loop {
            if self.is_disposed_flag() {
                return;
            }
            let Some((consumer_id, filter, sender)) = self.current_consumer() else {
                return;
            };

            let fetched = match self.storage.get_response().await {
                Ok(Some(fetched)) => fetched,
                Ok(None) => return,
                Err(source) => {
                    self.raise_exception(self.persistence_error(source), Vec::new());
                    return;
                }
            };
            self.counters
                .fetched_responses
                .fetch_add(1, Ordering::AcqRel);
            let response =
                QueueItem::from_fetched(fetched, &self.identity.client_id, self.weak_self());
            let persist_id = response.persist_id();

            if !filter.accepts(&response) {
                self.counters
                    .filtered_responses
                    .fetch_add(1, Ordering::AcqRel);
                if let Err(e) = self.storage.ack_response(persist_id, true).await {
                    log::warn!("{}: {}", self.identity.client_id, e);
                }
                self.check_responses_dispatched();
                continue;
            }

            if sender.send(response).is_err() {
                log::warn!(
                    "{}: responses consumer {} dropped, returning {}",
                    self.identity.client_id,
                    consumer_id,
                    persist_id
                );
                if let Err(e) = self.storage.ack_response(persist_id, false).await {
                    log::warn!("{}: {}", self.identity.client_id, e);
                }
                decrement(&self.counters.fetched_responses);
                self.drop_consumer(consumer_id);
                continue;
            }

            self.record_delivery(consumer_id);
        }
    }

    fn persistence_error(&self, source: StorageError) -> QueueError {
        QueueError::Persistence {
            client_id: self.identity.client_id.clone(),
            source,
        }
    }
}
