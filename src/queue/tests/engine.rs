//! Tests for the client queue engine driven without a dispatcher

#[cfg(test)]
mod tests {
    use super::super::{eventually, fast_settings, next_event, standalone_queue};
    use crate::notifications::api::{Event, EventFilter};
    use crate::queue::api::{
        BrokerQueue, Message, QueueError, QueueSettings, RequestContext, ResponseFilter,
    };
    use crate::storage::api::PersistStorage;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn request(n: u64) -> Message {
        Message::new("Compute", json!({ "n": n }))
    }

    fn context() -> RequestContext {
        RequestContext::for_user("alice")
    }

    async fn submit(queue: &dyn BrokerQueue, count: u64) {
        for n in 0..count {
            queue.put_request(context(), request(n)).await.unwrap();
        }
    }

    /// Pull every committed request and answer it
    async fn answer_all(queue: &dyn BrokerQueue, count: u64) {
        for _ in 0..count {
            let item = timeout(Duration::from_secs(2), queue.get_request())
                .await
                .expect("request should be available")
                .unwrap()
                .expect("queue is open");
            let reply = Message::reply_to(item.message(), json!({ "ok": true }));
            queue.put_response(Some(reply), item).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_flush_commits_and_releases_requests() {
        let (queue, storage) = standalone_queue("client-a", fast_settings());

        submit(queue.as_ref(), 3).await;
        queue.flush(3, Duration::from_secs(1), false).await.unwrap();

        let counters = queue.counters();
        assert_eq!(counters.all_requests, 3);
        assert_eq!(counters.committed_requests, 3);
        assert_eq!(counters.available_requests, 3);
        assert!(!counters.end_of_message);
        assert_eq!(storage.all_requests_count(), 3);

        let first = queue.get_request().await.unwrap().unwrap();
        assert_eq!(first.message().body, json!({ "n": 0 }));
        assert!(first.async_token().is_resolved());
        assert_eq!(queue.counters().dispatched_requests, 1);
    }

    #[tokio::test]
    async fn test_batch_threshold_persists_full_batches() {
        let settings = QueueSettings {
            request_batch_size: 2,
            ..fast_settings()
        };
        let (queue, storage) = standalone_queue("client-a", settings);

        submit(queue.as_ref(), 1).await;
        assert_eq!(storage.staged_count(), 0);
        submit(queue.as_ref(), 1).await;
        assert_eq!(storage.staged_count(), 2);
        submit(queue.as_ref(), 1).await;
        assert_eq!(storage.staged_count(), 2);

        // The flush persists the partial batch before committing
        queue.flush(3, Duration::from_secs(1), true).await.unwrap();
        assert_eq!(storage.staged_count(), 0);
        assert_eq!(queue.counters().committed_requests, 3);
        assert!(storage.eom_received());
    }

    #[tokio::test]
    async fn test_flush_timeout_leaves_counters_unchanged() {
        let settings = QueueSettings {
            request_batch_size: 8,
            ..fast_settings()
        };
        let (queue, _storage) = standalone_queue("client-a", settings);
        submit(queue.as_ref(), 1).await;

        let result = queue.flush(2, Duration::from_millis(50), true).await;
        match result {
            Err(QueueError::FlushTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
            other => panic!("expected a flush timeout, got {:?}", other),
        }

        let counters = queue.counters();
        assert_eq!(counters.all_requests, 1);
        assert_eq!(counters.committed_requests, 0);
        assert_eq!(counters.available_requests, 0);
        assert!(!counters.end_of_message);

        // The missing request arrives and the same flush goes through
        submit(queue.as_ref(), 1).await;
        queue.flush(2, Duration::from_secs(1), true).await.unwrap();
        assert_eq!(queue.counters().committed_requests, 2);
    }

    #[tokio::test]
    async fn test_flush_waits_for_late_requests() {
        let (queue, _storage) = standalone_queue("client-a", fast_settings());

        let producer = queue.clone();
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.put_request(context(), request(1)).await.unwrap();
        });

        queue.flush(1, Duration::from_secs(2), false).await.unwrap();
        late.await.unwrap();
        assert_eq!(queue.counters().committed_requests, 1);
    }

    #[tokio::test]
    async fn test_empty_end_of_message_is_rejected() {
        let (queue, _storage) = standalone_queue("client-a", fast_settings());

        let result = queue.flush(0, Duration::from_millis(50), true).await;

        assert!(matches!(result, Err(QueueError::EmptyEndOfMessage { .. })));
        assert_eq!(queue.counters().committed_requests, 0);
    }

    #[tokio::test]
    async fn test_flush_rejects_more_requests_than_declared() {
        let (queue, _storage) = standalone_queue("client-a", fast_settings());
        submit(queue.as_ref(), 3).await;

        let result = queue.flush(2, Duration::from_millis(100), false).await;

        match result {
            Err(QueueError::FlushCountExceeded {
                declared,
                submitted,
            }) => {
                assert_eq!(declared, 2);
                assert_eq!(submitted, 3);
            }
            other => panic!("expected FlushCountExceeded, got {:?}", other),
        }
        assert_eq!(queue.counters().committed_requests, 0);
    }

    #[tokio::test]
    async fn test_discard_unflushed_drops_uncommitted_requests() {
        let (queue, storage) = standalone_queue("client-a", fast_settings());
        submit(queue.as_ref(), 2).await;
        queue.flush(2, Duration::from_secs(1), false).await.unwrap();
        submit(queue.as_ref(), 3).await;

        let discarded = queue.discard_unflushed().await.unwrap();

        assert_eq!(discarded, 3);
        assert_eq!(storage.staged_count(), 0);
        let counters = queue.counters();
        assert_eq!(counters.all_requests, 2);
        assert_eq!(counters.committed_requests, 2);

        // The queue stays usable after a discard
        submit(queue.as_ref(), 1).await;
        queue.flush(1, Duration::from_secs(1), true).await.unwrap();
        assert_eq!(queue.counters().committed_requests, 3);
    }

    #[tokio::test]
    async fn test_redispatch_returns_request_with_next_dispatch_number() {
        let (queue, _storage) = standalone_queue("client-a", fast_settings());
        submit(queue.as_ref(), 1).await;
        queue.flush(1, Duration::from_secs(1), true).await.unwrap();

        let item = queue.get_request().await.unwrap().unwrap();
        let persist_id = item.persist_id();
        assert_eq!(item.dispatch_number(), 0);
        queue.put_response(None, item).await.unwrap();

        let again = timeout(Duration::from_secs(1), queue.get_request())
            .await
            .expect("redispatched request should be handed out")
            .unwrap()
            .unwrap();
        assert_eq!(again.persist_id(), persist_id);
        assert_eq!(again.dispatch_number(), 1);
        // A redispatch is not a new fetch from the backend
        assert_eq!(queue.counters().dispatched_requests, 1);
    }

    #[tokio::test]
    async fn test_transient_persistence_failure_is_retried() {
        let (queue, storage) = standalone_queue("client-a", fast_settings());
        let mut errors = queue.subscribe("errors", EventFilter::ErrorsOnly).unwrap();
        storage.fail_next_request_puts(1);

        submit(queue.as_ref(), 1).await;

        match next_event(&mut errors).await {
            Event::Exception(event) => {
                assert_eq!(event.persist_ids.len(), 1);
                assert!(matches!(event.error, QueueError::Persistence { .. }));
            }
            other => panic!("expected an exception event, got {:?}", other),
        }
        queue.flush(1, Duration::from_secs(1), true).await.unwrap();
        assert_eq!(queue.counters().committed_requests, 1);
    }

    #[tokio::test]
    async fn test_exhausted_persistence_retries_fail_the_flush() {
        let (queue, storage) = standalone_queue("client-a", fast_settings());
        let mut errors = queue.subscribe("errors", EventFilter::ErrorsOnly).unwrap();
        storage.fail_next_request_puts(10);

        // Background failures never surface on the submitting call
        submit(queue.as_ref(), 1).await;

        assert!(matches!(next_event(&mut errors).await, Event::Exception(_)));
        assert!(matches!(next_event(&mut errors).await, Event::Exception(_)));
        assert!(matches!(next_event(&mut errors).await, Event::Fatal(_)));

        let result = queue.flush(1, Duration::from_secs(1), true).await;
        assert!(matches!(result, Err(QueueError::Persistence { .. })));

        let counters = queue.counters();
        assert_eq!(counters.all_requests, 0);
        assert_eq!(counters.committed_requests, 0);
        assert!(!counters.end_of_message);
    }

    #[tokio::test]
    async fn test_failed_response_item_redispatches_its_request() {
        let (queue, storage) = standalone_queue("client-a", fast_settings());
        let mut errors = queue.subscribe("errors", EventFilter::ErrorsOnly).unwrap();
        submit(queue.as_ref(), 1).await;
        queue.flush(1, Duration::from_secs(1), true).await.unwrap();
        storage.fail_next_response_items(1);

        answer_all(queue.as_ref(), 1).await;

        assert!(matches!(next_event(&mut errors).await, Event::Exception(_)));
        assert_eq!(queue.counters().processed_requests, 0);

        let retry = timeout(Duration::from_secs(1), queue.get_request())
            .await
            .expect("request should come back")
            .unwrap()
            .unwrap();
        assert_eq!(retry.try_count(), 1);
        assert_eq!(retry.dispatch_number(), 1);

        let reply = Message::reply_to(retry.message(), json!({ "ok": true }));
        queue.put_response(Some(reply), retry).await.unwrap();
        assert_eq!(queue.counters().processed_requests, 1);
    }

    #[tokio::test]
    async fn test_second_response_for_a_request_is_discarded() {
        let (queue, _storage) = standalone_queue("client-a", fast_settings());
        submit(queue.as_ref(), 1).await;
        queue.flush(1, Duration::from_secs(1), true).await.unwrap();

        let item = queue.get_request().await.unwrap().unwrap();
        let duplicate = item.clone();
        let reply = Message::reply_to(item.message(), json!(1));
        queue.put_response(Some(reply.clone()), item).await.unwrap();
        queue.put_response(Some(reply), duplicate).await.unwrap();

        let counters = queue.counters();
        assert_eq!(counters.all_responses, 1);
        assert_eq!(counters.processed_requests, 1);
    }

    #[tokio::test]
    async fn test_idle_timer_persists_partial_response_batch() {
        let settings = QueueSettings {
            response_batch_size: 16,
            ..fast_settings()
        };
        let (queue, storage) = standalone_queue("client-a", settings);
        submit(queue.as_ref(), 3).await;
        queue.flush(3, Duration::from_secs(1), true).await.unwrap();

        let item = queue.get_request().await.unwrap().unwrap();
        let reply = Message::reply_to(item.message(), json!(1));
        queue.put_response(Some(reply), item).await.unwrap();
        assert_eq!(queue.counters().processed_requests, 0);

        eventually("idle flush", || queue.counters().processed_requests == 1).await;
        assert_eq!(storage.responses_count(), 1);
    }

    #[tokio::test]
    async fn test_consumer_filter_skips_other_actions() {
        let (queue, _storage) = standalone_queue("client-a", fast_settings());
        submit(queue.as_ref(), 2).await;
        queue.flush(2, Duration::from_secs(1), true).await.unwrap();

        let first = queue.get_request().await.unwrap().unwrap();
        let second = queue.get_request().await.unwrap().unwrap();
        let fault = Message::fault_for(
            first.message(),
            crate::queue::api::FaultCode::PersistenceFailed,
            "worker lost",
        );
        queue.put_response(Some(fault), first).await.unwrap();
        let reply = Message::reply_to(second.message(), json!(2));
        queue.put_response(Some(reply), second).await.unwrap();

        let mut stream = queue
            .register_responses_callback(1, ResponseFilter::Action("ComputeResponse".to_string()))
            .await
            .unwrap()
            .expect("responses are pending");

        let response = stream.next().await.unwrap();
        assert_eq!(response.message().header.action, "ComputeResponse");
        assert!(stream.next().await.is_none());
        queue.ack_response(&response, true).await.unwrap();

        let counters = queue.counters();
        assert_eq!(counters.failed_requests, 1);
        assert_eq!(counters.filtered_responses, 1);
        assert_eq!(counters.dispatched_responses, 1);
    }

    #[tokio::test]
    async fn test_dropped_consumer_hands_responses_to_the_next() {
        let (queue, _storage) = standalone_queue("client-a", fast_settings());
        submit(queue.as_ref(), 2).await;
        queue.flush(2, Duration::from_secs(1), true).await.unwrap();

        let abandoned = queue
            .register_responses_callback(2, ResponseFilter::All)
            .await
            .unwrap()
            .expect("queue has work outstanding");
        drop(abandoned);

        answer_all(queue.as_ref(), 2).await;

        let mut stream = queue
            .register_responses_callback(2, ResponseFilter::All)
            .await
            .unwrap()
            .expect("responses are pending");
        assert_eq!(stream.expected(), 2);
        let mut received = Vec::new();
        while let Some(response) = stream.next().await {
            received.push(response);
        }
        assert_eq!(received.len(), 2);
        assert_eq!(queue.counters().fetched_responses, 2);
    }

    #[tokio::test]
    async fn test_negative_ack_redelivers_the_response() {
        let (queue, _storage) = standalone_queue("client-a", fast_settings());
        submit(queue.as_ref(), 1).await;
        queue.flush(1, Duration::from_secs(1), true).await.unwrap();
        answer_all(queue.as_ref(), 1).await;

        let mut stream = queue
            .register_responses_callback(2, ResponseFilter::All)
            .await
            .unwrap()
            .unwrap();
        let first = stream.next().await.unwrap();
        queue.ack_response(&first, false).await.unwrap();

        let again = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("response should be redelivered")
            .unwrap();
        assert_eq!(again.persist_id(), first.persist_id());
        queue.ack_response(&again, true).await.unwrap();

        let counters = queue.counters();
        assert_eq!(counters.fetched_responses, 1);
        assert_eq!(counters.dispatched_responses, 1);
    }

    #[tokio::test]
    async fn test_reset_restarts_after_acknowledged_responses() {
        let (queue, _storage) = standalone_queue("client-a", fast_settings());
        submit(queue.as_ref(), 2).await;
        queue.flush(2, Duration::from_secs(1), true).await.unwrap();
        answer_all(queue.as_ref(), 2).await;

        let mut stream = queue
            .register_responses_callback(2, ResponseFilter::All)
            .await
            .unwrap()
            .unwrap();
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        queue.ack_response(&first, true).await.unwrap();

        queue.reset_responses_callback().await.unwrap();
        assert_eq!(queue.counters().fetched_responses, 1);

        let mut replay = queue
            .register_responses_callback(1, ResponseFilter::All)
            .await
            .unwrap()
            .expect("one response is still unacknowledged");
        let replayed = replay.next().await.unwrap();
        assert_eq!(replayed.persist_id(), second.persist_id());
    }

    #[tokio::test]
    async fn test_consumer_must_expect_responses() {
        let (queue, _storage) = standalone_queue("client-a", fast_settings());

        let result = queue
            .register_responses_callback(0, ResponseFilter::All)
            .await;

        assert!(matches!(result, Err(QueueError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn test_closed_queue_ignores_operations() {
        let (queue, storage) = standalone_queue("client-a", fast_settings());
        submit(queue.as_ref(), 1).await;
        queue.flush(1, Duration::from_secs(1), true).await.unwrap();

        let counters = queue.close().await.unwrap();
        assert_eq!(counters.committed_requests, 1);
        assert!(queue.is_disposed());

        queue.put_request(context(), request(9)).await.unwrap();
        assert_eq!(queue.counters().all_requests, 1);
        assert!(queue.get_request().await.unwrap().is_none());
        assert!(queue
            .register_responses_callback(1, ResponseFilter::All)
            .await
            .unwrap()
            .is_none());
        assert_eq!(queue.close().await.unwrap(), counters);
        assert!(storage.get_request().await.is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_a_blocked_pull() {
        let (queue, _storage) = standalone_queue("client-a", fast_settings());

        let puller = queue.clone();
        let pull = tokio::spawn(async move { puller.get_request().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await.unwrap();

        let result = timeout(Duration::from_secs(1), pull)
            .await
            .expect("pull should wake on close")
            .unwrap();
        assert!(result.unwrap().is_none());
    }
}
