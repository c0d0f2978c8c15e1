//! Queues, dispatcher and factory driven through the public API

use crate::common::{eventually, fast_queue_settings, quiet_dispatcher_settings};
use brokerqueue::notifications::api::{Event, EventFilter, LifecycleEventType};
use brokerqueue::queue::api::{
    BrokerQueue, CrossQueueDispatcher, FaultCode, Message, QueueError, QueueFactory,
    RequestContext, ResponseFilter,
};
use brokerqueue::storage::api::{MemoryStorageProvider, PersistStorage};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn session() -> (Arc<CrossQueueDispatcher>, Arc<QueueFactory>, Arc<MemoryStorageProvider>) {
    let dispatcher = CrossQueueDispatcher::new(quiet_dispatcher_settings());
    let provider = Arc::new(MemoryStorageProvider::new());
    let factory = QueueFactory::new(
        "session-it",
        fast_queue_settings(),
        provider.clone(),
        Some(Arc::clone(&dispatcher)),
    );
    (dispatcher, factory, provider)
}

/// Answers even numbers and faults odd ones
fn spawn_worker(dispatcher: Arc<CrossQueueDispatcher>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = dispatcher.get_request().await {
            let n = request.message().body["n"].as_u64().unwrap_or(0);
            let reply = if n % 2 == 0 {
                Message::reply_to(request.message(), json!({ "half": n / 2 }))
            } else {
                Message::fault_for(request.message(), FaultCode::PersistenceFailed, "odd input")
            };
            if dispatcher.put_response(Some(reply), request).await.is_err() {
                break;
            }
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_receives_every_answer_and_fault() {
    let (dispatcher, factory, provider) = session();
    let worker = spawn_worker(Arc::clone(&dispatcher));

    let (queue, created) = factory
        .get_queue_by_client("client-it", "dana")
        .await
        .unwrap();
    assert!(created);
    let mut events = queue
        .subscribe("integration", EventFilter::LifecycleOnly)
        .unwrap();

    for n in 0..6 {
        queue
            .put_request(RequestContext::for_user("dana"), Message::new("Halve", json!({ "n": n })))
            .await
            .unwrap();
    }
    queue.flush(6, Duration::from_secs(5), true).await.unwrap();

    eventually("every request processed", || {
        queue.counters().processed_requests == 6
    })
    .await;
    assert_eq!(queue.counters().failed_requests, 3);

    let mut stream = queue
        .register_responses_callback(6, ResponseFilter::All)
        .await
        .unwrap()
        .expect("responses are waiting");
    let mut faults = 0;
    let mut answers = 0;
    while let Some(response) = timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("responses keep arriving")
    {
        if response.is_fault() {
            faults += 1;
        } else {
            assert_eq!(response.message().header.action, "HalveResponse");
            answers += 1;
        }
        queue.ack_response(&response, true).await.unwrap();
    }
    assert_eq!((answers, faults), (3, 3));

    let mut completed = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        if let Event::Lifecycle(lifecycle) = &event {
            if lifecycle.event_type == LifecycleEventType::AllResponsesDispatched {
                completed = true;
                break;
            }
        }
    }
    assert!(completed, "all responses should be reported as dispatched");

    let backend = provider.storage_for("session-it", "client-it").unwrap();
    assert_eq!(backend.requests_count(), 0);

    factory.close().await.unwrap();
    assert!(queue.is_disposed());
    let _ = timeout(Duration::from_millis(200), worker).await;
}

#[tokio::test]
async fn test_client_id_cannot_change_user() {
    let (_dispatcher, factory, _provider) = session();
    factory
        .get_queue_by_client("client-it", "dana")
        .await
        .unwrap();

    let result = factory.get_queue_by_client("client-it", "eve").await;

    assert!(matches!(result, Err(QueueError::UserMismatch { .. })));
    factory.close().await.unwrap();
}
