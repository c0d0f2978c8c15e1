//! Tests for the per-session queue factory

#[cfg(test)]
mod tests {
    use super::super::fast_settings;
    use crate::queue::api::{
        BrokerQueue, CrossQueueDispatcher, DispatcherSettings, Message, QueueError, QueueFactory,
        RequestContext,
    };
    use crate::storage::api::{MemoryStorageProvider, PersistStorage};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn factory_with(provider: Arc<MemoryStorageProvider>) -> Arc<QueueFactory> {
        QueueFactory::new("session-1", fast_settings(), provider, None)
    }

    #[tokio::test]
    async fn test_same_client_gets_the_same_queue() {
        let factory = factory_with(Arc::new(MemoryStorageProvider::new()));

        let (first, created) = factory.get_queue_by_client("client-a", "alice").await.unwrap();
        assert!(created);
        let (second, created) = factory.get_queue_by_client("client-a", "alice").await.unwrap();
        assert!(!created);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.session_id(), "session-1");
        assert_eq!(factory.queue_count(), 1);
    }

    #[tokio::test]
    async fn test_client_id_is_bound_to_its_user() {
        let factory = factory_with(Arc::new(MemoryStorageProvider::new()));
        factory.get_queue_by_client("client-a", "alice").await.unwrap();

        let result = factory.get_queue_by_client("client-a", "bob").await;

        match result {
            Err(QueueError::UserMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, "alice");
                assert_eq!(actual, "bob");
            }
            Err(other) => panic!("expected a user mismatch, got {:?}", other),
            Ok(_) => panic!("expected a user mismatch"),
        }
    }

    #[tokio::test]
    async fn test_empty_client_id_is_rejected() {
        let factory = factory_with(Arc::new(MemoryStorageProvider::new()));

        let result = factory.get_queue_by_client("  ", "alice").await;

        assert!(matches!(result, Err(QueueError::InvalidArgument { .. })));
        assert_eq!(factory.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_closing_a_queue_unregisters_it() {
        let provider = Arc::new(MemoryStorageProvider::new());
        let factory = factory_with(provider.clone());
        let (queue, _) = factory.get_queue_by_client("client-a", "alice").await.unwrap();

        queue.close().await.unwrap();
        assert_eq!(factory.queue_count(), 0);

        // A later lookup opens a fresh queue over a fresh backend
        let (reopened, created) = factory.get_queue_by_client("client-a", "alice").await.unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&queue, &reopened));
        assert!(reopened.storage().is_new_created());
    }

    #[tokio::test]
    async fn test_client_infos_summarise_each_queue() {
        let factory = factory_with(Arc::new(MemoryStorageProvider::new()));
        let (b, _) = factory.get_queue_by_client("client-b", "bob").await.unwrap();
        let (a, _) = factory.get_queue_by_client("client-a", "alice").await.unwrap();

        for n in 0..2 {
            a.put_request(
                RequestContext::for_user("alice"),
                Message::new("Compute", json!(n)),
            )
            .await
            .unwrap();
        }
        a.flush(2, Duration::from_secs(1), true).await.unwrap();
        let request = a.get_request().await.unwrap().unwrap();
        let reply = Message::reply_to(request.message(), json!("done"));
        a.put_response(Some(reply), request).await.unwrap();
        b.put_request(RequestContext::for_user("bob"), Message::new("Compute", json!(0)))
            .await
            .unwrap();

        let infos = factory.all_client_infos();

        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].client_id, "client-a");
        assert_eq!(infos[0].user_name, "alice");
        assert_eq!(infos[0].total_requests, 2);
        assert_eq!(infos[0].processed_requests, 1);
        assert_eq!(infos[1].client_id, "client-b");
        assert_eq!(infos[1].total_requests, 1);
        assert_eq!(infos[1].processed_requests, 0);
    }

    #[tokio::test]
    async fn test_close_disposes_every_queue_and_the_dispatcher() {
        let dispatcher = CrossQueueDispatcher::new(DispatcherSettings::default());
        let factory = QueueFactory::new(
            "session-1",
            fast_settings(),
            Arc::new(MemoryStorageProvider::new()),
            Some(Arc::clone(&dispatcher)),
        );
        let (a, _) = factory.get_queue_by_client("client-a", "alice").await.unwrap();
        let (b, _) = factory.get_queue_by_client("client-b", "bob").await.unwrap();

        factory.close().await.unwrap();

        assert!(a.is_disposed());
        assert!(b.is_disposed());
        assert!(dispatcher.is_closed());
        assert_eq!(factory.queue_count(), 0);
        assert!(matches!(
            factory.get_queue_by_client("client-c", "carol").await,
            Err(QueueError::QueueClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_backend_open_reuses_live_storage() {
        let provider = Arc::new(MemoryStorageProvider::new());
        let factory = factory_with(provider.clone());
        let (queue, _) = factory.get_queue_by_client("client-a", "alice").await.unwrap();

        let backend = provider
            .storage_for("session-1", "client-a")
            .expect("backend opened by the factory");
        queue
            .put_request(RequestContext::for_user("alice"), Message::new("Compute", json!(1)))
            .await
            .unwrap();

        assert_eq!(backend.staged_count(), 1);
    }
}
