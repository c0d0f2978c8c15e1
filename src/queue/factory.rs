//! Queue factory
//!
//! Resolves the one [`ClientQueue`] per client id of a session, creating it
//! (and opening its backend) on first use. A client id stays bound to the user
//! that created it.

use crate::core::retry::{retry_async, RetryPolicy};
use crate::core::sync::lock_recovering;
use crate::queue::dispatcher::CrossQueueDispatcher;
use crate::queue::engine::{ClientQueue, QueueIdentity, QueueLinks};
use crate::queue::error::{lock, QueueError, QueueResult};
use crate::queue::settings::QueueSettings;
use crate::queue::traits::BrokerQueue;
use crate::storage::traits::StorageProvider;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Per-client summary for broker reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: String,
    pub user_name: String,
    pub total_requests: u64,
    pub processed_requests: u64,
    pub failed_requests: u64,
}

pub struct QueueFactory {
    session_id: String,
    settings: QueueSettings,
    provider: Arc<dyn StorageProvider>,
    dispatcher: Option<Arc<CrossQueueDispatcher>>,
    queues: Mutex<HashMap<String, Arc<ClientQueue>>>,
    self_ref: Weak<QueueFactory>,
    closed: AtomicBool,
}

impl QueueFactory {
    pub fn new(
        session_id: impl Into<String>,
        settings: QueueSettings,
        provider: Arc<dyn StorageProvider>,
        dispatcher: Option<Arc<CrossQueueDispatcher>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            session_id: session_id.into(),
            settings,
            provider,
            dispatcher,
            queues: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dispatcher(&self) -> Option<&Arc<CrossQueueDispatcher>> {
        self.dispatcher.as_ref()
    }

    /// Queue for `client_id`, creating it on first use
    ///
    /// Returns the queue and whether this call created it. A client id that
    /// already belongs to a different user is rejected.
    pub async fn get_queue_by_client(
        &self,
        client_id: &str,
        user_name: &str,
    ) -> QueueResult<(Arc<ClientQueue>, bool)> {
        if client_id.trim().is_empty() {
            return Err(QueueError::InvalidArgument {
                message: "client id must not be empty".to_string(),
            });
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::QueueClosed {
                client_id: client_id.to_string(),
            });
        }

        if let Some(existing) = self.lookup(client_id, user_name)? {
            return Ok((existing, false));
        }

        // The backend is opened without holding the registry lock
        let storage = retry_async(
            "open_storage",
            RetryPolicy::with_resend_limit(self.settings.resend_limit, Duration::from_millis(100)),
            || self.provider.open(&self.session_id, client_id),
        )
        .await
        .map_err(|source| QueueError::Persistence {
            client_id: client_id.to_string(),
            source,
        })?;

        let queue = ClientQueue::new(
            QueueIdentity {
                client_id: client_id.to_string(),
                session_id: self.session_id.clone(),
                user_name: user_name.to_string(),
            },
            self.settings.clone(),
            storage,
            QueueLinks {
                dispatcher: self
                    .dispatcher
                    .as_ref()
                    .map(Arc::downgrade)
                    .unwrap_or_default(),
                factory: self.self_ref.clone(),
            },
        );

        {
            let mut queues = lock(&self.queues)?;
            if let Some(existing) = queues.get(client_id) {
                // Lost the creation race; the winner's queue is the only one
                return Self::check_user(existing, user_name).map(|q| (q, false));
            }
            queues.insert(client_id.to_string(), Arc::clone(&queue));
        }

        if let Some(dispatcher) = &self.dispatcher {
            let registered: Arc<dyn BrokerQueue> = queue.clone();
            dispatcher.register_queue(registered);
        }
        log::info!(
            "Created queue '{}' for user '{}' in session {}",
            client_id,
            user_name,
            self.session_id
        );
        Ok((queue, true))
    }

    fn lookup(&self, client_id: &str, user_name: &str) -> QueueResult<Option<Arc<ClientQueue>>> {
        let queues = lock(&self.queues)?;
        match queues.get(client_id) {
            Some(existing) => Self::check_user(existing, user_name).map(Some),
            None => Ok(None),
        }
    }

    fn check_user(existing: &Arc<ClientQueue>, user_name: &str) -> QueueResult<Arc<ClientQueue>> {
        if existing.user_name() != user_name {
            return Err(QueueError::UserMismatch {
                client_id: existing.client_id().to_string(),
                expected: existing.user_name().to_string(),
                actual: user_name.to_string(),
            });
        }
        Ok(Arc::clone(existing))
    }

    /// Forget a closing queue; ignores queues this factory no longer tracks
    pub(crate) fn unregister(&self, client_id: &str, queue: &ClientQueue) {
        let mut queues = lock_recovering(self.queues.lock(), "queue factory");
        let tracked = queues
            .get(client_id)
            .is_some_and(|existing| std::ptr::eq(existing.as_ref(), queue));
        if tracked {
            queues.remove(client_id);
            log::debug!("Unregistered queue '{}'", client_id);
        }
    }

    pub fn queue_count(&self) -> usize {
        lock_recovering(self.queues.lock(), "queue factory").len()
    }

    /// Summary of every live queue, ordered by client id
    pub fn all_client_infos(&self) -> Vec<ClientInfo> {
        let queues: Vec<Arc<ClientQueue>> = lock_recovering(self.queues.lock(), "queue factory")
            .values()
            .cloned()
            .collect();

        let mut infos: Vec<ClientInfo> = queues
            .iter()
            .map(|queue| {
                let counters = queue.counters();
                ClientInfo {
                    client_id: queue.client_id().to_string(),
                    user_name: queue.user_name().to_string(),
                    total_requests: counters.all_requests,
                    processed_requests: counters.processed_requests,
                    failed_requests: counters.failed_requests,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        infos
    }

    /// Close every queue, then the dispatcher
    pub async fn close(&self) -> QueueResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let queues: Vec<Arc<ClientQueue>> = lock(&self.queues)?.drain().map(|(_, q)| q).collect();
        log::info!(
            "Closing session {} with {} queues",
            self.session_id,
            queues.len()
        );
        for queue in queues {
            if let Err(e) = queue.close().await {
                log::warn!("Closing queue '{}' failed: {}", queue.client_id(), e);
            }
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.close();
        }
        Ok(())
    }
}
