//! Simulated broker session
//!
//! Drives one in-memory session end to end: every client submits its
//! requests and flushes them with end of message, workers pull through the
//! dispatcher and answer, and each client consumes and acknowledges its
//! responses. Workers can be told to hand every Nth request back, which
//! exercises the redispatch path.

use crate::app::cli::config::BrokerConfig;
use crate::notifications::api::{EventFilter, LifecycleEventType};
use crate::queue::api::{
    BrokerQueue, ClientInfo, CrossQueueDispatcher, Message, QueueError, QueueFactory,
    QueueResult, RequestContext, ResponseFilter,
};
use crate::storage::api::MemoryStorageProvider;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationPlan {
    pub clients: usize,
    pub requests: u64,
    pub workers: usize,
    /// Hand every Nth pulled request back instead of answering it
    pub fail_every: Option<u64>,
}

impl Default for SimulationPlan {
    fn default() -> Self {
        Self {
            clients: 3,
            requests: 100,
            workers: 4,
            fail_every: None,
        }
    }
}

impl SimulationPlan {
    pub fn validate(&self) -> QueueResult<()> {
        if self.clients == 0 || self.workers == 0 || self.requests == 0 {
            return Err(QueueError::InvalidArgument {
                message: "a simulation needs at least one client, worker and request".to_string(),
            });
        }
        if self.fail_every.is_some_and(|every| every < 2) {
            return Err(QueueError::InvalidArgument {
                message: "fail-every must be at least 2".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientOutcome {
    pub info: ClientInfo,
    pub responses: u64,
    pub faults: u64,
    /// Lifecycle events seen by the client, in order
    pub lifecycle: Vec<LifecycleEventType>,
}

impl ClientOutcome {
    pub fn is_complete(&self) -> bool {
        self.lifecycle
            .contains(&LifecycleEventType::AllResponsesDispatched)
    }
}

#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub clients: Vec<ClientOutcome>,
    pub handed_back: u64,
    pub reemitted: u64,
    pub duplicates_discarded: u64,
    pub elapsed: Duration,
}

impl SimulationReport {
    pub fn total_requests(&self) -> u64 {
        self.clients.iter().map(|c| c.info.total_requests).sum()
    }
}

struct ClientRun {
    client_id: String,
    responses: u64,
    faults: u64,
    lifecycle: Vec<LifecycleEventType>,
}

pub async fn run(config: &BrokerConfig, plan: &SimulationPlan) -> QueueResult<SimulationReport> {
    plan.validate()?;
    config.validate()?;

    let started = Instant::now();
    let started_at = Utc::now();
    let session_id = uuid::Uuid::new_v4().to_string();
    let dispatcher = CrossQueueDispatcher::new(config.dispatcher.clone());
    let factory = QueueFactory::new(
        session_id.clone(),
        config.queue.clone(),
        Arc::new(MemoryStorageProvider::new()),
        Some(Arc::clone(&dispatcher)),
    );
    log::info!(
        "Session {}: {} clients x {} requests, {} workers",
        session_id,
        plan.clients,
        plan.requests,
        plan.workers
    );

    let served = Arc::new(AtomicU64::new(0));
    let handed_back = Arc::new(AtomicU64::new(0));
    let workers: Vec<JoinHandle<()>> = (0..plan.workers)
        .map(|worker| {
            spawn_worker(
                worker,
                Arc::clone(&dispatcher),
                plan.fail_every,
                Arc::clone(&served),
                Arc::clone(&handed_back),
            )
        })
        .collect();

    let runs = try_join_all(
        (0..plan.clients).map(|index| run_client(Arc::clone(&factory), index, plan.requests)),
    )
    .await;

    // Closing unregisters the queues, so their summaries are taken first
    let infos = factory.all_client_infos();
    let reemitted = dispatcher.reemitted_count();
    let duplicates_discarded = dispatcher.duplicates_discarded();
    factory.close().await?;
    for worker in workers {
        if let Err(e) = worker.await {
            log::warn!("Worker task ended abnormally: {}", e);
        }
    }

    let mut runs = runs?;
    let clients = infos
        .into_iter()
        .filter_map(|info| {
            let position = runs.iter().position(|run| run.client_id == info.client_id)?;
            let run = runs.swap_remove(position);
            Some(ClientOutcome {
                info,
                responses: run.responses,
                faults: run.faults,
                lifecycle: run.lifecycle,
            })
        })
        .collect();

    let report = SimulationReport {
        session_id,
        started_at,
        clients,
        handed_back: handed_back.load(Ordering::Acquire),
        reemitted,
        duplicates_discarded,
        elapsed: started.elapsed(),
    };
    log::info!(
        "Session {} finished in {:.2?}: {} requests served",
        report.session_id,
        report.elapsed,
        served.load(Ordering::Acquire)
    );
    Ok(report)
}

fn spawn_worker(
    worker: usize,
    dispatcher: Arc<CrossQueueDispatcher>,
    fail_every: Option<u64>,
    served: Arc<AtomicU64>,
    handed_back: Arc<AtomicU64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = dispatcher.get_request().await {
            let seen = served.fetch_add(1, Ordering::AcqRel) + 1;
            let answer = if fail_every.is_some_and(|every| seen % every == 0) {
                handed_back.fetch_add(1, Ordering::AcqRel);
                log::debug!("Worker {} handing back {}", worker, request.persist_id());
                None
            } else {
                Some(square(request.message()))
            };

            if let Err(e) = dispatcher.put_response(answer, request).await {
                log::warn!("Worker {}: {}", worker, e);
            }
        }
        log::debug!("Worker {} stopped", worker);
    })
}

fn square(request: &Message) -> Message {
    let n = request
        .body
        .get("n")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    Message::reply_to(request, json!({ "n": n, "square": n.saturating_mul(n) }))
}

async fn run_client(factory: Arc<QueueFactory>, index: usize, requests: u64) -> QueueResult<ClientRun> {
    let client_id = format!("client-{:02}", index + 1);
    let user_name = format!("user-{:02}", index + 1);
    let (queue, _) = factory.get_queue_by_client(&client_id, &user_name).await?;
    let mut events = queue.subscribe("simulation", EventFilter::LifecycleOnly)?;

    let context = RequestContext::for_user(user_name.as_str());
    for n in 0..requests {
        queue
            .put_request(context.clone(), Message::new("Square", json!({ "n": n })))
            .await?;
    }
    queue.flush(requests, FLUSH_TIMEOUT, true).await?;

    let mut responses = 0;
    let mut faults = 0;
    if let Some(mut stream) = queue
        .register_responses_callback(requests, ResponseFilter::All)
        .await?
    {
        while let Some(response) = stream.next().await {
            responses += 1;
            if response.is_fault() {
                faults += 1;
            }
            queue.ack_response(&response, true).await?;
        }
    }

    let mut lifecycle = Vec::new();
    while let Ok(event) = events.try_recv() {
        lifecycle.extend(event.lifecycle_type());
    }
    log::debug!(
        "{}: {} responses ({} faults), events {:?}",
        client_id,
        responses,
        faults,
        lifecycle
    );

    Ok(ClientRun {
        client_id,
        responses,
        faults,
        lifecycle,
    })
}
