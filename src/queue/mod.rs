//! Durable request/response broker queue
//!
//! Sits between SOA clients submitting compute requests and the worker pool
//! executing them. Each client gets one [`ClientQueue`](engine::ClientQueue)
//! per session; a session-wide [`CrossQueueDispatcher`](dispatcher::CrossQueueDispatcher)
//! prefetches requests from every queue for the workers and routes their
//! answers back.
//!
//! # Architecture
//!
//! ```text
//!  client ──put_request──▶ ClientQueue ──batches──▶ PersistStorage
//!  client ──flush────────▶     │  commit, release for fetch
//!                              ▼
//!                     CrossQueueDispatcher ◀──get_request── worker
//!                      prefetch cache          put_response
//!                      correlation tables ─────────┘
//!                              │
//!                              ▼
//!  client ◀─ResponseStream── ClientQueue ◀──responses── PersistStorage
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use brokerqueue::queue::api::*;
//! use brokerqueue::storage::api::MemoryStorageProvider;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = CrossQueueDispatcher::new(DispatcherSettings::default());
//! let factory = QueueFactory::new(
//!     "session-1",
//!     QueueSettings::default(),
//!     Arc::new(MemoryStorageProvider::new()),
//!     Some(Arc::clone(&dispatcher)),
//! );
//!
//! let (queue, _) = factory.get_queue_by_client("client-a", "alice").await?;
//! queue
//!     .put_request(RequestContext::for_user("alice"), Message::new("Echo", serde_json::json!(1)))
//!     .await?;
//! queue.flush(1, Duration::from_secs(5), true).await?;
//!
//! if let Some(request) = dispatcher.get_request().await {
//!     let reply = Message::reply_to(request.message(), serde_json::json!(1));
//!     dispatcher.put_response(Some(reply), request).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub(crate) mod dispatcher;
pub(crate) mod engine;
pub(crate) mod error;
pub(crate) mod factory;
pub(crate) mod item;
pub(crate) mod message;
pub(crate) mod settings;
pub(crate) mod token;
pub(crate) mod traits;

pub mod api;

#[cfg(test)]
mod tests;
