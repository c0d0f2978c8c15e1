//! Public API for the broker queue
//!
//! External modules should import from here rather than directly from internal modules.

// Queue engine, dispatcher and factory
pub use crate::queue::dispatcher::CrossQueueDispatcher;
pub use crate::queue::engine::{ClientQueue, QueueIdentity, QueueLinks};
pub use crate::queue::factory::{ClientInfo, QueueFactory};

// Items, tokens and messages
pub use crate::queue::item::QueueItem;
pub use crate::queue::message::{
    Fault, FaultCode, Message, MessageHeader, MessageVersion, PersistId, RequestContext,
};
pub use crate::queue::token::{AsyncToken, ReemitToken};

// Configuration
pub use crate::queue::settings::{DispatcherSettings, QueueSettings};

// Error handling
pub use crate::queue::error::{QueueError, QueueResult};

// Traits
pub use crate::queue::traits::{BrokerQueue, QueueCounters, ResponseFilter, ResponseStream};
