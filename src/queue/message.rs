//! Message types carried through the broker queue
//!
//! The core treats message bodies as opaque JSON values. Only the header is
//! interpreted: the message identity, the caller's message version (fault
//! replies must be built with it) and the reply correlation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

/// Stable identity of a queue item across retries, clones and redispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersistId(Uuid);

impl PersistId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PersistId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PersistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope version used by the submitting client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum MessageVersion {
    Soap11,
    Soap12,
    Unversioned,
}

/// Fixed fault codes surfaced to clients as fault responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum FaultCode {
    RetryLimitExceeded,
    PersistenceFailed,
    QueueClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub code: FaultCode,
    pub reason: String,
}

/// Header information for every request and response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub message_id: Uuid,
    pub version: MessageVersion,
    pub action: String,
    /// Message id of the request a reply answers
    pub relates_to: Option<Uuid>,
    pub timestamp: SystemTime,
}

/// A request or response payload
///
/// # Example
///
/// ```rust
/// use brokerqueue::queue::api::{Message, MessageVersion};
///
/// let request = Message::new("Echo", serde_json::json!({ "text": "hi" }))
///     .with_version(MessageVersion::Soap12);
/// let reply = Message::reply_to(&request, serde_json::json!({ "text": "hi" }));
/// assert_eq!(reply.header.relates_to, Some(request.header.message_id));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: serde_json::Value,
    pub fault: Option<Fault>,
}

impl Message {
    pub fn new(action: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            header: MessageHeader {
                message_id: Uuid::new_v4(),
                version: MessageVersion::Soap12,
                action: action.into(),
                relates_to: None,
                timestamp: SystemTime::now(),
            },
            body,
            fault: None,
        }
    }

    pub fn with_version(mut self, version: MessageVersion) -> Self {
        self.header.version = version;
        self
    }

    /// Build a reply correlated to `request`, in the request's version
    pub fn reply_to(request: &Message, body: serde_json::Value) -> Self {
        Self {
            header: MessageHeader {
                message_id: Uuid::new_v4(),
                version: request.header.version,
                action: format!("{}Response", request.header.action),
                relates_to: Some(request.header.message_id),
                timestamp: SystemTime::now(),
            },
            body,
            fault: None,
        }
    }

    /// Build a fault reply for `request` with a generated reason text
    pub fn fault_for(request: &Message, code: FaultCode, detail: &str) -> Self {
        let reason = format!(
            "{} while processing '{}' ({}): {}",
            code, request.header.action, request.header.message_id, detail
        );
        let mut reply = Self::reply_to(request, serde_json::Value::Null);
        reply.header.action = "Fault".to_string();
        reply.fault = Some(Fault { code, reason });
        reply
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }

    pub fn message_id(&self) -> Uuid {
        self.header.message_id
    }

    /// Independent copy of this message under a fresh message id
    pub fn fresh_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.header.message_id = Uuid::new_v4();
        copy
    }
}

/// Transport-side context of a submitted request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub user_name: String,
    pub reply_to: Option<String>,
}

impl RequestContext {
    pub fn for_user(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            reply_to: None,
        }
    }
}
