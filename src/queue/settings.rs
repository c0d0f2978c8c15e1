//! Tunables for client queues and the session dispatcher

use crate::queue::error::{QueueError, QueueResult};
use serde::Deserialize;
use std::time::Duration;

/// `[queue]` section of the configuration file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    /// Requests buffered before a batch is persisted; 1 persists inline
    pub request_batch_size: usize,
    /// Responses buffered before a batch is persisted; 1 persists inline
    pub response_batch_size: usize,
    /// Requests copied to the dispatcher ahead of the first flush; 0 disables
    pub quick_cache_capacity: usize,
    /// Persistence retries before a failure escalates to fatal
    pub resend_limit: u32,
    pub response_idle_flush_ms: u64,
    pub retry_delay_ms: u64,
    /// Durable sessions count response iteration from zero after a reset
    pub durable: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            request_batch_size: 32,
            response_batch_size: 32,
            quick_cache_capacity: 128,
            resend_limit: 3,
            response_idle_flush_ms: 100,
            retry_delay_ms: 50,
            durable: false,
        }
    }
}

impl QueueSettings {
    pub fn validate(&self) -> QueueResult<()> {
        if self.request_batch_size == 0 || self.response_batch_size == 0 {
            return Err(QueueError::InvalidArgument {
                message: "batch sizes must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn response_idle_flush(&self) -> Duration {
        Duration::from_millis(self.response_idle_flush_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// `[dispatcher]` section of the configuration file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherSettings {
    pub low_watermark: usize,
    pub high_watermark: usize,
    pub reemit_timeout_ms: u64,
    /// Timeout resends per request; 0 disables reemission
    pub resend_limit: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            low_watermark: 8,
            high_watermark: 64,
            reemit_timeout_ms: 30_000,
            resend_limit: 3,
        }
    }
}

impl DispatcherSettings {
    pub fn validate(&self) -> QueueResult<()> {
        if self.low_watermark == 0 || self.low_watermark > self.high_watermark {
            return Err(QueueError::InvalidArgument {
                message: format!(
                    "watermarks must satisfy 0 < low ({}) <= high ({})",
                    self.low_watermark, self.high_watermark
                ),
            });
        }
        Ok(())
    }

    pub fn reemit_timeout(&self) -> Duration {
        Duration::from_millis(self.reemit_timeout_ms)
    }

    pub fn reemission_enabled(&self) -> bool {
        self.resend_limit > 0 && self.reemit_timeout_ms > 0
    }
}
