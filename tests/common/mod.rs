//! Common test utilities and helpers
//!
//! Settings with short timers, config fixtures and a polling helper shared by
//! the session tests.

#![allow(dead_code)]

use brokerqueue::queue::api::{DispatcherSettings, QueueSettings};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

pub fn fast_queue_settings() -> QueueSettings {
    QueueSettings {
        request_batch_size: 4,
        response_batch_size: 4,
        quick_cache_capacity: 8,
        resend_limit: 2,
        response_idle_flush_ms: 20,
        retry_delay_ms: 1,
        durable: false,
    }
}

pub fn quiet_dispatcher_settings() -> DispatcherSettings {
    DispatcherSettings {
        low_watermark: 2,
        high_watermark: 16,
        reemit_timeout_ms: 0,
        resend_limit: 0,
    }
}

/// Write a configuration file the binary can be pointed at with `-c`
pub fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp config");
    file.write_all(contents.as_bytes())
        .expect("write temp config");
    file
}

pub const FAST_CONFIG: &str = r#"
[queue]
request_batch_size = 4
response_batch_size = 4
response_idle_flush_ms = 20

[dispatcher]
low_watermark = 2
high_watermark = 16

[logging]
level = "off"
"#;

/// Poll `check` until it holds, failing the test after two seconds
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
