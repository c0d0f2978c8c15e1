//! The `brokerqueue` executable end to end

use crate::common::{config_file, FAST_CONFIG};
use std::process::Command;

fn brokerqueue() -> Command {
    Command::new(env!("CARGO_BIN_EXE_brokerqueue"))
}

#[test]
fn test_simulate_prints_the_session_report() {
    let config = config_file(FAST_CONFIG);

    let output = brokerqueue()
        .arg("--config-file")
        .arg(config.path())
        .args(["--no-color", "--log-file", "none"])
        .args(["simulate", "--clients", "2", "--requests", "10", "--workers", "2"])
        .output()
        .expect("run brokerqueue");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("client-01"));
    assert!(stdout.contains("client-02"));
    assert!(stdout.contains("20 requests from 2 clients"));
    assert!(!stdout.contains("\x1b["));
}

#[test]
fn test_missing_config_file_fails() {
    let output = brokerqueue()
        .args(["--config-file", "/nonexistent/brokerqueue.toml", "simulate"])
        .output()
        .expect("run brokerqueue");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"));
}

#[test]
fn test_invalid_configuration_is_reported() {
    let config = config_file("[dispatcher]\nlow_watermark = 10\nhigh_watermark = 2\n");

    let output = brokerqueue()
        .arg("-c")
        .arg(config.path())
        .arg("simulate")
        .output()
        .expect("run brokerqueue");

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("validation"));
}

#[test]
fn test_zero_clients_is_a_usage_error() {
    let output = brokerqueue()
        .args(["simulate", "--clients", "0"])
        .output()
        .expect("run brokerqueue");

    assert_eq!(output.status.code(), Some(2));
}
