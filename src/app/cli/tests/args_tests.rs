//! Tests for command line parsing

use crate::app::cli::args::*;
use crate::app::simulate::SimulationPlan;
use clap::Parser;
use std::path::PathBuf;

#[test]
fn test_simulate_defaults() {
    let args = Args::try_parse_from(["brokerqueue", "simulate"]).unwrap();

    let Command::Simulate(simulate) = &args.command;
    assert_eq!(simulate.clients, 3);
    assert_eq!(simulate.requests, 100);
    assert_eq!(simulate.workers, 4);
    assert_eq!(simulate.fail_every, None);
    assert!(args.config_file.is_none());
}

#[test]
fn test_global_flags_precede_the_command() {
    let args = Args::try_parse_from([
        "brokerqueue",
        "--config-file",
        "/etc/brokerqueue.toml",
        "--log-level",
        "debug",
        "--log-format",
        "json",
        "simulate",
        "--clients",
        "2",
        "--fail-every",
        "5",
    ])
    .unwrap();

    assert_eq!(args.config_file, Some(PathBuf::from("/etc/brokerqueue.toml")));
    assert_eq!(args.log_level.as_deref(), Some("debug"));
    assert_eq!(args.log_format.as_deref(), Some("json"));

    let Command::Simulate(simulate) = &args.command;
    let plan = SimulationPlan::from(simulate);
    assert_eq!(plan.clients, 2);
    assert_eq!(plan.fail_every, Some(5));
}

#[test]
fn test_invalid_values_are_rejected() {
    assert!(Args::try_parse_from(["brokerqueue", "--log-level", "loud", "simulate"]).is_err());
    assert!(Args::try_parse_from(["brokerqueue", "simulate", "--clients", "0"]).is_err());
    // Failing every request would redispatch forever
    assert!(Args::try_parse_from(["brokerqueue", "simulate", "--fail-every", "1"]).is_err());
    assert!(Args::try_parse_from(["brokerqueue"]).is_err());
}

#[test]
fn test_color_flags_override_configuration() {
    let forced = Args::try_parse_from(["brokerqueue", "--color", "simulate"]).unwrap();
    assert!(forced.use_color(Some(false)));

    let disabled = Args::try_parse_from(["brokerqueue", "--no-color", "simulate"]).unwrap();
    assert!(!disabled.use_color(Some(true)));

    let configured = Args::try_parse_from(["brokerqueue", "simulate"]).unwrap();
    assert!(configured.use_color(Some(true)));
    assert!(!configured.use_color(Some(false)));

    assert!(Args::try_parse_from(["brokerqueue", "--color", "--no-color", "simulate"]).is_err());
}
