//! The simulated session used by the binary

use brokerqueue::app::cli::config::BrokerConfig;
use brokerqueue::app::report::{render, summary};
use brokerqueue::app::simulate::{run, SimulationPlan};
use crate::common::fast_queue_settings;
use std::time::Duration;
use tokio::time::timeout;

fn fast_config() -> BrokerConfig {
    BrokerConfig {
        queue: fast_queue_settings(),
        ..BrokerConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simulation_serves_every_client() {
    let plan = SimulationPlan {
        clients: 3,
        requests: 20,
        workers: 3,
        fail_every: None,
    };

    let report = timeout(Duration::from_secs(10), run(&fast_config(), &plan))
        .await
        .expect("simulation should finish")
        .unwrap();

    assert_eq!(report.handed_back, 0);
    let ids: Vec<_> = report
        .clients
        .iter()
        .map(|client| client.info.client_id.as_str())
        .collect();
    assert_eq!(ids, ["client-01", "client-02", "client-03"]);
    for client in &report.clients {
        assert_eq!(client.info.user_name.replace("user", "client"), client.info.client_id);
        assert_eq!(client.info.total_requests, 20);
        assert_eq!(client.responses, 20);
        assert!(client.is_complete());
    }
    assert!(summary(&report).contains("60 requests from 3 clients"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handed_back_requests_are_answered_later() {
    let plan = SimulationPlan {
        clients: 1,
        requests: 15,
        workers: 2,
        fail_every: Some(3),
    };

    let report = timeout(Duration::from_secs(10), run(&fast_config(), &plan))
        .await
        .expect("simulation should finish")
        .unwrap();

    assert!(report.handed_back >= 5);
    let client = &report.clients[0];
    assert_eq!(client.info.processed_requests, 15);
    assert_eq!(client.responses, 15);
    assert_eq!(client.faults, 0);

    let table = render(&report, false).to_string();
    assert!(table.contains("client-01"));
    assert!(table.contains("complete"));
}

#[tokio::test]
async fn test_invalid_plan_is_rejected_before_starting() {
    let plan = SimulationPlan {
        clients: 0,
        ..SimulationPlan::default()
    };

    assert!(run(&BrokerConfig::default(), &plan).await.is_err());
}
