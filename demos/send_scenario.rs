//! Send Scenario - connect to a LIS host and transmit one test scenario.
//!
//! This example demonstrates:
//! - Building a `ConnectionManager` with custom timeouts
//! - Sending a named scenario (ENQ, ACK-gated frames, EOT)
//! - Reading the status board afterwards
//!
//! # Running
//!
//! ```text
//! cargo run --example mock_host -- 3000
//! RUST_LOG=astm_client=debug cargo run --example send_scenario -- 127.0.0.1 3000 abnormal_results
//! ```

use std::time::Duration;

use astm_client::{ConnectionManager, Scenario};
use tracing_subscriber::EnvFilter;

fn parse_scenario(name: &str) -> Option<Scenario> {
    Scenario::ALL.into_iter().find(|scenario| {
        serde_json::to_value(scenario)
            .map(|value| value == name)
            .unwrap_or(false)
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u32 = args.next().map(|p| p.parse()).transpose()?.unwrap_or(3000);
    let scenario_name = args.next().unwrap_or_else(|| "normal_liver_panel".to_string());
    let scenario = parse_scenario(&scenario_name)
        .ok_or_else(|| format!("unknown scenario: {}", scenario_name))?;

    let manager = ConnectionManager::builder()
        .ack_timeout(Duration::from_secs(5))
        .build()?;

    manager.connect(&host, port).await?;
    manager.send_scenario(scenario).await?;
    manager.disconnect().await;

    for entry in manager.status().logs() {
        println!(
            "{} [{:?}] {}: {}",
            entry.timestamp.format("%H:%M:%S%.3f"),
            entry.level,
            entry.category,
            entry.message
        );
    }

    Ok(())
}
