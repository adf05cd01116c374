//! Runs the datagram reliability scenario over the loopback network.
//!
//! Usage: `udp_scenario [config.json]`
//!
//! The optional JSON file may set `seed`, `loss_probability` and any
//! `harness` field; everything else keeps its default. Exit code 1 on any
//! failure.

use std::fs;
use std::process;

use serde::Deserialize;

use faultline::harness::{run_udp_scenario, HarnessConfig};
use faultline::sim::{LoopbackConfig, LoopbackHost, LoopbackNetwork};
use faultline::transport::Configuration;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunConfig {
    seed: u64,
    loss_probability: f64,
    harness: HarnessConfig,
}

fn load_config() -> Result<RunConfig, String> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?;
            serde_json::from_str(&text).map_err(|e| format!("{path}: {e}"))
        }
        None => Ok(RunConfig::default()),
    }
}

async fn run(config: RunConfig) -> Result<(), String> {
    let network = LoopbackNetwork::new(LoopbackConfig::lossy(config.seed, config.loss_probability));
    let harness = config.harness;
    let host = LoopbackHost::start(network.clone(), harness.clone(), Configuration::shared())
        .await
        .map_err(|e| format!("host: {e}"))?;
    let _servers = host
        .start_servers(harness.multicast_quorum)
        .await
        .map_err(|e| format!("servers: {e}"))?;

    let report = run_udp_scenario(&host, &mut std::io::stdout())
        .await
        .map_err(|e| e.to_string())?;
    tracing::info!(?report, stats = ?network.stats(), "scenario finished");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            process::exit(1);
        }
    };
    tracing::info!(seed = config.seed, loss = config.loss_probability, "starting udp scenario");

    if let Err(e) = run(config).await {
        eprintln!("FAILED: {e}");
        process::exit(1);
    }
}
