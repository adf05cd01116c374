use std::time::Duration;

use faultline::harness::{
    HarnessConfig, HostPlatform, RetryError, ScenarioError, ScenarioHost, Stage,
};
use faultline::sim::{LoopbackConfig, LoopbackNetwork};
use faultline::{Operation, TransportError};

use super::{run, setup, setup_on};

fn config() -> HarnessConfig {
    HarnessConfig {
        platform: HostPlatform::Linux,
        ..HarnessConfig::decorated()
    }
}

#[tokio::test(start_paused = true)]
async fn test_lost_ping_is_retried_with_new_identity() {
    let network = LoopbackNetwork::new(LoopbackConfig::default());
    let setup = setup_on(network, config(), 5).await;
    setup.network.drop_next(1);

    let (result, _) = run(&setup).await;
    let report = result.expect("scenario");
    assert_eq!(report.udp_attempts, 2);
    assert_eq!(setup.network.stats().lost, 1);
}

#[tokio::test(start_paused = true)]
async fn test_total_loss_exhausts_retries() {
    let network = LoopbackNetwork::new(LoopbackConfig::lossy(7, 1.0));
    let setup = setup_on(network, config(), 5).await;

    let start = tokio::time::Instant::now();
    let (result, output) = run(&setup).await;
    assert!(matches!(
        result,
        Err(ScenarioError::Retry {
            stage: Stage::Udp,
            source: RetryError::Exhausted {
                attempts: 5,
                quorum: 3,
                last_count: 0
            }
        })
    ));
    assert_eq!(output, "testing udp... ");
    assert!(start.elapsed() >= Duration::from_millis(5 * 2000));
}

#[tokio::test(start_paused = true)]
async fn test_injected_write_failure_is_not_retried() {
    let setup = setup(config(), 5).await;
    setup.host.faults().set_write_failure(true);

    let (result, _) = run(&setup).await;
    match result {
        Err(ScenarioError::Retry {
            stage: Stage::Udp,
            source:
                RetryError::Probe {
                    attempt: 1,
                    source: TransportError::InjectedFailure { operation },
                },
        }) => assert_eq!(operation, Operation::Write),
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_delay_only_slows_the_scenario() {
    let setup = setup(config(), 5).await;
    setup
        .host
        .faults()
        .set_connect_delay(Duration::from_millis(50));

    let (result, _) = run(&setup).await;
    assert_eq!(result.expect("scenario").udp_attempts, 1);
}
