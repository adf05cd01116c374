use faultline::harness::{HarnessConfig, HostPlatform, MulticastOutcome, MulticastSeverity, ScenarioError};

use super::{run, setup};

fn config(severity: MulticastSeverity) -> HarnessConfig {
    HarnessConfig {
        platform: HostPlatform::Linux,
        multicast_severity: severity,
        ..HarnessConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_receivers_only_warn_by_default() {
    let setup = setup(config(MulticastSeverity::Warn), 4).await;
    let (result, output) = run(&setup).await;
    let report = result.expect("scenario");

    assert_eq!(
        report.multicast,
        MulticastOutcome::Unreachable {
            attempts: 5,
            last_count: 4
        }
    );
    assert_eq!(report.bidir_attempts, Some(1));
    assert!(output.contains("testing udp multicast... failed (is a firewall enabled?)\n"));
    assert!(output.ends_with("testing udp bi-dir connection... ok\n"));
}

#[tokio::test(start_paused = true)]
async fn test_missing_receivers_fail_when_configured() {
    let setup = setup(config(MulticastSeverity::Fail), 0).await;
    let (result, _) = run(&setup).await;
    assert!(matches!(
        result,
        Err(ScenarioError::MulticastUnreachable {
            attempts: 5,
            last_count: 0
        })
    ));
}
