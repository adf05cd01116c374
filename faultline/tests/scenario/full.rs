use faultline::harness::{HarnessConfig, HostPlatform, MulticastOutcome};
use faultline::sim::MAX_DATAGRAM_SIZE;

use super::{run, setup};

fn linux(config: HarnessConfig) -> HarnessConfig {
    HarnessConfig {
        platform: HostPlatform::Linux,
        ..config
    }
}

#[tokio::test(start_paused = true)]
async fn test_plain_udp_scenario_passes() {
    let setup = setup(linux(HarnessConfig::default()), 5).await;
    let (result, output) = run(&setup).await;
    let report = result.expect("scenario");

    assert_eq!(report.udp_attempts, 1);
    let capacity = report.capacity.expect("capacity ran");
    assert_eq!(capacity.last_accepted, 33078);
    assert_eq!(capacity.rejected, 66166);
    assert_eq!(capacity.limit, MAX_DATAGRAM_SIZE);
    assert_eq!(report.multicast, MulticastOutcome::Reached { attempts: 1 });
    assert_eq!(report.bidir_attempts, Some(1));
    assert_eq!(
        output,
        "testing udp... ok\ntesting udp multicast... ok\ntesting udp bi-dir connection... ok\n"
    );
    // the oversized payload reached the server and was dropped there
    assert!(setup.network.stats().oversized >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_decorated_scenario_passes() {
    let setup = setup(linux(HarnessConfig::decorated()), 5).await;
    let (result, _) = run(&setup).await;
    let report = result.expect("scenario");

    assert_eq!(report.udp_attempts, 1);
    assert!(report.capacity.is_some());
    assert_eq!(report.multicast, MulticastOutcome::Reached { attempts: 1 });
    assert_eq!(report.bidir_attempts, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_ipv6_multicast_group() {
    let config = HarnessConfig {
        ipv6: true,
        platform: HostPlatform::MacOs,
        ..HarnessConfig::decorated()
    };
    let setup = setup(config, 5).await;
    assert_eq!(setup.network.listener_count("ff15::1:1", 12020), 5);

    let (result, _) = run(&setup).await;
    assert_eq!(
        result.expect("scenario").multicast,
        MulticastOutcome::Reached { attempts: 1 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_compression_skips_capacity_probe() {
    let config = HarnessConfig {
        compress: true,
        ..linux(HarnessConfig::default())
    };
    let setup = setup(config, 5).await;
    let (result, _) = run(&setup).await;
    let report = result.expect("scenario");
    assert!(report.capacity.is_none());
    assert_eq!(report.bidir_attempts, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_android_skips_multicast_and_bidir() {
    let config = HarnessConfig {
        platform: HostPlatform::Android,
        ..HarnessConfig::default()
    };
    let setup = setup(config, 0).await;
    let (result, output) = run(&setup).await;
    let report = result.expect("scenario");
    assert_eq!(report.multicast, MulticastOutcome::Skipped);
    assert_eq!(report.bidir_attempts, None);
    assert_eq!(output, "testing udp... ok\n");
}
