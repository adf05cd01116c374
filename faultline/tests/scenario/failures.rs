use std::sync::Arc;

use async_trait::async_trait;
use faultline::harness::{
    run_udp_scenario, CapacityError, DatagramProxy, HarnessConfig, HostPlatform, Identity,
    ReplyAdapter, ReplyProxy, RetryError, ScenarioError, ScenarioHost, ScenarioReport, Stage,
};
use faultline::sim::{LoopbackHost, LoopbackProxy};
use faultline::transport::{Configuration, FactoryRegistry};
use faultline::wire::{InputStream, OutputStream};
use faultline::{TransportError, TransportResult, WireError};

use super::{setup, Setup};

fn config() -> HarnessConfig {
    HarnessConfig {
        platform: HostPlatform::Linux,
        ..HarnessConfig::decorated()
    }
}

/// How the host below departs from [`LoopbackHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Misbehavior {
    /// Proxies ignore connection adapters, so replies over a connection
    /// are dropped.
    NoConnectionAdapter,
    /// Building a proxy decodes its endpoint from a desynchronized stream.
    CorruptEndpoint,
    /// Pings fail decoding a desynchronized endpoint stream.
    CorruptReply,
    /// Payloads above 4000 bytes fail with an I/O error.
    FailLargeSends,
}

struct MisbehavingHost {
    inner: LoopbackHost,
    misbehavior: Misbehavior,
}

struct MisbehavingProxy {
    inner: LoopbackProxy,
    registry: Arc<FactoryRegistry>,
    misbehavior: Misbehavior,
}

/// Encode `endpoint`, overwrite the wrapped type and decode it again.
fn desynchronized(registry: &FactoryRegistry, endpoint: &str) -> TransportError {
    let endpoint = registry.create(endpoint, false).expect("endpoint");
    let mut out = OutputStream::new();
    registry
        .write_endpoint(&mut out, endpoint.as_ref())
        .expect("write");
    let mut bytes = out.into_bytes();
    // wrapped type follows the outer type and encapsulation header
    bytes[8..10].copy_from_slice(&4u16.to_le_bytes());
    match registry.read_endpoint(&mut InputStream::new(&bytes)) {
        Err(error) => error,
        Ok(decoded) => panic!("desynchronized stream decoded as {decoded}"),
    }
}

impl ScenarioHost for MisbehavingHost {
    type Proxy = MisbehavingProxy;

    fn config(&self) -> &HarnessConfig {
        self.inner.config()
    }

    fn faults(&self) -> &Arc<Configuration> {
        self.inner.faults()
    }

    fn reply_adapter(&self) -> &ReplyAdapter {
        self.inner.reply_adapter()
    }

    fn datagram_proxy(&self, endpoint: &str) -> TransportResult<MisbehavingProxy> {
        if self.misbehavior == Misbehavior::CorruptEndpoint {
            return Err(desynchronized(self.inner.registry(), endpoint));
        }
        Ok(MisbehavingProxy {
            inner: self.inner.datagram_proxy(endpoint)?,
            registry: self.inner.registry().clone(),
            misbehavior: self.misbehavior,
        })
    }
}

#[async_trait]
impl DatagramProxy for MisbehavingProxy {
    async fn ping(&self, reply: &ReplyProxy) -> TransportResult<()> {
        if self.misbehavior == Misbehavior::CorruptReply {
            return Err(desynchronized(
                &self.registry,
                &self.inner.endpoint().to_string(),
            ));
        }
        self.inner.ping(reply).await
    }

    async fn send_byte_seq(&self, seq: Vec<u8>, reply: &ReplyProxy) -> TransportResult<()> {
        if self.misbehavior == Misbehavior::FailLargeSends && seq.len() > 4000 {
            return Err(TransportError::Io("network unreachable".to_string()));
        }
        self.inner.send_byte_seq(seq, reply).await
    }

    async fn ping_bidir(&self, identity: &Identity) -> TransportResult<()> {
        self.inner.ping_bidir(identity).await
    }

    async fn close_connection(&self) -> TransportResult<()> {
        self.inner.close_connection().await
    }

    async fn set_connection_adapter(&self, adapter: ReplyAdapter) -> TransportResult<()> {
        if self.misbehavior == Misbehavior::NoConnectionAdapter {
            return Ok(());
        }
        self.inner.set_connection_adapter(adapter).await
    }
}

/// Run the scenario against a misbehaving host built from `setup`.
async fn run_misbehaving(
    setup: Setup,
    misbehavior: Misbehavior,
) -> (Result<ScenarioReport, ScenarioError>, String) {
    let Setup { host, _servers, .. } = setup;
    let host = MisbehavingHost {
        inner: host,
        misbehavior,
    };
    let mut out = Vec::new();
    let result = run_udp_scenario(&host, &mut out).await;
    (result, String::from_utf8(out).expect("utf8 output"))
}

#[tokio::test(start_paused = true)]
async fn test_missing_bidir_replies_fail_the_scenario() {
    let setup = setup(config(), 5).await;

    let (result, output) = run_misbehaving(setup, Misbehavior::NoConnectionAdapter).await;
    assert!(matches!(
        result,
        Err(ScenarioError::Retry {
            stage: Stage::BiDir,
            source: RetryError::Exhausted {
                attempts: 5,
                quorum: 3,
                last_count: 0
            }
        })
    ));
    assert_eq!(
        output,
        "testing udp... ok\ntesting udp multicast... ok\ntesting udp bi-dir connection... "
    );
}

#[tokio::test(start_paused = true)]
async fn test_corrupted_proxy_endpoint_is_protocol_corruption() {
    let setup = setup(config(), 5).await;

    let (result, output) = run_misbehaving(setup, Misbehavior::CorruptEndpoint).await;
    assert!(matches!(
        result,
        Err(ScenarioError::ProtocolCorruption(
            WireError::EndpointTypeMismatch {
                expected: 3,
                found: 4
            }
        ))
    ));
    assert_eq!(output, "testing udp... ");
}

#[tokio::test(start_paused = true)]
async fn test_corruption_during_retry_is_not_retried() {
    let setup = setup(config(), 5).await;

    let (result, output) = run_misbehaving(setup, Misbehavior::CorruptReply).await;
    assert!(matches!(
        result,
        Err(ScenarioError::ProtocolCorruption(
            WireError::EndpointTypeMismatch {
                expected: 3,
                found: 4
            }
        ))
    ));
    assert_eq!(output, "testing udp... ");
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_send_error_fails_capacity() {
    let setup = setup(config(), 5).await;

    let (result, output) = run_misbehaving(setup, Misbehavior::FailLargeSends).await;
    match result {
        Err(ScenarioError::Capacity(CapacityError::Unexpected { size, source })) => {
            assert_eq!(size, 4126);
            assert!(matches!(source, TransportError::Io(_)));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(output, "testing udp... ");
}

#[tokio::test(start_paused = true)]
async fn test_lowered_send_buffer_fails_capacity_below_floor() {
    let setup = setup(config(), 5).await;
    setup.host.faults().set_send_buffer_size(Some(9000));

    let (result, output) = super::run(&setup).await;
    assert!(matches!(
        result,
        Err(ScenarioError::Capacity(CapacityError::BelowFloor {
            last_accepted: Some(8262),
            rejected: 16534,
            floor: 16384
        }))
    ));
    assert_eq!(output, "testing udp... ");
}
