//! The datagram reliability scenario.
//!
//! Sections, in order:
//!
//! 1. **udp**: three pings, quorum 3, retried.
//! 2. **capacity**: doubling growth until the datagram limit, then an
//!    oversized payload that must go unanswered (skipped with compression).
//! 3. **multicast**: one ping to the group, quorum 5; a miss is a warning
//!    unless [`MulticastSeverity::Fail`] is configured.
//! 4. **bi-dir**: the reply adapter is attached to the open connections and
//!    three `ping_bidir` replies must come back over them.
//!
//! Sections 3 and 4 are skipped on Android.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{TransportError, TransportResult};
use crate::transport::Configuration;
use crate::wire::WireError;

use super::capacity::{CapacityError, CapacityReport};
use super::config::{HarnessConfig, HostPlatform, MulticastSeverity};
use super::reply::{Identity, ReplyAdapter, ReplyProxy};
use super::retry::{RetryController, RetryError};

/// Environment the scenario runs in.
pub trait ScenarioHost: Send + Sync {
    /// Proxy type returned by [`datagram_proxy`](Self::datagram_proxy).
    type Proxy: DatagramProxy;

    /// Scenario parameters.
    fn config(&self) -> &HarnessConfig;

    /// Fault configuration shared with decorated endpoints.
    fn faults(&self) -> &Arc<Configuration>;

    /// Adapter replies are dispatched through.
    fn reply_adapter(&self) -> &ReplyAdapter;

    /// Datagram proxy to the test object at `endpoint`.
    ///
    /// The connection is opened lazily by the first call.
    fn datagram_proxy(&self, endpoint: &str) -> TransportResult<Self::Proxy>;
}

/// Operations of the remote test object.
#[async_trait]
pub trait DatagramProxy: Send + Sync {
    /// Ask the server to call back `reply`.
    async fn ping(&self, reply: &ReplyProxy) -> TransportResult<()>;

    /// Send `seq`; the server calls back `reply` when it receives it.
    async fn send_byte_seq(&self, seq: Vec<u8>, reply: &ReplyProxy) -> TransportResult<()>;

    /// Ask the server to reply to `identity` over this connection.
    async fn ping_bidir(&self, identity: &Identity) -> TransportResult<()>;

    /// Close the current connection; the next call opens a new one.
    async fn close_connection(&self) -> TransportResult<()>;

    /// Dispatch replies arriving on this proxy's connection through `adapter`.
    async fn set_connection_adapter(&self, adapter: ReplyAdapter) -> TransportResult<()>;
}

/// Scenario section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Unicast pings.
    Udp,
    /// Capacity probe.
    Capacity,
    /// Multicast ping.
    Multicast,
    /// Bidirectional replies.
    BiDir,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Udp => f.write_str("udp"),
            Stage::Capacity => f.write_str("capacity"),
            Stage::Multicast => f.write_str("multicast"),
            Stage::BiDir => f.write_str("bi-dir"),
        }
    }
}

/// Hard scenario failures.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// Decoded stream was desynchronized.
    #[error("protocol corruption: {0}")]
    ProtocolCorruption(WireError),

    /// A quorum round failed.
    #[error("{stage}: {source}")]
    Retry {
        /// Section that failed.
        stage: Stage,
        /// Retry failure.
        #[source]
        source: RetryError,
    },

    /// Capacity probe failed.
    #[error("capacity: {0}")]
    Capacity(#[from] CapacityError),

    /// Multicast group unreachable with [`MulticastSeverity::Fail`].
    #[error("multicast quorum not reached after {attempts} attempts (last count {last_count})")]
    MulticastUnreachable {
        /// Attempts made.
        attempts: u32,
        /// Replies counted in the final attempt.
        last_count: usize,
    },

    /// Transport error outside a quorum round.
    #[error("{stage}: unexpected transport error: {source}")]
    Transport {
        /// Section that failed.
        stage: Stage,
        /// The transport error.
        #[source]
        source: TransportError,
    },

    /// Writing progress to the output sink failed.
    #[error("output error: {0}")]
    Output(#[from] std::io::Error),
}

impl ScenarioError {
    fn transport(stage: Stage, source: TransportError) -> Self {
        match source {
            TransportError::Wire(wire @ WireError::EndpointTypeMismatch { .. }) => {
                ScenarioError::ProtocolCorruption(wire)
            }
            source => ScenarioError::Transport { stage, source },
        }
    }

    fn retry(stage: Stage, source: RetryError) -> Self {
        match source {
            RetryError::Probe { source, .. } if source.is_protocol_corruption() => {
                Self::transport(stage, source)
            }
            source => ScenarioError::Retry { stage, source },
        }
    }
}

/// Result of the multicast section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastOutcome {
    /// Quorum met on the given attempt.
    Reached {
        /// 1-based attempt.
        attempts: u32,
    },
    /// Quorum missed, downgraded to a warning.
    Unreachable {
        /// Attempts made.
        attempts: u32,
        /// Replies counted in the final attempt.
        last_count: usize,
    },
    /// Section not run on this platform.
    Skipped,
}

/// What the scenario observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    /// Attempt on which the unicast quorum was met.
    pub udp_attempts: u32,
    /// Capacity probe result, unless skipped.
    pub capacity: Option<CapacityReport>,
    /// Multicast section result.
    pub multicast: MulticastOutcome,
    /// Attempt on which the bidirectional quorum was met, unless skipped.
    pub bidir_attempts: Option<u32>,
}

/// Run every section against `host`, writing progress to `out`.
pub async fn run_udp_scenario<H, W>(host: &H, out: &mut W) -> Result<ScenarioReport, ScenarioError>
where
    H: ScenarioHost,
    W: Write + Send,
{
    let config = host.config();
    let adapter = host.reply_adapter();
    let retry = RetryController::new(config.retry.clone());
    let quorum = config.unicast_quorum;
    let mut target = adapter.register();

    write!(out, "testing udp... ")?;
    out.flush()?;
    let obj = host
        .datagram_proxy(&config.server_endpoint())
        .map_err(|e| ScenarioError::transport(Stage::Udp, e))?;
    let udp_attempts = retry
        .run(adapter, &mut target, quorum, |reply| {
            let obj = &obj;
            async move {
                for _ in 0..quorum {
                    obj.ping(&reply).await?;
                }
                Ok::<(), TransportError>(())
            }
        })
        .await
        .map_err(|e| ScenarioError::retry(Stage::Udp, e))?;
    tracing::info!(attempts = udp_attempts, "udp quorum reached");

    let capacity = if config.compress {
        tracing::info!("compression enabled, skipping capacity probe");
        None
    } else {
        let send = |seq: Vec<u8>, reply: ReplyProxy| {
            let obj = &obj;
            async move { obj.send_byte_seq(seq, &reply).await }
        };
        let report = config.capacity.discover(&target, send).await?;
        tracing::info!(?report, "datagram limit discovered");

        obj.close_connection()
            .await
            .map_err(|e| ScenarioError::transport(Stage::Capacity, e))?;
        host.faults()
            .set_send_buffer_size(Some(config.capacity.send_buffer_ceiling));
        // growth payloads may still be answered; keep them off the check
        target = adapter.replace(&target);
        config.capacity.verify_oversized_dropped(&target, send).await?;
        Some(report)
    };
    writeln!(out, "ok")?;

    if config.platform == HostPlatform::Android {
        return Ok(ScenarioReport {
            udp_attempts,
            capacity,
            multicast: MulticastOutcome::Skipped,
            bidir_attempts: None,
        });
    }

    write!(out, "testing udp multicast... ")?;
    out.flush()?;
    let multicast_endpoint = config.multicast_endpoint();
    let mcast = host
        .datagram_proxy(&multicast_endpoint)
        .map_err(|e| ScenarioError::transport(Stage::Multicast, e))?;
    let multicast = match retry
        .run(adapter, &mut target, config.multicast_quorum, |reply| {
            let mcast = &mcast;
            async move { mcast.ping(&reply).await }
        })
        .await
    {
        Ok(attempts) => {
            writeln!(out, "ok")?;
            MulticastOutcome::Reached { attempts }
        }
        Err(RetryError::Exhausted {
            attempts,
            last_count,
            ..
        }) => match config.multicast_severity {
            MulticastSeverity::Warn => {
                tracing::warn!(
                    endpoint = %multicast_endpoint,
                    attempts,
                    last_count,
                    "multicast quorum not reached"
                );
                writeln!(out, "failed (is a firewall enabled?)")?;
                MulticastOutcome::Unreachable {
                    attempts,
                    last_count,
                }
            }
            MulticastSeverity::Fail => {
                return Err(ScenarioError::MulticastUnreachable {
                    attempts,
                    last_count,
                })
            }
        },
        Err(e) => return Err(ScenarioError::retry(Stage::Multicast, e)),
    };

    write!(out, "testing udp bi-dir connection... ")?;
    out.flush()?;
    obj.set_connection_adapter(adapter.clone())
        .await
        .map_err(|e| ScenarioError::transport(Stage::BiDir, e))?;
    mcast
        .set_connection_adapter(adapter.clone())
        .await
        .map_err(|e| ScenarioError::transport(Stage::BiDir, e))?;
    let bidir_attempts = retry
        .run(adapter, &mut target, quorum, |reply| {
            let obj = &obj;
            async move {
                for _ in 0..quorum {
                    obj.ping_bidir(&reply.identity).await?;
                }
                Ok::<(), TransportError>(())
            }
        })
        .await
        .map_err(|e| ScenarioError::retry(Stage::BiDir, e))?;
    writeln!(out, "ok")?;

    Ok(ScenarioReport {
        udp_attempts,
        capacity,
        multicast,
        bidir_attempts: Some(bidir_attempts),
    })
}
