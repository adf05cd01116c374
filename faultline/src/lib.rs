//! # faultline
//!
//! Fault injection for datagram transports, and a harness that checks a
//! transport's delivery semantics under loss.
//!
//! ## Fault injection
//!
//! [`FaultEndpointFactory`] decorates any [`EndpointFactory`]. A wrapped
//! factory of type `t` and protocol `p` is registered again as type
//! `100 + t` and protocol `test-p`, so an endpoint string such as
//! `test-udp -h 127.0.0.1 -p 12010` goes through the decorator while the
//! transport underneath is untouched.
//!
//! | Fault | Setting | Default |
//! |-------|---------|---------|
//! | Connect delay / failure | `connect_delay`, `connect_failure` | none |
//! | Read delay / failure | `read_delay`, `read_failure` | none |
//! | Write delay / failure | `write_delay`, `write_failure` | none |
//! | Bit flip on write | `bit_flip_probability` | 0 |
//! | Send buffer override | `send_buffer_size` | transport default |
//!
//! Settings live in a shared [`Configuration`] and are read on every
//! operation, so they can be changed while connections are open.
//!
//! ## Harness
//!
//! - [`ReplyCollector`](harness::ReplyCollector): quorum wait with a deadline
//! - [`RetryController`](harness::RetryController): bounded retries, a fresh
//!   reply identity per attempt
//! - [`CapacityProbe`](harness::CapacityProbe): doubling search for the
//!   datagram size limit
//! - [`run_udp_scenario`](harness::run_udp_scenario): unicast, capacity,
//!   multicast and bidirectional sections
//!
//! ## Quick start
//!
//! ```no_run
//! use faultline::harness::{run_udp_scenario, HarnessConfig};
//! use faultline::sim::{LoopbackConfig, LoopbackHost, LoopbackNetwork};
//! use faultline::transport::Configuration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let network = LoopbackNetwork::new(LoopbackConfig::lossy(42, 0.05));
//! let config = HarnessConfig::decorated();
//! let host = LoopbackHost::start(network, config.clone(), Configuration::shared()).await?;
//! let _servers = host.start_servers(config.multicast_quorum).await?;
//!
//! let report = run_udp_scenario(&host, &mut std::io::stdout()).await?;
//! println!("{report:?}");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Error types shared by the transport layer.
pub mod error;

/// Reliability harness and the datagram scenario.
pub mod harness;

/// In-process datagram network, test server and scenario host.
pub mod sim;

/// Endpoint factories, endpoints, and the fault decorator.
pub mod transport;

/// Little-endian wire codec with encapsulations.
pub mod wire;

pub use error::{Operation, TransportError, TransportResult};
pub use transport::{
    Configuration, Endpoint, EndpointFactory, FactoryRegistry, FaultEndpointFactory,
    FaultSettings, Transceiver,
};
pub use wire::WireError;
