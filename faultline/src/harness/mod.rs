//! Reliability harness for datagram transports.
//!
//! - [`ReplyCollector`]: counts asynchronous replies and waits for a quorum
//! - [`ReplyAdapter`]: identity registry replies are dispatched through
//! - [`RetryController`]: bounded quorum rounds with a fresh target per round
//! - [`CapacityProbe`]: doubling search for the datagram size limit
//! - [`run_udp_scenario`]: unicast, capacity, multicast and bidirectional sections

mod capacity;
mod config;
mod reply;
mod retry;
mod scenario;

pub use capacity::{CapacityError, CapacityProbe, CapacityReport};
pub use config::{HarnessConfig, HostPlatform, MulticastSeverity};
pub use reply::{Identity, ReplyAdapter, ReplyCollector, ReplyProxy, ReplyTarget};
pub use retry::{RetryController, RetryError, RetryPolicy};
pub use scenario::{
    run_udp_scenario, DatagramProxy, MulticastOutcome, ScenarioError, ScenarioHost,
    ScenarioReport, Stage,
};
