//! In-process datagram network the harness runs on.
//!
//! [`LoopbackNetwork`] routes datagrams between endpoints created by
//! [`LoopbackEndpointFactory`]. [`TestServer`] answers the scenario's
//! requests and [`LoopbackHost`] is the client side handed to
//! [`run_udp_scenario`](crate::harness::run_udp_scenario).

mod endpoint;
mod host;
mod network;
mod protocol;
mod server;

pub use endpoint::{
    LoopbackEndpoint, LoopbackEndpointFactory, LoopbackListener, LoopbackTransceiver, UDP_TYPE,
};
pub use host::{loopback_registry, LoopbackHost, LoopbackProxy, SERVER_RECV_BUFFER_SIZE};
pub use network::{LoopbackConfig, LoopbackNetwork, NetworkStats, MAX_DATAGRAM_SIZE};
pub use protocol::Message;
pub use server::TestServer;
