//! Transport abstraction: endpoint factories, endpoints and transceivers.
//!
//! The traits here are the seam the fault decorator wraps. A concrete
//! transport provides an [`EndpointFactory`] that parses and decodes
//! [`Endpoint`]s; connecting an endpoint yields a datagram [`Transceiver`],
//! listening on one yields a [`Listener`].

mod config;
mod decorator;
mod opaque;
mod registry;

pub use config::{CallbackId, Configuration, FaultSettings};
pub use decorator::{
    FaultEndpoint, FaultEndpointFactory, FaultListener, FaultTransceiver, PROTOCOL_PREFIX,
    TYPE_BASE,
};
pub use opaque::OpaqueEndpoint;
pub use registry::{split_endpoint_string, FactoryRegistry};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportResult;
use crate::wire::{InputStream, OutputStream, WireError};

/// Protocol identity a factory is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInstance {
    /// Numeric endpoint type.
    pub endpoint_type: u16,
    /// Protocol name used in endpoint strings.
    pub protocol: String,
}

impl ProtocolInstance {
    /// Create a protocol instance.
    pub fn new(endpoint_type: u16, protocol: impl Into<String>) -> Self {
        Self {
            endpoint_type,
            protocol: protocol.into(),
        }
    }
}

/// Builds and decodes endpoints of one transport type.
pub trait EndpointFactory: Send + Sync {
    /// Numeric type, unique within a [`FactoryRegistry`].
    fn endpoint_type(&self) -> u16;

    /// Protocol name used in endpoint strings.
    fn protocol(&self) -> String;

    /// Build an endpoint from parsed endpoint-string arguments.
    fn create(&self, args: &[String], server: bool) -> TransportResult<Arc<dyn Endpoint>>;

    /// Decode an endpoint body.
    ///
    /// The registry has already consumed the leading type and entered the
    /// enclosing encapsulation.
    fn read(&self, input: &mut InputStream<'_>) -> TransportResult<Arc<dyn Endpoint>>;

    /// Release resources owned by the factory.
    fn destroy(&self);

    /// Factory to use for another protocol instance.
    fn clone_for(self: Arc<Self>, instance: &ProtocolInstance) -> Arc<dyn EndpointFactory>;
}

/// An addressable transport binding.
#[async_trait]
pub trait Endpoint: fmt::Debug + fmt::Display + Send + Sync {
    /// Numeric type written ahead of the encoded endpoint.
    fn endpoint_type(&self) -> u16;

    /// Protocol name.
    fn protocol(&self) -> String;

    /// Whether the endpoint carries datagrams.
    fn datagram(&self) -> bool;

    /// Encode the type-specific body.
    fn write_body(&self, out: &mut OutputStream) -> Result<(), WireError>;

    /// Encode the endpoint: `[type:2][encapsulation{body}]`.
    fn stream_write(&self, out: &mut OutputStream) -> Result<(), WireError> {
        out.write_u16(self.endpoint_type());
        out.start_encapsulation();
        self.write_body(out)?;
        out.end_encapsulation()
    }

    /// Open an outgoing connection.
    async fn connect(&self) -> TransportResult<Arc<dyn Transceiver>>;

    /// Start receiving datagrams addressed to this endpoint.
    async fn listen(&self) -> TransportResult<Box<dyn Listener>>;
}

/// A connection carrying whole datagrams.
#[async_trait]
pub trait Transceiver: fmt::Debug + Send + Sync {
    /// Protocol name of the transport underneath.
    fn protocol(&self) -> String;

    /// Send one datagram, returning the number of bytes sent.
    async fn write(&self, datagram: &[u8]) -> TransportResult<usize>;

    /// Receive the next datagram sent back over this connection.
    async fn read(&self) -> TransportResult<Vec<u8>>;

    /// Current send buffer size; larger datagrams are rejected.
    fn send_buffer_size(&self) -> usize;

    /// Override the send buffer size.
    fn set_send_buffer_size(&self, size: usize);

    /// Close the connection. Pending and future reads fail.
    async fn close(&self);
}

/// A datagram received by a [`Listener`].
#[derive(Debug)]
pub struct Incoming {
    /// Datagram payload.
    pub payload: Vec<u8>,
    /// Writes back over the connection the datagram arrived on.
    pub back_channel: Arc<dyn Transceiver>,
}

/// Receiving side of an endpoint.
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next datagram.
    async fn accept(&mut self) -> TransportResult<Incoming>;

    /// Display form of the endpoint being listened on.
    fn local_endpoint(&self) -> String;
}
