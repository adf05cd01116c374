//! Error types for the transport layer.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::wire::WireError;

/// Transport operation a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Establishing an outgoing connection.
    Connect,
    /// Reading a datagram from a connection.
    Read,
    /// Writing a datagram to a connection.
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Connect => f.write_str("connect"),
            Operation::Read => f.write_str("read"),
            Operation::Write => f.write_str("write"),
        }
    }
}

/// Errors raised by endpoints, transceivers and the factory registry.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Datagram is larger than the connection's send buffer.
    #[error("datagram limit exceeded: {size} bytes (limit {limit})")]
    DatagramLimit {
        /// Encoded datagram size in bytes.
        size: usize,
        /// Send buffer size in effect.
        limit: usize,
    },

    /// Failure forced by the fault configuration.
    #[error("injected {operation} failure")]
    InjectedFailure {
        /// Operation the failure was injected into.
        operation: Operation,
    },

    /// Connection was closed locally or by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Endpoint cannot be connected to.
    #[error("connection refused: {endpoint}")]
    ConnectionRefused {
        /// Display form of the endpoint.
        endpoint: String,
    },

    /// No factory is registered for the protocol name.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// A factory is already registered for this endpoint type.
    #[error("endpoint type {endpoint_type} already registered by {protocol}")]
    DuplicateEndpointType {
        /// The colliding endpoint type.
        endpoint_type: u16,
        /// Protocol of the factory already holding the type.
        protocol: String,
    },

    /// Decorating a factory would push its type past `u16::MAX`.
    #[error("endpoint type {endpoint_type} cannot be decorated")]
    EndpointTypeOverflow {
        /// Type of the factory being wrapped.
        endpoint_type: u16,
    },

    /// Endpoint string could not be parsed.
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint {
        /// The offending endpoint string.
        endpoint: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Encoding or decoding failed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::Io(error.to_string())
    }
}

impl TransportError {
    /// Whether this is the decoder reporting a desynchronized stream.
    pub fn is_protocol_corruption(&self) -> bool {
        matches!(
            self,
            TransportError::Wire(WireError::EndpointTypeMismatch { .. })
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
