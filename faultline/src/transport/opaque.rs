//! Endpoint of a type no registered factory understands.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{TransportError, TransportResult};
use crate::wire::{EncodingVersion, OutputStream, WireError};

use super::{Endpoint, Listener, Transceiver};

/// Raw endpoint body kept verbatim so it can be forwarded unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueEndpoint {
    endpoint_type: u16,
    encoding: EncodingVersion,
    body: Vec<u8>,
}

impl OpaqueEndpoint {
    /// Wrap an undecoded endpoint body.
    pub fn new(endpoint_type: u16, encoding: EncodingVersion, body: Vec<u8>) -> Self {
        Self {
            endpoint_type,
            encoding,
            body,
        }
    }

    /// The undecoded body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

impl fmt::Display for OpaqueEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "opaque -t {} -e {} -v ", self.endpoint_type, self.encoding)?;
        for b in &self.body {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[async_trait]
impl Endpoint for OpaqueEndpoint {
    fn endpoint_type(&self) -> u16 {
        self.endpoint_type
    }

    fn protocol(&self) -> String {
        "opaque".to_string()
    }

    fn datagram(&self) -> bool {
        false
    }

    fn write_body(&self, out: &mut OutputStream) -> Result<(), WireError> {
        out.write_raw(&self.body);
        Ok(())
    }

    fn stream_write(&self, out: &mut OutputStream) -> Result<(), WireError> {
        out.write_u16(self.endpoint_type);
        out.start_encapsulation_with(self.encoding);
        self.write_body(out)?;
        out.end_encapsulation()
    }

    async fn connect(&self) -> TransportResult<Arc<dyn Transceiver>> {
        Err(TransportError::ConnectionRefused {
            endpoint: self.to_string(),
        })
    }

    async fn listen(&self) -> TransportResult<Box<dyn Listener>> {
        Err(TransportError::ConnectionRefused {
            endpoint: self.to_string(),
        })
    }
}
