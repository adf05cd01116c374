//! Registry of endpoint factories keyed by endpoint type.

use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{TransportError, TransportResult};
use crate::wire::{InputStream, OutputStream};

use super::{Endpoint, EndpointFactory, OpaqueEndpoint};

/// Enumerable set of endpoint factories.
///
/// Each endpoint type may be registered once. Endpoint strings are resolved
/// by protocol name, encoded endpoints by type.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: RwLock<Vec<Arc<dyn EndpointFactory>>>,
}

impl FactoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateEndpointType` if the type is already taken.
    pub fn add(&self, factory: Arc<dyn EndpointFactory>) -> TransportResult<()> {
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        let endpoint_type = factory.endpoint_type();
        if let Some(existing) = factories.iter().find(|f| f.endpoint_type() == endpoint_type) {
            return Err(TransportError::DuplicateEndpointType {
                endpoint_type,
                protocol: existing.protocol(),
            });
        }
        tracing::debug!(endpoint_type, protocol = %factory.protocol(), "registered endpoint factory");
        factories.push(factory);
        Ok(())
    }

    /// Look up a factory by endpoint type.
    pub fn get(&self, endpoint_type: u16) -> Option<Arc<dyn EndpointFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|f| f.endpoint_type() == endpoint_type)
            .cloned()
    }

    /// Look up a factory by protocol name.
    pub fn find(&self, protocol: &str) -> Option<Arc<dyn EndpointFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|f| f.protocol() == protocol)
            .cloned()
    }

    /// All registered factories, in registration order.
    pub fn factories(&self) -> Vec<Arc<dyn EndpointFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Parse an endpoint string such as `udp -h 127.0.0.1 -p 12010`.
    pub fn create(&self, endpoint: &str, server: bool) -> TransportResult<Arc<dyn Endpoint>> {
        let mut args = split_endpoint_string(endpoint).map_err(|reason| {
            TransportError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason,
            }
        })?;
        if args.is_empty() {
            return Err(TransportError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: "missing protocol".to_string(),
            });
        }
        let protocol = args.remove(0);
        let factory = self
            .find(&protocol)
            .ok_or_else(|| TransportError::UnknownProtocol(protocol.clone()))?;
        factory.create(&args, server)
    }

    /// Encode an endpoint with its leading type.
    pub fn write_endpoint(
        &self,
        out: &mut OutputStream,
        endpoint: &dyn Endpoint,
    ) -> TransportResult<()> {
        endpoint.stream_write(out)?;
        Ok(())
    }

    /// Decode an endpoint written by [`write_endpoint`](Self::write_endpoint).
    ///
    /// Types with no registered factory decode as [`OpaqueEndpoint`], which
    /// re-encodes to the same bytes.
    pub fn read_endpoint(&self, input: &mut InputStream<'_>) -> TransportResult<Arc<dyn Endpoint>> {
        let endpoint_type = input.read_u16()?;
        match self.get(endpoint_type) {
            Some(factory) => {
                input.start_encapsulation()?;
                let endpoint = factory.read(input)?;
                input.end_encapsulation()?;
                Ok(endpoint)
            }
            None => {
                let (encoding, body) = input.skip_encapsulation()?;
                tracing::debug!(endpoint_type, "decoded endpoint of unknown type as opaque");
                Ok(Arc::new(OpaqueEndpoint::new(
                    endpoint_type,
                    encoding,
                    body.to_vec(),
                )))
            }
        }
    }

    /// Destroy every registered factory.
    pub fn destroy(&self) {
        for factory in self.factories() {
            factory.destroy();
        }
    }
}

/// Split an endpoint string on whitespace, honouring double quotes.
///
/// Quotes are removed: `udp -h "ff15::1:1"` yields `["udp", "-h", "ff15::1:1"]`.
pub fn split_endpoint_string(s: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;

    for c in s.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quoted {
        return Err("unterminated quote".to_string());
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}
