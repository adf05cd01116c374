//! Fault-injecting decorator over an arbitrary endpoint factory.
//!
//! [`FaultEndpointFactory`] registers under `TYPE_BASE + t` and protocol
//! `"test-" + p` for a wrapped factory of type `t` and protocol `p`. Its
//! endpoints forward to the wrapped ones, consulting the shared
//! [`Configuration`] on every connect, read and write. Listeners are
//! wrapped too, so replies written over an accepted back channel see the
//! same write faults as client connections.
//!
//! Encoded body of a decorated endpoint:
//! `[wrapped type:2][encapsulation{wrapped body}]`

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use crate::error::{Operation, TransportError, TransportResult};
use crate::wire::{InputStream, OutputStream, WireError};

use super::{
    Configuration, Endpoint, EndpointFactory, FactoryRegistry, FaultSettings, Incoming, Listener,
    ProtocolInstance, Transceiver,
};

/// Offset added to the wrapped factory's type.
pub const TYPE_BASE: u16 = 100;

/// Prefix added to the wrapped factory's protocol name.
pub const PROTOCOL_PREFIX: &str = "test-";

/// Endpoint factory wrapping another one to inject faults.
pub struct FaultEndpointFactory {
    configuration: Arc<Configuration>,
    factory: Arc<dyn EndpointFactory>,
    endpoint_type: u16,
}

/// Type a decorated endpoint of `wrapped` type is registered under.
fn decorated_type(wrapped: u16) -> TransportResult<u16> {
    TYPE_BASE
        .checked_add(wrapped)
        .ok_or(TransportError::EndpointTypeOverflow {
            endpoint_type: wrapped,
        })
}

impl FaultEndpointFactory {
    /// Wrap `factory`, sharing `configuration` with every endpoint built.
    ///
    /// # Errors
    ///
    /// Fails with [`TransportError::EndpointTypeOverflow`] when the wrapped
    /// type plus [`TYPE_BASE`] does not fit in a `u16`.
    pub fn new(
        configuration: Arc<Configuration>,
        factory: Arc<dyn EndpointFactory>,
    ) -> TransportResult<Self> {
        let endpoint_type = decorated_type(factory.endpoint_type())?;
        Ok(Self {
            configuration,
            factory,
            endpoint_type,
        })
    }

    /// Wrap the factory registered for `endpoint_type` and register the result.
    ///
    /// # Errors
    ///
    /// Fails if no factory has that type, if the decorated type overflows,
    /// or if the decorated type is already registered.
    pub fn register(
        registry: &FactoryRegistry,
        endpoint_type: u16,
        configuration: Arc<Configuration>,
    ) -> TransportResult<Arc<Self>> {
        let factory = registry
            .get(endpoint_type)
            .ok_or_else(|| TransportError::UnknownProtocol(format!("type {endpoint_type}")))?;
        let decorated = Arc::new(Self::new(configuration, factory)?);
        registry.add(decorated.clone())?;
        Ok(decorated)
    }

    /// The wrapped factory.
    pub fn wrapped(&self) -> &Arc<dyn EndpointFactory> {
        &self.factory
    }

    fn wrap(&self, endpoint: Arc<dyn Endpoint>) -> TransportResult<Arc<dyn Endpoint>> {
        Ok(Arc::new(FaultEndpoint::new(
            self.configuration.clone(),
            endpoint,
        )?))
    }
}

impl EndpointFactory for FaultEndpointFactory {
    fn endpoint_type(&self) -> u16 {
        self.endpoint_type
    }

    fn protocol(&self) -> String {
        format!("{PROTOCOL_PREFIX}{}", self.factory.protocol())
    }

    fn create(&self, args: &[String], server: bool) -> TransportResult<Arc<dyn Endpoint>> {
        self.wrap(self.factory.create(args, server)?)
    }

    fn read(&self, input: &mut InputStream<'_>) -> TransportResult<Arc<dyn Endpoint>> {
        let found = input.read_u16()?;
        let expected = self.factory.endpoint_type();
        if found != expected {
            tracing::error!(expected, found, "endpoint type mismatch, stream is corrupted");
            return Err(WireError::EndpointTypeMismatch { expected, found }.into());
        }

        input.start_encapsulation()?;
        let endpoint = self.factory.read(input)?;
        input.end_encapsulation()?;
        self.wrap(endpoint)
    }

    fn destroy(&self) {}

    fn clone_for(self: Arc<Self>, _instance: &ProtocolInstance) -> Arc<dyn EndpointFactory> {
        self
    }
}

/// Endpoint wrapping another endpoint to inject faults.
#[derive(Debug)]
pub struct FaultEndpoint {
    configuration: Arc<Configuration>,
    endpoint: Arc<dyn Endpoint>,
    endpoint_type: u16,
}

impl FaultEndpoint {
    /// Wrap `endpoint`.
    ///
    /// # Errors
    ///
    /// Fails with [`TransportError::EndpointTypeOverflow`] when the wrapped
    /// type cannot be offset by [`TYPE_BASE`].
    pub fn new(
        configuration: Arc<Configuration>,
        endpoint: Arc<dyn Endpoint>,
    ) -> TransportResult<Self> {
        let endpoint_type = decorated_type(endpoint.endpoint_type())?;
        Ok(Self {
            configuration,
            endpoint,
            endpoint_type,
        })
    }

    /// The wrapped endpoint.
    pub fn wrapped(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }
}

impl fmt::Display for FaultEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PROTOCOL_PREFIX}{}", self.endpoint)
    }
}

#[async_trait]
impl Endpoint for FaultEndpoint {
    fn endpoint_type(&self) -> u16 {
        self.endpoint_type
    }

    fn protocol(&self) -> String {
        format!("{PROTOCOL_PREFIX}{}", self.endpoint.protocol())
    }

    fn datagram(&self) -> bool {
        self.endpoint.datagram()
    }

    fn write_body(&self, out: &mut OutputStream) -> Result<(), WireError> {
        out.write_u16(self.endpoint.endpoint_type());
        out.start_encapsulation();
        self.endpoint.write_body(out)?;
        out.end_encapsulation()
    }

    async fn connect(&self) -> TransportResult<Arc<dyn Transceiver>> {
        let settings = self.configuration.snapshot();
        inject(&settings, Operation::Connect).await?;

        let transceiver = self.endpoint.connect().await?;
        if let Some(size) = settings.send_buffer_size {
            tracing::debug!(endpoint = %self, size, "applying send buffer override");
            transceiver.set_send_buffer_size(size);
        }
        Ok(Arc::new(FaultTransceiver::new(
            self.configuration.clone(),
            transceiver,
        )))
    }

    async fn listen(&self) -> TransportResult<Box<dyn Listener>> {
        let listener = self.endpoint.listen().await?;
        Ok(Box::new(FaultListener::new(
            self.configuration.clone(),
            listener,
        )))
    }
}

/// Listener whose accepted back channels inject faults.
pub struct FaultListener {
    configuration: Arc<Configuration>,
    listener: Box<dyn Listener>,
}

impl fmt::Debug for FaultListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultListener")
            .field("endpoint", &self.listener.local_endpoint())
            .finish_non_exhaustive()
    }
}

impl FaultListener {
    /// Wrap `listener`.
    pub fn new(configuration: Arc<Configuration>, listener: Box<dyn Listener>) -> Self {
        Self {
            configuration,
            listener,
        }
    }
}

#[async_trait]
impl Listener for FaultListener {
    async fn accept(&mut self) -> TransportResult<Incoming> {
        let incoming = self.listener.accept().await?;
        Ok(Incoming {
            payload: incoming.payload,
            back_channel: Arc::new(FaultTransceiver::new(
                self.configuration.clone(),
                incoming.back_channel,
            )),
        })
    }

    fn local_endpoint(&self) -> String {
        self.listener.local_endpoint()
    }
}

/// Transceiver wrapping another one to inject read and write faults.
#[derive(Debug)]
pub struct FaultTransceiver {
    configuration: Arc<Configuration>,
    transceiver: Arc<dyn Transceiver>,
}

impl FaultTransceiver {
    /// Wrap `transceiver`.
    pub fn new(configuration: Arc<Configuration>, transceiver: Arc<dyn Transceiver>) -> Self {
        Self {
            configuration,
            transceiver,
        }
    }
}

#[async_trait]
impl Transceiver for FaultTransceiver {
    fn protocol(&self) -> String {
        format!("{PROTOCOL_PREFIX}{}", self.transceiver.protocol())
    }

    async fn write(&self, datagram: &[u8]) -> TransportResult<usize> {
        let settings = self.configuration.snapshot();
        inject(&settings, Operation::Write).await?;

        let chance = settings.bit_flip_chance();
        if !datagram.is_empty() && chance > 0.0 && rand::rng().random_bool(chance) {
            let mut corrupted = datagram.to_vec();
            let (byte_idx, bit_idx) = {
                let mut rng = rand::rng();
                (rng.random_range(0..corrupted.len()), rng.random_range(0..8))
            };
            corrupted[byte_idx] ^= 1 << bit_idx;
            tracing::info!(
                bytes = datagram.len(),
                byte_idx,
                bit_idx,
                "BitFlipInjected"
            );
            return self.transceiver.write(&corrupted).await;
        }

        self.transceiver.write(datagram).await
    }

    async fn read(&self) -> TransportResult<Vec<u8>> {
        let settings = self.configuration.snapshot();
        inject(&settings, Operation::Read).await?;
        self.transceiver.read().await
    }

    fn send_buffer_size(&self) -> usize {
        self.transceiver.send_buffer_size()
    }

    fn set_send_buffer_size(&self, size: usize) {
        self.transceiver.set_send_buffer_size(size);
    }

    async fn close(&self) {
        self.transceiver.close().await;
    }
}

/// Apply the delay and forced failure configured for `operation`.
async fn inject(settings: &FaultSettings, operation: Operation) -> TransportResult<()> {
    let (delay, fail) = match operation {
        Operation::Connect => (settings.connect_delay, settings.connect_failure),
        Operation::Read => (settings.read_delay, settings.read_failure),
        Operation::Write => (settings.write_delay, settings.write_failure),
    };

    if !delay.is_zero() {
        tracing::trace!(%operation, ?delay, "injecting delay");
        tokio::time::sleep(delay).await;
    }
    if fail {
        tracing::warn!(%operation, "injecting failure");
        return Err(TransportError::InjectedFailure { operation });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sim::{loopback_registry, LoopbackConfig, LoopbackEndpointFactory, LoopbackNetwork};

    fn setup() -> (Arc<Configuration>, FactoryRegistry) {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
        let faults = Configuration::shared();
        let network = LoopbackNetwork::new(LoopbackConfig::default());
        let registry = loopback_registry(&network, faults.clone()).expect("registry");
        (faults, registry)
    }

    #[test]
    fn test_type_and_protocol_are_offset() {
        let network = LoopbackNetwork::new(LoopbackConfig::default());
        let factory = FaultEndpointFactory::new(
            Configuration::shared(),
            Arc::new(LoopbackEndpointFactory::new(network)),
        )
        .expect("factory");
        assert_eq!(factory.endpoint_type(), 103);
        assert_eq!(factory.protocol(), "test-udp");
        assert_eq!(factory.wrapped().endpoint_type(), 3);
    }

    #[test]
    fn test_types_past_u16_range_are_rejected() {
        let (faults, registry) = setup();
        let network = LoopbackNetwork::new(LoopbackConfig::default());
        let high = Arc::new(LoopbackEndpointFactory::new(network))
            .clone_for(&ProtocolInstance::new(65500, "udp-high"));
        registry.add(high.clone()).expect("add");

        assert!(matches!(
            FaultEndpointFactory::register(&registry, 65500, faults.clone()),
            Err(TransportError::EndpointTypeOverflow {
                endpoint_type: 65500
            })
        ));
        assert!(matches!(
            FaultEndpointFactory::new(faults, high),
            Err(TransportError::EndpointTypeOverflow {
                endpoint_type: 65500
            })
        ));
        assert!(registry.get(65500).is_some());
    }

    #[test]
    fn test_register_rejects_duplicates_and_unknown_types() {
        let (faults, registry) = setup();
        assert!(matches!(
            FaultEndpointFactory::register(&registry, 3, faults.clone()),
            Err(TransportError::DuplicateEndpointType {
                endpoint_type: 103,
                ..
            })
        ));
        assert!(matches!(
            FaultEndpointFactory::register(&registry, 42, faults),
            Err(TransportError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn test_clone_for_returns_same_factory() {
        let (_faults, registry) = setup();
        let factory = registry.get(103).expect("decorated factory");
        let cloned = factory
            .clone()
            .clone_for(&ProtocolInstance::new(103, "test-udp"));
        assert!(std::ptr::eq(
            Arc::as_ptr(&factory) as *const (),
            Arc::as_ptr(&cloned) as *const ()
        ));
    }

    #[test]
    fn test_decorated_endpoint_round_trip() {
        let (_faults, registry) = setup();
        let endpoint = registry
            .create("test-udp -h 127.0.0.1 -p 12010", false)
            .expect("endpoint");
        assert_eq!(endpoint.to_string(), "test-udp -h 127.0.0.1 -p 12010");
        assert!(endpoint.datagram());

        let mut out = OutputStream::new();
        registry
            .write_endpoint(&mut out, endpoint.as_ref())
            .expect("write");
        let bytes = out.into_bytes();
        assert_eq!(&bytes[..2], &103u16.to_le_bytes());
        // inner type follows the outer 6-byte encapsulation header
        assert_eq!(&bytes[8..10], &3u16.to_le_bytes());

        let mut input = InputStream::new(&bytes);
        let decoded = registry.read_endpoint(&mut input).expect("read");
        assert_eq!(input.remaining(), 0);
        assert_eq!(decoded.endpoint_type(), 103);
        assert_eq!(decoded.to_string(), endpoint.to_string());

        let mut again = OutputStream::new();
        registry
            .write_endpoint(&mut again, decoded.as_ref())
            .expect("rewrite");
        assert_eq!(again.into_bytes(), bytes);
    }

    #[test]
    fn test_inner_type_mismatch_is_corruption() {
        let (_faults, registry) = setup();
        let mut out = OutputStream::new();
        out.write_u16(103);
        out.start_encapsulation();
        out.write_u16(7);
        out.start_encapsulation();
        out.write_string("127.0.0.1");
        out.write_i32(12010);
        out.end_encapsulation().expect("inner");
        out.end_encapsulation().expect("outer");

        let bytes = out.into_bytes();
        let result = registry.read_endpoint(&mut InputStream::new(&bytes));
        match result {
            Err(error) => {
                assert!(error.is_protocol_corruption());
                assert!(matches!(
                    error,
                    TransportError::Wire(WireError::EndpointTypeMismatch {
                        expected: 3,
                        found: 7
                    })
                ));
            }
            Ok(endpoint) => panic!("mismatched stream decoded as {endpoint}"),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_injected() {
        let (faults, registry) = setup();
        let endpoint = registry
            .create("test-udp -p 12010", false)
            .expect("endpoint");

        faults.set_connect_failure(true);
        assert!(matches!(
            endpoint.connect().await,
            Err(TransportError::InjectedFailure {
                operation: Operation::Connect
            })
        ));

        faults.set_connect_failure(false);
        assert!(endpoint.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_write_failure_applies_to_open_connections() {
        let (faults, registry) = setup();
        let endpoint = registry
            .create("test-udp -p 12010", true)
            .expect("endpoint");
        let mut listener = endpoint.listen().await.expect("listen");
        let conn = endpoint.connect().await.expect("connect");
        assert_eq!(conn.protocol(), "test-udp");

        faults.set_write_failure(true);
        assert!(matches!(
            conn.write(b"dropped").await,
            Err(TransportError::InjectedFailure {
                operation: Operation::Write
            })
        ));

        faults.set_write_failure(false);
        conn.write(b"sent").await.expect("write");
        assert_eq!(listener.accept().await.expect("accept").payload, b"sent");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_delay_is_injected() {
        let (faults, registry) = setup();
        let endpoint = registry
            .create("test-udp -p 12010", true)
            .expect("endpoint");
        let mut listener = endpoint.listen().await.expect("listen");
        let conn = endpoint.connect().await.expect("connect");
        conn.write(b"ping").await.expect("write");
        let incoming = listener.accept().await.expect("accept");
        incoming.back_channel.write(b"pong").await.expect("reply");

        faults.set_read_delay(Duration::from_millis(250));
        let start = tokio::time::Instant::now();
        assert_eq!(conn.read().await.expect("read"), b"pong");
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_send_buffer_override_applies_on_connect() {
        let (faults, registry) = setup();
        let endpoint = registry
            .create("test-udp -p 12010", false)
            .expect("endpoint");

        let before = endpoint.connect().await.expect("connect");
        assert_eq!(before.send_buffer_size(), 65507);

        faults.set_send_buffer_size(Some(1000));
        let after = endpoint.connect().await.expect("connect");
        assert_eq!(after.send_buffer_size(), 1000);
        assert!(matches!(
            after.write(&[0u8; 1001]).await,
            Err(TransportError::DatagramLimit {
                size: 1001,
                limit: 1000
            })
        ));
        // connections opened earlier keep their size
        assert_eq!(before.send_buffer_size(), 65507);
    }

    #[tokio::test]
    async fn test_bit_flip_changes_exactly_one_bit() {
        let (faults, registry) = setup();
        let endpoint = registry
            .create("test-udp -p 12010", true)
            .expect("endpoint");
        let mut listener = endpoint.listen().await.expect("listen");
        let conn = endpoint.connect().await.expect("connect");

        faults.set_bit_flip_probability(1.0);
        let sent = [0u8; 32];
        assert_eq!(conn.write(&sent).await.expect("write"), 32);

        let received = listener.accept().await.expect("accept").payload;
        assert_eq!(received.len(), sent.len());
        let flipped: u32 = received.iter().map(|b| b.count_ones()).sum();
        assert_eq!(flipped, 1);
    }

    #[tokio::test]
    async fn test_back_channel_write_failure_is_injected() {
        let (faults, registry) = setup();
        let endpoint = registry
            .create("test-udp -p 12010", true)
            .expect("endpoint");
        let mut listener = endpoint.listen().await.expect("listen");
        let conn = endpoint.connect().await.expect("connect");
        conn.write(b"ping").await.expect("write");
        let incoming = listener.accept().await.expect("accept");
        assert_eq!(incoming.back_channel.protocol(), "test-udp");

        faults.set_write_failure(true);
        assert!(matches!(
            incoming.back_channel.write(b"pong").await,
            Err(TransportError::InjectedFailure {
                operation: Operation::Write
            })
        ));

        faults.set_write_failure(false);
        incoming.back_channel.write(b"pong").await.expect("reply");
        assert_eq!(conn.read().await.expect("read"), b"pong");
    }

    #[tokio::test]
    async fn test_back_channel_bit_flip_reaches_client() {
        let (faults, registry) = setup();
        let endpoint = registry
            .create("test-udp -p 12010", true)
            .expect("endpoint");
        let mut listener = endpoint.listen().await.expect("listen");
        let conn = endpoint.connect().await.expect("connect");
        conn.write(b"ping").await.expect("write");
        let incoming = listener.accept().await.expect("accept");

        faults.set_bit_flip_probability(1.0);
        incoming.back_channel.write(&[0u8; 8]).await.expect("reply");
        let received = conn.read().await.expect("read");
        let flipped: u32 = received.iter().map(|b| b.count_ones()).sum();
        assert_eq!(flipped, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_flip_probability_does_not_panic() {
        let (faults, registry) = setup();
        let endpoint = registry
            .create("test-udp -p 12010", true)
            .expect("endpoint");
        let mut listener = endpoint.listen().await.expect("listen");
        let conn = endpoint.connect().await.expect("connect");

        faults.update(|s| s.bit_flip_probability = 1.5);
        conn.write(&[0u8; 4]).await.expect("write");
        let received = listener.accept().await.expect("accept").payload;
        let flipped: u32 = received.iter().map(|b| b.count_ones()).sum();
        assert_eq!(flipped, 1);

        faults.update(|s| s.bit_flip_probability = f64::NAN);
        conn.write(b"x").await.expect("write");
        assert_eq!(listener.accept().await.expect("accept").payload, b"x");
    }
}
