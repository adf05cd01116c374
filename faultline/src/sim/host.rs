//! Scenario host over a loopback network.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::{TransportError, TransportResult};
use crate::harness::{
    DatagramProxy, HarnessConfig, Identity, ReplyAdapter, ReplyProxy, ScenarioHost,
};
use crate::transport::{
    Configuration, Endpoint, EndpointFactory, FactoryRegistry, FaultEndpointFactory, Listener,
    Transceiver,
};

use super::endpoint::{LoopbackEndpointFactory, UDP_TYPE};
use super::network::LoopbackNetwork;
use super::protocol::Message;
use super::server::TestServer;

/// Receive buffer of the unicast test server. Smaller than the oversized
/// payload so that payload is dropped on arrival.
pub const SERVER_RECV_BUFFER_SIZE: usize = 16384;

/// Registry holding the `udp` factory and its `test-udp` decoration.
pub fn loopback_registry(
    network: &LoopbackNetwork,
    faults: Arc<Configuration>,
) -> TransportResult<FactoryRegistry> {
    let registry = FactoryRegistry::new();
    let udp: Arc<dyn EndpointFactory> = Arc::new(LoopbackEndpointFactory::new(network.clone()));
    registry.add(udp)?;
    FaultEndpointFactory::register(&registry, UDP_TYPE, faults)?;
    Ok(registry)
}

/// Client side of the scenario: registry, reply adapter and proxies.
pub struct LoopbackHost {
    config: HarnessConfig,
    network: LoopbackNetwork,
    faults: Arc<Configuration>,
    registry: Arc<FactoryRegistry>,
    adapter: ReplyAdapter,
    dispatcher: JoinHandle<()>,
}

impl fmt::Debug for LoopbackHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackHost")
            .field("config", &self.config)
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

impl LoopbackHost {
    /// Build the registry and start receiving replies on the reply endpoint.
    pub async fn start(
        network: LoopbackNetwork,
        config: HarnessConfig,
        faults: Arc<Configuration>,
    ) -> TransportResult<Self> {
        let registry = Arc::new(loopback_registry(&network, faults.clone())?);
        let endpoint = registry.create(&config.reply_endpoint(), true)?;
        let listener = endpoint.listen().await?;
        let adapter = ReplyAdapter::new(endpoint);
        let dispatcher = tokio::spawn(dispatch_replies(
            registry.clone(),
            adapter.clone(),
            listener,
        ));
        tracing::info!(endpoint = %adapter.endpoint(), "reply adapter active");

        Ok(Self {
            config,
            network,
            faults,
            registry,
            adapter,
            dispatcher,
        })
    }

    /// Start the unicast server and `multicast_receivers` group members.
    pub async fn start_servers(
        &self,
        multicast_receivers: usize,
    ) -> TransportResult<Vec<TestServer>> {
        self.network.set_recv_buffer_size(
            &self.config.host,
            self.config.server_port,
            SERVER_RECV_BUFFER_SIZE,
        );
        let unicast = TestServer::start(self.registry.clone(), &self.config.server_endpoint()).await?;
        let mut servers = vec![unicast];
        let group = self.config.multicast_endpoint();
        for _ in 0..multicast_receivers {
            servers.push(TestServer::start(self.registry.clone(), &group).await?);
        }
        Ok(servers)
    }

    /// Factory registry shared by the host and its servers.
    pub fn registry(&self) -> &Arc<FactoryRegistry> {
        &self.registry
    }

    /// The network the host runs on.
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }
}

impl Drop for LoopbackHost {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl ScenarioHost for LoopbackHost {
    type Proxy = LoopbackProxy;

    fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn faults(&self) -> &Arc<Configuration> {
        &self.faults
    }

    fn reply_adapter(&self) -> &ReplyAdapter {
        &self.adapter
    }

    fn datagram_proxy(&self, endpoint: &str) -> TransportResult<LoopbackProxy> {
        let endpoint = self.registry.create(endpoint, false)?;
        Ok(LoopbackProxy::new(endpoint, self.registry.clone()))
    }
}

async fn dispatch_replies(
    registry: Arc<FactoryRegistry>,
    adapter: ReplyAdapter,
    mut listener: Box<dyn Listener>,
) {
    while let Ok(incoming) = listener.accept().await {
        match Message::decode(&registry, &incoming.payload) {
            Ok(Message::Reply { identity }) => {
                adapter.dispatch(&identity);
            }
            Ok(other) => tracing::debug!(?other, "reply adapter ignoring request"),
            Err(error) => tracing::warn!(%error, "discarding undecodable reply"),
        }
    }
}

type AdapterSlot = Arc<Mutex<Option<ReplyAdapter>>>;

struct Connection {
    transceiver: Arc<dyn Transceiver>,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Proxy to a test object, connecting on first use.
///
/// Replies sent back over the connection are dispatched through the adapter
/// set with [`set_connection_adapter`](DatagramProxy::set_connection_adapter)
/// and dropped while none is set.
pub struct LoopbackProxy {
    endpoint: Arc<dyn Endpoint>,
    registry: Arc<FactoryRegistry>,
    connection: tokio::sync::Mutex<Option<Connection>>,
    adapter: AdapterSlot,
}

impl fmt::Debug for LoopbackProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackProxy")
            .field("endpoint", &self.endpoint.to_string())
            .finish_non_exhaustive()
    }
}

impl LoopbackProxy {
    /// Proxy to the object at `endpoint`.
    pub fn new(endpoint: Arc<dyn Endpoint>, registry: Arc<FactoryRegistry>) -> Self {
        Self {
            endpoint,
            registry,
            connection: tokio::sync::Mutex::new(None),
            adapter: Arc::new(Mutex::new(None)),
        }
    }

    /// Target endpoint.
    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    async fn transceiver(&self) -> TransportResult<Arc<dyn Transceiver>> {
        let mut connection = self.connection.lock().await;
        if let Some(open) = connection.as_ref() {
            return Ok(open.transceiver.clone());
        }
        let transceiver = self.endpoint.connect().await?;
        let reader = tokio::spawn(read_replies(
            transceiver.clone(),
            self.registry.clone(),
            self.adapter.clone(),
        ));
        *connection = Some(Connection {
            transceiver: transceiver.clone(),
            reader,
        });
        Ok(transceiver)
    }

    async fn send(&self, message: Message) -> TransportResult<()> {
        let datagram = message.encode(&self.registry)?;
        let transceiver = self.transceiver().await?;
        transceiver.write(&datagram).await?;
        Ok(())
    }
}

#[async_trait]
impl DatagramProxy for LoopbackProxy {
    async fn ping(&self, reply: &ReplyProxy) -> TransportResult<()> {
        self.send(Message::Ping {
            reply: reply.clone(),
        })
        .await
    }

    async fn send_byte_seq(&self, seq: Vec<u8>, reply: &ReplyProxy) -> TransportResult<()> {
        self.send(Message::SendByteSeq {
            seq,
            reply: reply.clone(),
        })
        .await
    }

    async fn ping_bidir(&self, identity: &Identity) -> TransportResult<()> {
        self.send(Message::PingBiDir {
            identity: identity.clone(),
        })
        .await
    }

    async fn close_connection(&self) -> TransportResult<()> {
        let closed = self.connection.lock().await.take();
        if let Some(connection) = closed {
            connection.transceiver.close().await;
            tracing::debug!(endpoint = %self.endpoint, "proxy connection closed");
        }
        Ok(())
    }

    async fn set_connection_adapter(&self, adapter: ReplyAdapter) -> TransportResult<()> {
        *self.adapter.lock().unwrap_or_else(PoisonError::into_inner) = Some(adapter);
        Ok(())
    }
}

async fn read_replies(
    transceiver: Arc<dyn Transceiver>,
    registry: Arc<FactoryRegistry>,
    adapter: AdapterSlot,
) {
    loop {
        let datagram = match transceiver.read().await {
            Ok(datagram) => datagram,
            Err(TransportError::ConnectionClosed) => break,
            Err(error) => {
                tracing::warn!(%error, "connection read failed");
                break;
            }
        };
        match Message::decode(&registry, &datagram) {
            Ok(Message::Reply { identity }) => {
                let adapter = adapter
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match adapter {
                    Some(adapter) => {
                        adapter.dispatch(&identity);
                    }
                    None => tracing::debug!(%identity, "no adapter on connection, dropping reply"),
                }
            }
            Ok(other) => tracing::debug!(?other, "unexpected message on connection"),
            Err(error) => tracing::warn!(%error, "discarding undecodable datagram"),
        }
    }
}
