//! Datagram endpoints on a [`LoopbackNetwork`].
//!
//! Endpoint string options: `-h host` (default `127.0.0.1`), `-p port`,
//! `--interface iface` and `-z` for compression.
//!
//! Encoded body: `[host:string][port:i32][compress:bool][interface:string]`

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{TransportError, TransportResult};
use crate::transport::{
    Endpoint, EndpointFactory, Incoming, Listener, ProtocolInstance, Transceiver,
};
use crate::wire::{InputStream, OutputStream, WireError};

use super::network::LoopbackNetwork;

/// Endpoint type of loopback datagram endpoints.
pub const UDP_TYPE: u16 = 3;

const PROTOCOL: &str = "udp";
const DEFAULT_HOST: &str = "127.0.0.1";

/// Factory for `udp` endpoints on a loopback network.
#[derive(Debug, Clone)]
pub struct LoopbackEndpointFactory {
    network: LoopbackNetwork,
    instance: ProtocolInstance,
}

impl LoopbackEndpointFactory {
    /// Factory of type [`UDP_TYPE`] and protocol `udp`.
    pub fn new(network: LoopbackNetwork) -> Self {
        Self {
            network,
            instance: ProtocolInstance::new(UDP_TYPE, PROTOCOL),
        }
    }

    /// The network endpoints are created on.
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    fn invalid(&self, args: &[String], reason: impl Into<String>) -> TransportError {
        TransportError::InvalidEndpoint {
            endpoint: format!("{} {}", self.instance.protocol, args.join(" ")),
            reason: reason.into(),
        }
    }
}

impl EndpointFactory for LoopbackEndpointFactory {
    fn endpoint_type(&self) -> u16 {
        self.instance.endpoint_type
    }

    fn protocol(&self) -> String {
        self.instance.protocol.clone()
    }

    fn create(&self, args: &[String], _server: bool) -> TransportResult<Arc<dyn Endpoint>> {
        let mut host = DEFAULT_HOST.to_string();
        let mut port = None;
        let mut interface = String::new();
        let mut compress = false;

        let mut iter = args.iter();
        while let Some(option) = iter.next() {
            match option.as_str() {
                "-z" => compress = true,
                "-h" | "-p" | "--interface" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| self.invalid(args, format!("no argument for {option}")))?;
                    match option.as_str() {
                        "-h" => host = value.clone(),
                        "-p" => {
                            port = Some(value.parse::<u16>().map_err(|_| {
                                self.invalid(args, format!("invalid port `{value}`"))
                            })?)
                        }
                        _ => interface = value.clone(),
                    }
                }
                other => return Err(self.invalid(args, format!("unknown option `{other}`"))),
            }
        }

        let port = port.ok_or_else(|| self.invalid(args, "missing port"))?;
        Ok(Arc::new(LoopbackEndpoint {
            network: self.network.clone(),
            instance: self.instance.clone(),
            host,
            port,
            interface,
            compress,
        }))
    }

    fn read(&self, input: &mut InputStream<'_>) -> TransportResult<Arc<dyn Endpoint>> {
        let host = input.read_string()?;
        let port = input.read_i32()?;
        let port = u16::try_from(port).map_err(|_| WireError::InvalidSize { size: port })?;
        let compress = input.read_bool()?;
        let interface = input.read_string()?;
        Ok(Arc::new(LoopbackEndpoint {
            network: self.network.clone(),
            instance: self.instance.clone(),
            host,
            port,
            interface,
            compress,
        }))
    }

    fn destroy(&self) {}

    fn clone_for(self: Arc<Self>, instance: &ProtocolInstance) -> Arc<dyn EndpointFactory> {
        Arc::new(Self {
            network: self.network.clone(),
            instance: instance.clone(),
        })
    }
}

/// A `host:port` address on the loopback network.
#[derive(Clone)]
pub struct LoopbackEndpoint {
    network: LoopbackNetwork,
    instance: ProtocolInstance,
    host: String,
    port: u16,
    interface: String,
    compress: bool,
}

impl LoopbackEndpoint {
    /// Destination host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Multicast interface, empty if unset.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Whether compression was requested.
    pub fn compress(&self) -> bool {
        self.compress
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    if value.contains(':') {
        write!(f, "\"{value}\"")
    } else {
        f.write_str(value)
    }
}

impl fmt::Display for LoopbackEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -h ", self.instance.protocol)?;
        write_quoted(f, &self.host)?;
        write!(f, " -p {}", self.port)?;
        if !self.interface.is_empty() {
            f.write_str(" --interface ")?;
            write_quoted(f, &self.interface)?;
        }
        if self.compress {
            f.write_str(" -z")?;
        }
        Ok(())
    }
}

impl fmt::Debug for LoopbackEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LoopbackEndpoint")
            .field(&self.to_string())
            .finish()
    }
}

#[async_trait]
impl Endpoint for LoopbackEndpoint {
    fn endpoint_type(&self) -> u16 {
        self.instance.endpoint_type
    }

    fn protocol(&self) -> String {
        self.instance.protocol.clone()
    }

    fn datagram(&self) -> bool {
        true
    }

    fn write_body(&self, out: &mut OutputStream) -> Result<(), WireError> {
        out.write_string(&self.host);
        out.write_i32(i32::from(self.port));
        out.write_bool(self.compress);
        out.write_string(&self.interface);
        Ok(())
    }

    async fn connect(&self) -> TransportResult<Arc<dyn Transceiver>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transceiver = LoopbackTransceiver {
            network: self.network.clone(),
            protocol: self.instance.protocol.clone(),
            host: self.host.clone(),
            port: self.port,
            send_buffer_size: AtomicUsize::new(self.network.config().send_buffer_size),
            closed: AtomicBool::new(false),
            back_channel: Arc::new(BackChannel {
                protocol: self.instance.protocol.clone(),
                tx: Mutex::new(Some(tx)),
            }),
            inbox: tokio::sync::Mutex::new(rx),
        };
        tracing::debug!(endpoint = %self, "connected");
        Ok(Arc::new(transceiver))
    }

    async fn listen(&self) -> TransportResult<Box<dyn Listener>> {
        if !self.interface.is_empty() {
            tracing::debug!(endpoint = %self, interface = %self.interface, "joining group on interface");
        }
        let (id, rx) = self.network.bind(&self.host, self.port, None);
        Ok(Box::new(LoopbackListener {
            network: self.network.clone(),
            host: self.host.clone(),
            port: self.port,
            id,
            display: self.to_string(),
            rx,
        }))
    }
}

/// Outgoing connection to a loopback endpoint.
///
/// Datagrams larger than the send buffer are rejected with
/// [`TransportError::DatagramLimit`]. Replies written to the back channel by
/// the receiving side are returned by [`read`](Transceiver::read).
pub struct LoopbackTransceiver {
    network: LoopbackNetwork,
    protocol: String,
    host: String,
    port: u16,
    send_buffer_size: AtomicUsize,
    closed: AtomicBool,
    back_channel: Arc<BackChannel>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl fmt::Debug for LoopbackTransceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackTransceiver")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("send_buffer_size", &self.send_buffer_size())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl Transceiver for LoopbackTransceiver {
    fn protocol(&self) -> String {
        self.protocol.clone()
    }

    async fn write(&self, datagram: &[u8]) -> TransportResult<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        let limit = self.send_buffer_size();
        if datagram.len() > limit {
            return Err(TransportError::DatagramLimit {
                size: datagram.len(),
                limit,
            });
        }
        let copies = self.network.deliver(
            &self.host,
            self.port,
            datagram,
            self.back_channel.clone(),
        );
        tracing::trace!(host = %self.host, port = self.port, bytes = datagram.len(), copies, "datagram sent");
        Ok(datagram.len())
    }

    async fn read(&self) -> TransportResult<Vec<u8>> {
        let mut inbox = self.inbox.lock().await;
        inbox.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn send_buffer_size(&self) -> usize {
        self.send_buffer_size.load(Ordering::Relaxed)
    }

    fn set_send_buffer_size(&self, size: usize) {
        self.send_buffer_size.store(size, Ordering::Relaxed);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.back_channel.shut();
        tracing::debug!(host = %self.host, port = self.port, "connection closed");
    }
}

/// Write-only path from a receiver back to the connection a datagram came
/// from.
struct BackChannel {
    protocol: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl BackChannel {
    fn shut(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl fmt::Debug for BackChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("BackChannel").field("open", &open).finish()
    }
}

#[async_trait]
impl Transceiver for BackChannel {
    fn protocol(&self) -> String {
        self.protocol.clone()
    }

    async fn write(&self, datagram: &[u8]) -> TransportResult<usize> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(datagram.to_vec())
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(datagram.len())
    }

    async fn read(&self) -> TransportResult<Vec<u8>> {
        Err(TransportError::Io("back channel is write-only".to_string()))
    }

    fn send_buffer_size(&self) -> usize {
        super::network::MAX_DATAGRAM_SIZE
    }

    fn set_send_buffer_size(&self, _size: usize) {}

    async fn close(&self) {
        self.shut();
    }
}

/// Receiving side of a loopback endpoint. Unbinds when dropped.
pub struct LoopbackListener {
    network: LoopbackNetwork,
    host: String,
    port: u16,
    id: u64,
    display: String,
    rx: mpsc::UnboundedReceiver<Incoming>,
}

#[async_trait]
impl Listener for LoopbackListener {
    async fn accept(&mut self) -> TransportResult<Incoming> {
        self.rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn local_endpoint(&self) -> String {
        self.display.clone()
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.network.unbind(&self.host, self.port, self.id);
    }
}
