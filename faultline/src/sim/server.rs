//! Test object answering pings on a loopback endpoint.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::TransportResult;
use crate::harness::{Identity, ReplyProxy};
use crate::transport::{FactoryRegistry, Incoming, Listener};

use super::protocol::Message;

/// Server task listening on one endpoint. Stops when dropped.
#[derive(Debug)]
pub struct TestServer {
    endpoint: String,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Listen on `endpoint` and answer requests until dropped.
    pub async fn start(registry: Arc<FactoryRegistry>, endpoint: &str) -> TransportResult<Self> {
        let listener = registry.create(endpoint, true)?.listen().await?;
        let endpoint = listener.local_endpoint();
        tracing::debug!(%endpoint, "test server listening");
        let task = tokio::spawn(serve(registry, listener));
        Ok(Self { endpoint, task })
    }

    /// Endpoint the server listens on.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(registry: Arc<FactoryRegistry>, mut listener: Box<dyn Listener>) {
    let local = listener.local_endpoint();
    while let Ok(incoming) = listener.accept().await {
        let message = match Message::decode(&registry, &incoming.payload) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(endpoint = %local, %error, "discarding undecodable datagram");
                continue;
            }
        };
        match message {
            Message::Ping { reply } => call_back(&registry, reply).await,
            Message::SendByteSeq { seq, reply } => {
                tracing::trace!(bytes = seq.len(), "byte sequence received");
                call_back(&registry, reply).await;
            }
            Message::PingBiDir { identity } => reply_bidir(&registry, &incoming, identity).await,
            Message::Reply { identity } => {
                tracing::debug!(endpoint = %local, %identity, "ignoring reply sent to server");
            }
        }
    }
    tracing::debug!(endpoint = %local, "test server stopped");
}

async fn call_back(registry: &FactoryRegistry, reply: ReplyProxy) {
    let result: TransportResult<()> = async {
        let datagram = Message::Reply {
            identity: reply.identity.clone(),
        }
        .encode(registry)?;
        let connection = reply.endpoint.connect().await?;
        let written = connection.write(&datagram).await;
        connection.close().await;
        written.map(|_| ())
    }
    .await;
    if let Err(error) = result {
        tracing::warn!(endpoint = %reply.endpoint, identity = %reply.identity, %error, "reply failed");
    }
}

async fn reply_bidir(registry: &FactoryRegistry, incoming: &Incoming, identity: Identity) {
    let result: TransportResult<()> = async {
        let datagram = Message::Reply {
            identity: identity.clone(),
        }
        .encode(registry)?;
        incoming.back_channel.write(&datagram).await.map(|_| ())
    }
    .await;
    if let Err(error) = result {
        tracing::warn!(%identity, %error, "bidirectional reply failed");
    }
}
