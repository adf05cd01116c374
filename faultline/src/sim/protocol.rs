//! Messages exchanged between the scenario host and test servers.
//!
//! Layout: `[tag:1][encapsulation{params}]`. Reply proxies are encoded as
//! `[identity:string][endpoint]` with the endpoint written through the
//! factory registry, so decorated endpoints round-trip as decorated.

use crate::error::TransportResult;
use crate::harness::{Identity, ReplyProxy};
use crate::transport::FactoryRegistry;
use crate::wire::{InputStream, OutputStream, WireError};

const TAG_PING: u8 = 1;
const TAG_SEND_BYTE_SEQ: u8 = 2;
const TAG_PING_BIDIR: u8 = 3;
const TAG_REPLY: u8 = 4;

/// A datagram of the test protocol.
#[derive(Debug, Clone)]
pub enum Message {
    /// Call back `reply`.
    Ping {
        /// Where to send the reply.
        reply: ReplyProxy,
    },
    /// Payload of arbitrary size; call back `reply` on receipt.
    SendByteSeq {
        /// The payload.
        seq: Vec<u8>,
        /// Where to send the reply.
        reply: ReplyProxy,
    },
    /// Reply to `identity` over the connection this arrived on.
    PingBiDir {
        /// Identity on the sender's side.
        identity: Identity,
    },
    /// A reply for `identity`.
    Reply {
        /// Identity the reply is dispatched to.
        identity: Identity,
    },
}

impl Message {
    /// Encode into a datagram.
    pub fn encode(&self, registry: &FactoryRegistry) -> TransportResult<Vec<u8>> {
        let mut out = OutputStream::new();
        let tag = match self {
            Message::Ping { .. } => TAG_PING,
            Message::SendByteSeq { .. } => TAG_SEND_BYTE_SEQ,
            Message::PingBiDir { .. } => TAG_PING_BIDIR,
            Message::Reply { .. } => TAG_REPLY,
        };
        out.write_u8(tag);
        out.start_encapsulation();
        match self {
            Message::Ping { reply } => write_proxy(&mut out, registry, reply)?,
            Message::SendByteSeq { seq, reply } => {
                out.write_byte_seq(seq);
                write_proxy(&mut out, registry, reply)?;
            }
            Message::PingBiDir { identity } | Message::Reply { identity } => {
                out.write_string(identity.name());
            }
        }
        out.end_encapsulation()?;
        Ok(out.into_bytes())
    }

    /// Decode a datagram.
    pub fn decode(registry: &FactoryRegistry, datagram: &[u8]) -> TransportResult<Self> {
        let mut input = InputStream::new(datagram);
        let tag = input.read_u8()?;
        input.start_encapsulation()?;
        let message = match tag {
            TAG_PING => Message::Ping {
                reply: read_proxy(&mut input, registry)?,
            },
            TAG_SEND_BYTE_SEQ => {
                let seq = input.read_byte_seq()?;
                Message::SendByteSeq {
                    seq,
                    reply: read_proxy(&mut input, registry)?,
                }
            }
            TAG_PING_BIDIR => Message::PingBiDir {
                identity: Identity::new(input.read_string()?),
            },
            TAG_REPLY => Message::Reply {
                identity: Identity::new(input.read_string()?),
            },
            tag => return Err(WireError::UnknownTag { tag }.into()),
        };
        input.end_encapsulation()?;
        Ok(message)
    }
}

fn write_proxy(
    out: &mut OutputStream,
    registry: &FactoryRegistry,
    proxy: &ReplyProxy,
) -> TransportResult<()> {
    out.write_string(proxy.identity.name());
    registry.write_endpoint(out, proxy.endpoint.as_ref())
}

fn read_proxy(input: &mut InputStream<'_>, registry: &FactoryRegistry) -> TransportResult<ReplyProxy> {
    let identity = Identity::new(input.read_string()?);
    let endpoint = registry.read_endpoint(input)?;
    Ok(ReplyProxy { identity, endpoint })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::sim::{loopback_registry, LoopbackConfig, LoopbackNetwork};
    use crate::transport::Configuration;

    fn registry() -> FactoryRegistry {
        loopback_registry(
            &LoopbackNetwork::new(LoopbackConfig::default()),
            Configuration::shared(),
        )
        .expect("registry")
    }

    #[test]
    fn test_decorated_proxy_survives_encoding() {
        let registry = registry();
        let endpoint = registry
            .create("test-udp -h 127.0.0.1 -p 12030", true)
            .expect("endpoint");
        let message = Message::SendByteSeq {
            seq: vec![7; 300],
            reply: ReplyProxy {
                identity: Identity::new("collector"),
                endpoint,
            },
        };

        let bytes = message.encode(&registry).expect("encode");
        match Message::decode(&registry, &bytes).expect("decode") {
            Message::SendByteSeq { seq, reply } => {
                assert_eq!(seq.len(), 300);
                assert_eq!(reply.identity.name(), "collector");
                assert_eq!(reply.endpoint.to_string(), "test-udp -h 127.0.0.1 -p 12030");
                assert_eq!(reply.endpoint.endpoint_type(), 103);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let registry = registry();
        let mut bytes = Message::Reply {
            identity: Identity::new("x"),
        }
        .encode(&registry)
        .expect("encode");
        bytes[0] = 9;
        assert!(matches!(
            Message::decode(&registry, &bytes),
            Err(TransportError::Wire(WireError::UnknownTag { tag: 9 }))
        ));
    }
}
