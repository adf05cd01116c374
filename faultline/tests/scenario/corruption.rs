use faultline::sim::{loopback_registry, LoopbackConfig, LoopbackNetwork, Message};
use faultline::transport::Configuration;
use faultline::wire::OutputStream;
use faultline::{TransportError, WireError};

/// A ping whose decorated reply endpoint claims the wrong inner type.
fn corrupted_ping(inner_type: u16) -> Vec<u8> {
    let mut out = OutputStream::new();
    out.write_u8(1);
    out.start_encapsulation();
    out.write_string("reply");
    out.write_u16(103);
    out.start_encapsulation();
    out.write_u16(inner_type);
    out.start_encapsulation();
    out.write_string("127.0.0.1");
    out.write_i32(12030);
    out.write_bool(false);
    out.write_string("");
    out.end_encapsulation().expect("inner");
    out.end_encapsulation().expect("endpoint");
    out.end_encapsulation().expect("params");
    out.into_bytes()
}

#[test]
fn test_type_mismatch_never_decodes() {
    super::init_tracing();
    let registry = loopback_registry(
        &LoopbackNetwork::new(LoopbackConfig::default()),
        Configuration::shared(),
    )
    .expect("registry");

    assert!(Message::decode(&registry, &corrupted_ping(3)).is_ok());

    match Message::decode(&registry, &corrupted_ping(4)) {
        Err(error) => {
            assert!(error.is_protocol_corruption());
            assert!(matches!(
                error,
                TransportError::Wire(WireError::EndpointTypeMismatch {
                    expected: 3,
                    found: 4
                })
            ));
        }
        Ok(message) => panic!("corrupted stream decoded as {message:?}"),
    }
}
