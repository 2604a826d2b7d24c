use crate::protocol::*;
use std::net::SocketAddr;

#[test]
fn test_request_roundtrip_all_types() {
    for request_type in ProbeRequestType::ALL {
        let original = ProbeMessage::request(request_type);
        let encoded = original.encode().expect("Failed to encode request");
        let decoded = ProbeMessage::decode(&encoded).expect("Failed to decode request");
        assert_eq!(decoded, original);
        assert!(decoded.observed_address.is_none());
    }
}

#[test]
fn test_reply_roundtrip_ipv4_and_ipv6() {
    let observed: [SocketAddr; 2] = [
        "198.51.100.20:3478".parse().unwrap(),
        "[2001:db8::1]:50000".parse().unwrap(),
    ];
    for addr in observed {
        let original = ProbeMessage::reply(ProbeRequestType::PortRestrictedCheck, addr);
        let encoded = original.encode().expect("Failed to encode reply");
        let decoded = ProbeMessage::decode(&encoded).expect("Failed to decode reply");
        assert_eq!(decoded, original);
        assert_eq!(decoded.observed_address.as_deref(), Some(addr.to_string().as_str()));
    }
}

#[test]
fn test_decode_accepts_lowercase_addr_key() {
    let decoded = ProbeMessage::decode(br#"{"ReqType":0,"addr":"10.0.0.2:4008"}"#)
        .expect("Failed to decode lowercase key");
    assert_eq!(decoded.request_type, ProbeRequestType::Ping);
    assert_eq!(decoded.observed_address.as_deref(), Some("10.0.0.2:4008"));
}

#[test]
fn test_decode_missing_request_type_is_ping() {
    let decoded = ProbeMessage::decode(br#"{"Addr":"10.0.0.2:4008"}"#)
        .expect("Failed to decode reply without ReqType");
    assert_eq!(decoded.request_type, ProbeRequestType::Ping);
}

#[test]
fn test_decode_rejects_garbage() {
    let cases: [&[u8]; 4] = [b"", b"not json", b"{\"ReqType\":", b"\"just a string\""];
    for garbage in cases {
        assert!(
            matches!(ProbeMessage::decode(garbage), Err(DecodeError::Malformed(_))),
            "expected malformed for {:?}",
            String::from_utf8_lossy(garbage)
        );
    }
}

#[test]
fn test_decode_rejects_unknown_request_type() {
    assert!(ProbeMessage::decode(br#"{"ReqType":9}"#).is_err());
    assert!(ProbeMessage::decode(br#"{"ReqType":-1}"#).is_err());
    assert!(ProbeMessage::decode(br#"{"ReqType":"Ping"}"#).is_err());
}

#[test]
fn test_decode_rejects_oversized_datagram() {
    let oversized = vec![b' '; MAX_DATAGRAM_SIZE + 1];
    assert!(matches!(
        ProbeMessage::decode(&oversized),
        Err(DecodeError::TooLarge(len)) if len == MAX_DATAGRAM_SIZE + 1
    ));
}

#[test]
fn test_encoded_reply_fits_one_datagram() {
    let addr: SocketAddr = "[2001:db8:ffff:ffff:ffff:ffff:ffff:ffff]:65535".parse().unwrap();
    let encoded = ProbeMessage::reply(ProbeRequestType::FullConeCheck, addr)
        .encode()
        .expect("Failed to encode");
    assert!(encoded.len() <= MAX_DATAGRAM_SIZE);
}
