use crate::config::ResponderConfig;
use crate::protocol::{ProbeMessage, ProbeRequestType, MAX_DATAGRAM_SIZE};
use crate::responder::*;
use crate::Error;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

async fn start_responder() -> ResponderHandle {
    NatResponder::bind(&ResponderConfig::ephemeral_loopback())
        .await
        .expect("Failed to bind responder")
        .spawn()
}

async fn send(socket: &UdpSocket, to: SocketAddr, request_type: ProbeRequestType) {
    let payload = ProbeMessage::request(request_type).encode().unwrap();
    socket.send_to(&payload, to).await.expect("Failed to send");
}

async fn recv(socket: &UdpSocket) -> Option<(ProbeMessage, SocketAddr)> {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    let (len, source) = timeout(Duration::from_millis(500), socket.recv_from(&mut buf))
        .await
        .ok()?
        .ok()?;
    Some((ProbeMessage::decode(&buf[..len]).expect("reply decodes"), source))
}

#[tokio::test]
async fn test_binds_three_distinct_listeners() {
    let handle = start_responder().await;
    let addrs = handle.addrs();

    assert_ne!(addrs.primary.port(), addrs.secondary.port());
    assert_ne!(addrs.primary.port(), addrs.tertiary.port());
    assert_ne!(addrs.secondary.port(), addrs.tertiary.port());
    assert_eq!(addrs.primary.ip(), addrs.tertiary.ip());
    for role in ListenerRole::ALL {
        assert_ne!(addrs.get(role).port(), 0);
    }
}

#[tokio::test]
async fn test_ping_echoes_sender_from_same_listener() {
    let handle = start_responder().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    send(&client, handle.addrs().primary, ProbeRequestType::Ping).await;
    let (reply, source) = recv(&client).await.expect("Ping reply");

    assert_eq!(source, handle.addrs().primary);
    assert_eq!(
        reply.observed_address,
        Some(client.local_addr().unwrap().to_string())
    );
}

#[tokio::test]
async fn test_ping_on_secondary_echoes_from_secondary() {
    let handle = start_responder().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    send(&client, handle.addrs().secondary, ProbeRequestType::Ping).await;
    let (_, source) = recv(&client).await.expect("Ping reply");

    assert_eq!(source, handle.addrs().secondary);
}

#[tokio::test]
async fn test_public_and_full_cone_reply_from_secondary() {
    let handle = start_responder().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    for request_type in [ProbeRequestType::PublicCheck, ProbeRequestType::FullConeCheck] {
        send(&client, handle.addrs().primary, request_type).await;
        let (reply, source) = recv(&client).await.expect("check reply");
        assert_eq!(source, handle.addrs().secondary);
        assert_eq!(reply.request_type, request_type);
    }
}

#[tokio::test]
async fn test_port_restricted_replies_from_primary_and_tertiary() {
    let handle = start_responder().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    send(&client, handle.addrs().primary, ProbeRequestType::PortRestrictedCheck).await;
    let (_, first) = recv(&client).await.expect("first reply");
    let (_, second) = recv(&client).await.expect("second reply");

    let mut sources = vec![first, second];
    sources.sort();
    let mut expected = vec![handle.addrs().primary, handle.addrs().tertiary];
    expected.sort();
    assert_eq!(sources, expected);
}

#[tokio::test]
async fn test_malformed_datagram_dropped_listener_survives() {
    let handle = start_responder().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    client
        .send_to(b"\x00\x01garbage", handle.addrs().primary)
        .await
        .unwrap();
    assert!(recv(&client).await.is_none());

    send(&client, handle.addrs().primary, ProbeRequestType::Ping).await;
    assert!(recv(&client).await.is_some());
}

#[tokio::test]
async fn test_concurrency_cap_still_serves_everyone() {
    let mut config = ResponderConfig::ephemeral_loopback();
    config.max_in_flight_per_listener = 1;
    let handle = NatResponder::bind(&config).await.unwrap().spawn();

    let mut clients = Vec::new();
    for _ in 0..8 {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        send(&client, handle.addrs().primary, ProbeRequestType::Ping).await;
        clients.push(client);
    }
    for client in &clients {
        let (reply, _) = recv(client).await.expect("every client answered");
        assert_eq!(
            reply.observed_address,
            Some(client.local_addr().unwrap().to_string())
        );
    }
}

#[tokio::test]
async fn test_bind_conflict_is_bind_error() {
    let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut config = ResponderConfig::ephemeral_loopback();
    config.secondary_port = taken.local_addr().unwrap().port();

    assert!(matches!(NatResponder::bind(&config).await, Err(Error::Bind(_))));
}

#[tokio::test]
async fn test_shutdown_stops_replies() {
    let handle = start_responder().await;
    let primary = handle.addrs().primary;
    handle.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    send(&client, primary, ProbeRequestType::Ping).await;
    assert!(recv(&client).await.is_none());
}

#[tokio::test]
async fn test_oversized_datagram_dropped() {
    let handle = start_responder().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // Valid JSON padded past the limit; a truncated read would still decode.
    let mut payload = ProbeMessage::request(ProbeRequestType::Ping).encode().unwrap();
    payload.resize(MAX_DATAGRAM_SIZE + 200, b' ');
    client.send_to(&payload, handle.addrs().primary).await.unwrap();
    assert!(recv(&client).await.is_none());

    send(&client, handle.addrs().primary, ProbeRequestType::Ping).await;
    assert!(recv(&client).await.is_some());
}

#[tokio::test]
async fn test_receive_error_backs_off() {
    let error = std::io::Error::new(std::io::ErrorKind::Other, "interface down");

    let started = std::time::Instant::now();
    backoff_after_receive_error(ListenerRole::Primary, &error).await;

    assert!(started.elapsed() >= RECEIVE_ERROR_BACKOFF);
}
