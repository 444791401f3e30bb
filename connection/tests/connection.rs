//! Loopback integration tests driving real TCP sockets through multiplexers.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use swarmwire_connection::{
    serve, ChannelHandler, CloseReason, Connection, ConnectionConfiguration, ConnectionEvent,
    ConnectionId, EncryptionPolicy, FramingMode, HandshakeError, Multiplexer,
    MultiplexerConfiguration, MultiplexerHandle, Origin, ProtocolEndpoint, RateConfiguration,
    RateController, RateLimit, TcpAcceptor, TransportError, DEFAULT_PLAINTEXT_HEADER,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A multiplexer loop running on its own task.
fn spawn_multiplexer(rate: RateController) -> MultiplexerHandle {
    let (multiplexer, handle) = Multiplexer::new(
        MultiplexerConfiguration::default().with_poll_interval(Duration::from_millis(10)),
        rate.shared(),
    );
    tokio::spawn(multiplexer.run());
    handle
}

/// Start a listener on loopback, every inbound connection reports to the
/// returned receiver.
async fn listen(
    configuration: ConnectionConfiguration,
) -> (
    SocketAddr,
    MultiplexerHandle,
    UnboundedReceiver<ConnectionEvent>,
) {
    let handle = spawn_multiplexer(RateController::unlimited());
    let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = acceptor.local_addr().unwrap();
    let (handler, events) = ChannelHandler::new();

    let serving = handle.clone();
    tokio::spawn(async move {
        let _ = serve(acceptor, &serving, configuration, move |_| handler.clone()).await;
    });
    (addr, handle, events)
}

async fn next_event(events: &mut UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("Timeout waiting for connection event")
        .expect("Event channel closed")
}

async fn established(events: &mut UnboundedReceiver<ConnectionEvent>) -> Connection {
    loop {
        match next_event(events).await {
            ConnectionEvent::Established(connection) => return connection,
            ConnectionEvent::Closed { .. } => continue,
            other => panic!("Unexpected event {other:?}"),
        }
    }
}

async fn closed(events: &mut UnboundedReceiver<ConnectionEvent>) -> (ConnectionId, CloseReason) {
    loop {
        if let ConnectionEvent::Closed { id, reason } = next_event(events).await {
            return (id, reason);
        }
    }
}

/// Collect data events until `len` bytes arrived on one connection.
async fn receive_exactly(events: &mut UnboundedReceiver<ConnectionEvent>, len: usize) -> Vec<u8> {
    let mut received = Vec::with_capacity(len);
    while received.len() < len {
        match next_event(events).await {
            ConnectionEvent::Data { data, .. } => received.extend_from_slice(&data),
            ConnectionEvent::Established(_) => {}
            ConnectionEvent::Closed { reason, .. } => panic!("Closed early: {reason}"),
        }
    }
    received
}

fn config(policy: EncryptionPolicy) -> ConnectionConfiguration {
    ConnectionConfiguration::default().with_encryption_policy(policy)
}

fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

#[tokio::test]
async fn test_obfuscated_loopback() {
    let (addr, server, mut server_events) = listen(config(EncryptionPolicy::EncryptedPreferred)).await;
    let client = spawn_multiplexer(RateController::unlimited());
    let (handler, mut client_events) = ChannelHandler::new();

    client
        .connect(
            ProtocolEndpoint::from(addr),
            config(EncryptionPolicy::EncryptedPreferred),
            handler,
        )
        .await
        .expect("Failed to dial");

    let outbound = established(&mut client_events).await;
    assert_eq!(outbound.framing(), FramingMode::Obfuscated);
    assert_eq!(outbound.origin(), Origin::Outbound);

    let data = payload(1000);
    outbound.send(data.clone()).unwrap();

    let inbound = established(&mut server_events).await;
    assert_eq!(inbound.framing(), FramingMode::Obfuscated);
    assert_eq!(inbound.origin(), Origin::Inbound);
    assert_eq!(receive_exactly(&mut server_events, 1000).await, &data[..]);

    // And back the other way.
    inbound.send(&b"unchoke"[..]).unwrap();
    assert_eq!(receive_exactly(&mut client_events, 7).await, b"unchoke");

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_plaintext_detected_inbound() {
    let (addr, server, mut server_events) = listen(config(EncryptionPolicy::EncryptedPreferred)).await;
    let client = spawn_multiplexer(RateController::unlimited());
    let (handler, mut client_events) = ChannelHandler::new();

    client
        .connect(
            ProtocolEndpoint::from(addr),
            config(EncryptionPolicy::PlainOnly),
            handler,
        )
        .await
        .unwrap();

    let outbound = established(&mut client_events).await;
    assert_eq!(outbound.framing(), FramingMode::Plain);
    outbound.send(DEFAULT_PLAINTEXT_HEADER).unwrap();
    outbound.send(&b"extensions"[..]).unwrap();

    let inbound = established(&mut server_events).await;
    assert_eq!(inbound.framing(), FramingMode::Plain);

    // Detection consumes nothing, the header reaches the application.
    let expected_len = DEFAULT_PLAINTEXT_HEADER.len() + 10;
    let received = receive_exactly(&mut server_events, expected_len).await;
    assert_eq!(&received[..DEFAULT_PLAINTEXT_HEADER.len()], DEFAULT_PLAINTEXT_HEADER);
    assert_eq!(&received[DEFAULT_PLAINTEXT_HEADER.len()..], b"extensions");

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_falls_back_to_plaintext() {
    let (addr, server, mut server_events) = listen(config(EncryptionPolicy::PlainOnly)).await;
    let client = spawn_multiplexer(RateController::unlimited());
    let (handler, mut client_events) = ChannelHandler::new();

    let id = client
        .connect(
            ProtocolEndpoint::from(addr),
            config(EncryptionPolicy::EncryptedPreferred),
            handler,
        )
        .await
        .unwrap();

    // The refused obfuscated attempt is invisible to the client, the re-dial
    // keeps the connection id.
    let outbound = match next_event(&mut client_events).await {
        ConnectionEvent::Established(connection) => connection,
        other => panic!("Unexpected event {other:?}"),
    };
    assert_eq!(outbound.id(), id);
    assert_eq!(outbound.framing(), FramingMode::Plain);

    // The server refused the first attempt.
    let (_, reason) = closed(&mut server_events).await;
    assert!(matches!(
        reason,
        CloseReason::Handshake(HandshakeError::PolicyViolation {
            policy: EncryptionPolicy::PlainOnly,
            detected: FramingMode::Obfuscated,
        })
    ));

    outbound.send(DEFAULT_PLAINTEXT_HEADER).unwrap();
    let inbound = established(&mut server_events).await;
    assert_eq!(inbound.framing(), FramingMode::Plain);

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_required_encryption_refuses_plaintext_peer() {
    let (addr, server, mut server_events) = listen(config(EncryptionPolicy::EncryptedRequired)).await;
    let client = spawn_multiplexer(RateController::unlimited());
    let (handler, mut client_events) = ChannelHandler::new();

    client
        .connect(
            ProtocolEndpoint::from(addr),
            config(EncryptionPolicy::PlainOnly),
            handler,
        )
        .await
        .unwrap();
    let outbound = established(&mut client_events).await;
    outbound.send(DEFAULT_PLAINTEXT_HEADER).unwrap();

    match next_event(&mut server_events).await {
        ConnectionEvent::Closed { reason, .. } => assert!(matches!(
            reason,
            CloseReason::Handshake(HandshakeError::PolicyViolation {
                policy: EncryptionPolicy::EncryptedRequired,
                detected: FramingMode::Plain,
            })
        )),
        other => panic!("Unexpected event {other:?}"),
    }

    // The client only sees the stream end.
    let (_, reason) = closed(&mut client_events).await;
    assert!(matches!(reason, CloseReason::Transport(_)));

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_handshake_timeout_against_silent_peer() {
    // Accepts and then never says a word.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        drop(stream);
    });

    let client = spawn_multiplexer(RateController::unlimited());
    let (handler, mut client_events) = ChannelHandler::new();
    client
        .connect(
            ProtocolEndpoint::from(addr),
            config(EncryptionPolicy::EncryptedRequired)
                .with_handshake_timeout(Duration::from_millis(200)),
            handler,
        )
        .await
        .unwrap();

    let started = Instant::now();
    let (_, reason) = closed(&mut client_events).await;
    assert!(matches!(
        reason,
        CloseReason::Handshake(HandshakeError::Timeout)
    ));
    assert!(started.elapsed() < Duration::from_secs(2));

    client.shutdown();
    silent.abort();
}

#[tokio::test]
async fn test_local_close_reaches_peer_once() {
    let (addr, server, mut server_events) = listen(config(EncryptionPolicy::EncryptedPreferred)).await;
    let client = spawn_multiplexer(RateController::unlimited());
    let (handler, mut client_events) = ChannelHandler::new();

    client
        .connect(
            ProtocolEndpoint::from(addr),
            ConnectionConfiguration::default(),
            handler,
        )
        .await
        .unwrap();
    let outbound = established(&mut client_events).await;
    let inbound = established(&mut server_events).await;

    outbound.close("not interested");
    outbound.close("still not interested");

    let (id, reason) = closed(&mut client_events).await;
    assert_eq!(id, outbound.id());
    assert!(reason.is_local());

    let (id, reason) = closed(&mut server_events).await;
    assert_eq!(id, inbound.id());
    assert!(matches!(
        reason,
        CloseReason::Transport(TransportError::Closed | TransportError::Io(_))
    ));
    assert!(inbound.is_closed());

    // Exactly one close notification on the client side.
    assert!(timeout(Duration::from_millis(200), client_events.recv())
        .await
        .map(|event| event.is_none())
        .unwrap_or(true));

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_upload_limit_shared_fairly() {
    const RATE: u64 = 1000;
    const SEND: usize = 10_000;

    let plain = config(EncryptionPolicy::PlainOnly);
    let (addr, server, mut server_events) = listen(plain.clone()).await;
    let client = spawn_multiplexer(RateController::new(
        &RateConfiguration::default()
            .with_upload(RateLimit::BytesPerSecond(RATE))
            .with_burst_cap(Some(RATE)),
    ));

    let mut outbound = Vec::new();
    for _ in 0..2 {
        let (handler, mut events) = ChannelHandler::new();
        client
            .connect(ProtocolEndpoint::from(addr), plain.clone(), handler)
            .await
            .unwrap();
        outbound.push((established(&mut events).await, events));
    }

    let started = Instant::now();
    for (connection, _) in &outbound {
        let mut data = DEFAULT_PLAINTEXT_HEADER.to_vec();
        data.extend_from_slice(&payload(SEND));
        connection.send(data).unwrap();
    }

    // Tally what the server sees for two seconds.
    let mut per_connection: HashMap<ConnectionId, usize> = HashMap::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, server_events.recv()).await {
        if let ConnectionEvent::Data { id, data } = event {
            *per_connection.entry(id).or_default() += data.len();
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    let total: usize = per_connection.values().sum();

    let ceiling = RATE as f64 * elapsed + RATE as f64;
    assert!(
        (total as f64) <= ceiling,
        "{total} bytes in {elapsed:.2}s exceeds {ceiling:.0}"
    );
    assert!(total >= RATE as usize, "only {total} bytes moved");
    assert_eq!(per_connection.len(), 2);
    for (id, bytes) in &per_connection {
        assert!(
            *bytes * 4 >= total,
            "{id} got {bytes} of {total} bytes, share is unfair"
        );
    }

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_shutdown_notifies_every_connection() {
    let (addr, server, mut server_events) = listen(config(EncryptionPolicy::EncryptedPreferred)).await;
    let client = spawn_multiplexer(RateController::unlimited());
    let (handler, mut client_events) = ChannelHandler::new();
    client
        .connect(
            ProtocolEndpoint::from(addr),
            ConnectionConfiguration::default(),
            handler,
        )
        .await
        .unwrap();
    let outbound = established(&mut client_events).await;
    established(&mut server_events).await;

    client.shutdown();
    let (_, reason) = closed(&mut client_events).await;
    assert!(matches!(reason, CloseReason::Shutdown));
    assert!(outbound.send(&b"late"[..]).is_err());

    server.shutdown();
}
