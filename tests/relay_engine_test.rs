//! Tests for the relay engine

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use migrelay::config::RelayConfig;
use migrelay::relay::{RelayEngine, SessionRegistry, SessionState};
use migrelay::{EgressConnector, EgressPolicy, EgressTarget, Endpoint};

/// Connected (client, accepted) TCP pair
async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (accepted, _) = listener.accept().await.unwrap();
    (client, accepted)
}

fn dial(addr: std::net::SocketAddr) -> EgressConnector {
    EgressConnector::new(
        EgressPolicy::Dial(EgressTarget::Tcp(addr.to_string())),
        Duration::from_secs(5),
        None,
    )
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[tokio::test]
async fn test_round_trip_identity_both_directions() {
    let egress_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connector = dial(egress_listener.local_addr().unwrap());
    let registry = Arc::new(SessionRegistry::new());
    let engine = RelayEngine::new(Arc::clone(&registry), &RelayConfig::default());

    let (client, ingress) = tcp_pair().await;
    let session = tokio::spawn(async move {
        engine
            .run_session("client", Endpoint::Tcp(ingress), &connector)
            .await
    });
    let (server, _) = egress_listener.accept().await.unwrap();

    let upstream = pattern(256 * 1024, 1);
    let downstream = pattern(192 * 1024, 7);

    let (mut client_read, mut client_write) = client.into_split();
    let (mut server_read, mut server_write) = server.into_split();

    let up = upstream.clone();
    let client_writer = tokio::spawn(async move {
        client_write.write_all(&up).await.unwrap();
        client_write
    });
    let down = downstream.clone();
    let server_writer = tokio::spawn(async move {
        server_write.write_all(&down).await.unwrap();
        server_write
    });

    let mut received_up = vec![0u8; upstream.len()];
    server_read.read_exact(&mut received_up).await.unwrap();
    let mut received_down = vec![0u8; downstream.len()];
    client_read.read_exact(&mut received_down).await.unwrap();

    assert_eq!(received_up, upstream);
    assert_eq!(received_down, downstream);

    let client_write = client_writer.await.unwrap();
    let _server_write = server_writer.await.unwrap();
    drop(client_read);
    drop(client_write);

    let stats = timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.bytes_up, upstream.len() as u64);
    assert_eq!(stats.bytes_down, downstream.len() as u64);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_chunks_then_close_arrive_in_order_then_eof() {
    let egress_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connector = dial(egress_listener.local_addr().unwrap());
    let registry = Arc::new(SessionRegistry::new());
    let engine = RelayEngine::new(Arc::clone(&registry), &RelayConfig::default());

    let (mut client, ingress) = tcp_pair().await;
    let session = tokio::spawn(async move {
        engine
            .run_session("client", Endpoint::Tcp(ingress), &connector)
            .await
    });
    let (mut server, _) = egress_listener.accept().await.unwrap();

    let payload = pattern(8192 + 8192 + 4096, 3);
    for chunk in [&payload[..8192], &payload[8192..16384], &payload[16384..]] {
        client.write_all(chunk).await.unwrap();
    }
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), server.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received.len(), 20480);
    assert_eq!(received, payload);

    let stats = session.await.unwrap().unwrap();
    assert_eq!(stats.bytes_up, 20480);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_closing_ingress_closes_egress() {
    let egress_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connector = dial(egress_listener.local_addr().unwrap());
    let registry = Arc::new(SessionRegistry::new());
    let engine = RelayEngine::new(Arc::clone(&registry), &RelayConfig::default());

    let (client, ingress) = tcp_pair().await;
    let session = tokio::spawn(async move {
        engine
            .run_session("client", Endpoint::Tcp(ingress), &connector)
            .await
    });
    let (mut server, _) = egress_listener.accept().await.unwrap();

    // Wait for the session to go active
    timeout(Duration::from_secs(5), async {
        loop {
            if registry
                .snapshot()
                .iter()
                .any(|(_, state)| *state == SessionState::Active)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    drop(client);

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), server.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    let stats = session.await.unwrap().unwrap();
    assert_eq!(stats.total_bytes, 0);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_concurrent_sessions_one_megabyte_each() {
    const SIZE: usize = 1024 * 1024;

    let egress_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connector = dial(egress_listener.local_addr().unwrap());
    let registry = Arc::new(SessionRegistry::new());
    let engine = RelayEngine::new(Arc::clone(&registry), &RelayConfig::default());

    // Egress sink: count what each accepted connection receives
    let sink = tokio::spawn(async move {
        let mut counts = Vec::new();
        let mut readers = Vec::new();
        for _ in 0..2 {
            let (mut stream, _) = egress_listener.accept().await.unwrap();
            readers.push(tokio::spawn(async move {
                let mut received = Vec::new();
                stream.read_to_end(&mut received).await.unwrap();
                received
            }));
        }
        for reader in readers {
            counts.push(reader.await.unwrap());
        }
        counts
    });

    let mut sessions = Vec::new();
    let mut clients = Vec::new();
    for seed in [11u8, 22u8] {
        let (mut client, ingress) = tcp_pair().await;
        let engine = engine.clone();
        let connector = connector.clone();
        sessions.push(tokio::spawn(async move {
            engine
                .run_session("client", Endpoint::Tcp(ingress), &connector)
                .await
        }));
        clients.push(tokio::spawn(async move {
            client.write_all(&pattern(SIZE, seed)).await.unwrap();
            client.shutdown().await.unwrap();
            client
        }));
    }

    for client in clients {
        let _client = client.await.unwrap();
    }

    let received = timeout(Duration::from_secs(10), sink)
        .await
        .unwrap()
        .unwrap();
    for bytes in &received {
        assert_eq!(bytes.len(), SIZE);
        assert!(*bytes == pattern(SIZE, 11) || *bytes == pattern(SIZE, 22));
    }

    for session in sessions {
        let stats = session.await.unwrap().unwrap();
        assert_eq!(stats.bytes_up, SIZE as u64);
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_drain_cancels_active_sessions() {
    let egress_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connector = dial(egress_listener.local_addr().unwrap());
    let registry = Arc::new(SessionRegistry::new());
    let engine = RelayEngine::new(Arc::clone(&registry), &RelayConfig::default());

    let mut clients = Vec::new();
    let mut servers = Vec::new();
    let mut sessions = Vec::new();
    for _ in 0..3 {
        let (client, ingress) = tcp_pair().await;
        let engine = engine.clone();
        let connector = connector.clone();
        sessions.push(tokio::spawn(async move {
            engine
                .run_session("client", Endpoint::Tcp(ingress), &connector)
                .await
        }));
        let (server, _) = egress_listener.accept().await.unwrap();
        clients.push(client);
        servers.push(server);
    }

    assert_eq!(registry.len(), 3);
    timeout(Duration::from_secs(5), registry.drain())
        .await
        .unwrap();
    assert!(registry.is_empty());

    for session in sessions {
        assert!(session.await.unwrap().is_ok());
    }
    for mut client in clients {
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
    for mut server in servers {
        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }
}
