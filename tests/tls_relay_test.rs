//! Mutual-TLS ingress and egress

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio::time::timeout;

use migrelay::config::{ListenerConfig, ListenerKind, RelayConfig, TlsConfig};
use migrelay::relay::{RelayEngine, SessionRegistry, SessionState};
use migrelay::transport::{TlsAcceptor, TlsConnector};
use migrelay::{Acceptor, EgressConnector, EgressPolicy, EgressTarget, RelayError};

const CLIENT_CN: &str = "migration-source";

/// Write a CA plus server and client pairs using the default file names
fn write_certificates(dir: &Path) {
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "migrelay test CA");
    ca_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    ca_params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();
    let issuer = Issuer::from_params(&ca_params, &ca_key);

    let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    server_params
        .distinguished_name
        .push(DnType::CommonName, "localhost");
    server_params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    let server_key = KeyPair::generate().unwrap();
    let server_cert = server_params.signed_by(&server_key, &issuer).unwrap();

    let mut client_params = CertificateParams::default();
    client_params
        .distinguished_name
        .push(DnType::CommonName, CLIENT_CN);
    client_params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);
    let client_key = KeyPair::generate().unwrap();
    let client_cert = client_params.signed_by(&client_key, &issuer).unwrap();

    std::fs::write(dir.join("ca.pem"), ca_cert.pem()).unwrap();
    std::fs::write(dir.join("server-cert.pem"), server_cert.pem()).unwrap();
    std::fs::write(dir.join("server-key.pem"), server_key.serialize_pem()).unwrap();
    std::fs::write(dir.join("client-cert.pem"), client_cert.pem()).unwrap();
    std::fs::write(dir.join("client-key.pem"), client_key.serialize_pem()).unwrap();
}

fn tls_config(dir: &Path) -> TlsConfig {
    TlsConfig {
        cert_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

fn tls_listener(tls: &TlsConfig) -> Acceptor {
    let config = ListenerConfig {
        kind: ListenerKind::Tls,
        addr: Some("127.0.0.1:0".parse().unwrap()),
        ..Default::default()
    };
    Acceptor::bind(&config, Some(TlsAcceptor::new(tls).unwrap())).unwrap()
}

#[tokio::test]
async fn test_tls_ingress_relays_to_unix_egress() {
    let certs = tempfile::tempdir().unwrap();
    write_certificates(certs.path());
    let tls = tls_config(certs.path());

    let sockets = tempfile::tempdir().unwrap();
    let egress_path = sockets.path().join("dest.sock");
    let egress_listener = UnixListener::bind(&egress_path).unwrap();

    let acceptor = tls_listener(&tls);
    let addr = acceptor.local_addr().unwrap();

    let connector = TlsConnector::new(&tls).unwrap();
    let client = tokio::spawn(async move {
        let tcp = TcpStream::connect(addr).await.unwrap();
        connector.connect(tcp, "localhost").await.unwrap()
    });

    let pending = acceptor.accept().await.unwrap();
    let peer = pending.peer().to_string();
    let ingress = pending.establish().await.unwrap();
    assert_eq!(ingress.kind(), "tls");
    assert_eq!(ingress.peer_identity().as_deref(), Some(CLIENT_CN));

    let registry = Arc::new(SessionRegistry::new());
    let engine = RelayEngine::new(Arc::clone(&registry), &RelayConfig::default());
    let egress = EgressConnector::new(
        EgressPolicy::Dial(EgressTarget::Unix(egress_path)),
        Duration::from_secs(5),
        None,
    );
    let session = tokio::spawn(async move { engine.run_session(&peer, ingress, &egress).await });

    let (mut dest, _) = egress_listener.accept().await.unwrap();
    let mut client = client.await.unwrap();

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    client.write_all(&payload).await.unwrap();
    client.flush().await.unwrap();

    let mut received = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), dest.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, payload);

    dest.write_all(b"ack").await.unwrap();
    let mut ack = [0u8; 3];
    timeout(Duration::from_secs(5), client.read_exact(&mut ack))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&ack, b"ack");

    drop(dest);
    let stats = timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.bytes_up, payload.len() as u64);
    assert_eq!(stats.bytes_down, 3);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_tls_ingress_rejects_untrusted_client() {
    let certs = tempfile::tempdir().unwrap();
    write_certificates(certs.path());
    let tls = tls_config(certs.path());

    // Trusts the real CA but presents a certificate issued by another one
    let rogue = tempfile::tempdir().unwrap();
    write_certificates(rogue.path());
    std::fs::copy(certs.path().join("ca.pem"), rogue.path().join("trusted-ca.pem")).unwrap();
    let rogue_client = TlsConfig {
        ca_file: "trusted-ca.pem".to_string(),
        ..tls_config(rogue.path())
    };

    let acceptor = tls_listener(&tls);
    let addr = acceptor.local_addr().unwrap();

    let connector = TlsConnector::new(&rogue_client).unwrap();
    let client = tokio::spawn(async move {
        let tcp = TcpStream::connect(addr).await.unwrap();
        connector.connect(tcp, "localhost").await
    });

    let pending = acceptor.accept().await.unwrap();
    let result = timeout(Duration::from_secs(5), pending.establish())
        .await
        .unwrap();
    assert!(matches!(result, Err(RelayError::Tls(_))));

    let _ = client.await.unwrap();
}

#[tokio::test]
async fn test_tls_egress_dial_presents_client_certificate() {
    let certs = tempfile::tempdir().unwrap();
    write_certificates(certs.path());
    let tls = tls_config(certs.path());

    let remote = tls_listener(&tls);
    let addr = remote.local_addr().unwrap();

    let connector = EgressConnector::new(
        EgressPolicy::Dial(EgressTarget::Tls {
            addr: addr.to_string(),
            server_name: "localhost".to_string(),
        }),
        Duration::from_secs(5),
        Some(TlsConnector::new(&tls).unwrap()),
    );

    let server = tokio::spawn(async move {
        let pending = remote.accept().await.unwrap();
        let endpoint = pending.establish().await.unwrap();
        let identity = endpoint.peer_identity();
        let (mut reader, _writer) = endpoint.split(8192);
        let chunk = reader.read().await.unwrap().unwrap();
        (identity, chunk)
    });

    let endpoint = connector.connect().await.unwrap();
    assert_eq!(endpoint.kind(), "tls");
    let (_reader, mut writer) = endpoint.split(8192);
    writer.write(b"page data").await.unwrap();

    let (identity, chunk) = timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(identity.as_deref(), Some(CLIENT_CN));
    assert_eq!(&chunk[..], b"page data");
}

#[tokio::test]
async fn test_tls_egress_without_connector_is_config_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connector = EgressConnector::new(
        EgressPolicy::Dial(EgressTarget::Tls {
            addr: listener.local_addr().unwrap().to_string(),
            server_name: "localhost".to_string(),
        }),
        Duration::from_secs(1),
        None,
    );

    let err = connector.connect().await.err().unwrap();
    assert!(matches!(err, RelayError::Config(_)));
}

#[tokio::test]
async fn test_drain_returns_with_stalled_tls_client() {
    let certs = tempfile::tempdir().unwrap();
    write_certificates(certs.path());
    let tls = tls_config(certs.path());

    let sockets = tempfile::tempdir().unwrap();
    let egress_path = sockets.path().join("dest.sock");
    let egress_listener = UnixListener::bind(&egress_path).unwrap();

    let acceptor = tls_listener(&tls);
    let addr = acceptor.local_addr().unwrap();

    let connector = TlsConnector::new(&tls).unwrap();
    let client = tokio::spawn(async move {
        let tcp = TcpStream::connect(addr).await.unwrap();
        connector.connect(tcp, "localhost").await.unwrap()
    });

    let pending = acceptor.accept().await.unwrap();
    let ingress = pending.establish().await.unwrap();
    // Held open but never read from
    let client = client.await.unwrap();

    let registry = Arc::new(SessionRegistry::new());
    let engine = RelayEngine::new(Arc::clone(&registry), &RelayConfig::default());
    let egress = EgressConnector::new(
        EgressPolicy::Dial(EgressTarget::Unix(egress_path)),
        Duration::from_secs(5),
        None,
    );
    let session = tokio::spawn(async move { engine.run_session("client", ingress, &egress).await });

    let (mut dest, _): (UnixStream, _) = egress_listener.accept().await.unwrap();
    let flooder = tokio::spawn(async move {
        let chunk = vec![0xa5u8; 64 * 1024];
        while dest.write_all(&chunk).await.is_ok() {}
    });

    timeout(Duration::from_secs(5), async {
        while !registry
            .snapshot()
            .iter()
            .any(|(_, state)| *state == SessionState::Active)
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    // Give the socket buffers time to fill up
    tokio::time::sleep(Duration::from_millis(300)).await;

    timeout(Duration::from_secs(5), registry.drain())
        .await
        .expect("drain waited on a client that stopped reading");
    assert!(registry.is_empty());

    let stats = timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(stats.bytes_down > 0);

    drop(client);
    timeout(Duration::from_secs(5), flooder)
        .await
        .unwrap()
        .unwrap();
}
