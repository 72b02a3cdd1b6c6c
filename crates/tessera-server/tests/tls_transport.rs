use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tessera_db::{
    create_pool, run_migrations, CertAuthStore, DbRuntimeSettings, SqliteCertAuthStore,
};
use tessera_identity::{hash_cert, testing, IdentityCertificate};
use tessera_server::{
    app, build_pipeline,
    certverify::AllowAll,
    config::{ExtractorKind, MdmConfig, TlsConfig},
    service::LoggingService,
    tls, AppState,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsConnector;

const AUTHENTICATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
<key>MessageType</key><string>Authenticate</string>
<key>UDID</key><string>0000-1111</string>
<key>Topic</key><string>com.apple.mgmt.External.test</string>
</dict>
</plist>"#;

struct TlsServer {
    addr: std::net::SocketAddr,
    ca: testing::TestAuthority,
    shutdown: Option<oneshot::Sender<()>>,
    _dir: tempfile::TempDir,
}

impl Drop for TlsServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Serves an enforcing `tls-peer` pipeline where `enrolled` is associated
/// with enrollment `0000-1111`.
async fn start_server(enrolled: &testing::TestIdentity) -> TlsServer {
    let ca = testing::certificate_authority("Tessera Test CA");
    let server = testing::server_identity(&ca, "localhost");

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("server.pem");
    let key_path = dir.path().join("server.key");
    std::fs::write(&cert_path, &server.cert_pem).unwrap();
    std::fs::write(
        &key_path,
        pem::encode(&pem::Pem::new("PRIVATE KEY", server.key_der.clone())),
    )
    .unwrap();
    let server_config = tls::load_server_config(&TlsConfig {
        cert_path: cert_path.to_str().unwrap().to_string(),
        key_path: key_path.to_str().unwrap().to_string(),
    })
    .unwrap();

    let pool = create_pool(
        ":memory:",
        DbRuntimeSettings {
            pool_max_size: 1,
            ..DbRuntimeSettings::default()
        },
    )
    .unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();
    let store = SqliteCertAuthStore::new(pool);
    let cert = IdentityCertificate::from_der(&enrolled.cert_der).unwrap();
    store.associate_cert_hash("0000-1111", &hash_cert(&cert)).unwrap();

    let config = MdmConfig {
        extractors: vec![ExtractorKind::TlsPeer],
        enforce_enrollment: true,
        ..MdmConfig::default()
    };
    let pipeline = build_pipeline(&config, Arc::new(AllowAll), Arc::new(store.clone())).unwrap();
    let router = app(AppState {
        pipeline: Arc::new(pipeline),
        service: Arc::new(LoggingService::new().with_cert_auth(Arc::new(store))),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(tls::serve_tls(listener, server_config, router, async move {
        let _ = rx.await;
    }));

    TlsServer {
        addr,
        ca,
        shutdown: Some(tx),
        _dir: dir,
    }
}

fn client_config(
    ca: &testing::TestAuthority,
    device: Option<&testing::TestIdentity>,
) -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca.identity.cert_der.clone()))
        .unwrap();
    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots);
    match device {
        Some(device) => builder
            .with_client_auth_cert(
                vec![CertificateDer::from(device.cert_der.clone())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(device.key_der.clone())),
            )
            .unwrap(),
        None => builder.with_no_client_auth(),
    }
}

/// Sends an Authenticate check-in over TLS and returns the status line.
async fn checkin(server: &TlsServer, device: Option<&testing::TestIdentity>) -> String {
    let connector = TlsConnector::from(Arc::new(client_config(&server.ca, device)));
    let tcp = TcpStream::connect(server.addr).await.unwrap();
    let mut stream = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();

    let request = format!(
        "PUT /checkin HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        AUTHENTICATE.len(),
        AUTHENTICATE
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut chunk = [0u8; 1024];
    while !response.windows(2).any(|w| w == b"\r\n") {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before a response arrived");
        response.extend_from_slice(&chunk[..n]);
    }
    let response = String::from_utf8_lossy(&response);
    response.lines().next().unwrap_or_default().to_string()
}

#[tokio::test]
async fn handshake_certificate_authenticates_enrolled_device() {
    let device = testing::device_identity("enrolled-device");
    let server = start_server(&device).await;

    assert_eq!(checkin(&server, Some(&device)).await, "HTTP/1.1 200 OK");
}

#[tokio::test]
async fn missing_or_unknown_client_certificate_is_a_bad_request() {
    let device = testing::device_identity("enrolled-device");
    let stranger = testing::device_identity("stranger");
    let server = start_server(&device).await;

    assert_eq!(checkin(&server, None).await, "HTTP/1.1 400 Bad Request");
    assert_eq!(
        checkin(&server, Some(&stranger)).await,
        "HTTP/1.1 400 Bad Request"
    );
}
