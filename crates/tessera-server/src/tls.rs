//! TLS listener that hands device client certificates to the pipeline.
//!
//! The handshake requests a client certificate but does not validate its
//! chain. Trust is decided by the pipeline's verify stage, so the handshake
//! only proves the device holds the certificate's private key. The chain is
//! attached to every request on the connection as [`PeerCertificates`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
    UnixTime,
};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::pipeline::PeerCertificates;

/// Connections that do not finish the handshake in time are dropped.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors setting up the TLS listener.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid PEM: {0}")]
    Pem(#[from] pem::PemError),

    #[error("no CERTIFICATE block in server certificate file")]
    MissingCertificate,

    #[error("no private key block in server key file")]
    MissingKey,

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// Asks for a client certificate and accepts any chain the client sends.
///
/// Handshake signatures are still checked, so a client cannot present a
/// certificate without its key.
#[derive(Debug)]
struct RequestClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for RequestClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Builds the server config from PEM encoded certificate chain and key.
///
/// # Errors
///
/// Returns a [`TlsError`] when either input holds no usable block or rustls
/// rejects the pair.
pub fn server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>, TlsError> {
    let chain: Vec<CertificateDer<'static>> = pem::parse_many(cert_pem)?
        .iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.contents().to_vec()))
        .collect();
    if chain.is_empty() {
        return Err(TlsError::MissingCertificate);
    }

    let key = pem::parse_many(key_pem)?
        .iter()
        .find_map(|block| {
            let der = block.contents().to_vec();
            match block.tag() {
                "PRIVATE KEY" => Some(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der))),
                "EC PRIVATE KEY" => Some(PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(der))),
                "RSA PRIVATE KEY" => Some(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der))),
                _ => None,
            }
        })
        .ok_or(TlsError::MissingKey)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(RequestClientCert {
        algorithms: provider.signature_verification_algorithms,
    });
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Reads the files named in `[server.tls]` and builds the server config.
///
/// # Errors
///
/// Returns [`TlsError::Read`] when a file cannot be read, otherwise as
/// [`server_config`].
pub fn load_server_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>, TlsError> {
    let read = |path: &str| {
        std::fs::read(path).map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })
    };
    server_config(&read(&tls.cert_path)?, &read(&tls.key_path)?)
}

/// Accepts TLS connections until `shutdown` resolves.
///
/// Each connection is served by `app` with the client's certificate chain
/// (empty when none was sent) available as a [`PeerCertificates`] extension.
/// Connections already accepted are left to finish on their own.
pub async fn serve_tls(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    app: Router,
    shutdown: impl Future<Output = ()>,
) {
    let acceptor = TlsAcceptor::from(config);
    tokio::pin!(shutdown);

    loop {
        let (tcp, peer_addr) = tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept TCP connection");
                    continue;
                }
            },
        };
        tokio::spawn(serve_connection(
            acceptor.clone(),
            tcp,
            peer_addr,
            app.clone(),
        ));
    }
}

async fn serve_connection(
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    peer_addr: SocketAddr,
    app: Router,
) {
    let tls = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            tracing::info!(peer = %peer_addr, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            tracing::warn!(
                peer = %peer_addr,
                timeout_secs = TLS_HANDSHAKE_TIMEOUT.as_secs(),
                "TLS handshake timed out"
            );
            return;
        }
    };

    let peers = PeerCertificates(
        tls.get_ref()
            .1
            .peer_certificates()
            .map(|chain| chain.iter().map(|cert| cert.as_ref().to_vec()).collect())
            .unwrap_or_default(),
    );
    tracing::debug!(
        peer = %peer_addr,
        client_certificates = peers.0.len(),
        "TLS handshake complete"
    );

    let service = TowerToHyperService::new(app.layer(Extension(peers)));
    let builder = auto::Builder::new(TokioExecutor::new());
    if let Err(e) = builder.serve_connection(TokioIo::new(tls), service).await {
        tracing::debug!(peer = %peer_addr, error = %e, "connection ended with error");
    }
}
