//! Pipeline stages: identity extraction, the trust gate and enrollment
//! binding.

use std::sync::Arc;

use axum::http::HeaderName;
use percent_encoding::percent_decode_str;
use tessera_db::CertAuthRetriever;
use tessera_identity::{verify_mdm_signature, IdentityCertificate};
use thiserror::Error;

use crate::certverify::CertVerifier;
use crate::pipeline::{Flow, InboundRequest, PipelineError, Rejection, Stage};
use crate::scope::RequestScope;

/// Header carrying the detached CMS signature of the request body.
pub const MDM_SIGNATURE_HEADER: &str = "Mdm-Signature";

/// Hashes an identity certificate into an enrollment lookup key.
pub type HashFn = Arc<dyn Fn(&IdentityCertificate) -> String + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
enum UnescapeError {
    #[error("invalid URL escape {0:?}")]
    InvalidEscape(String),
}

/// Decodes a URL query component: `+` becomes a space and every `%` must
/// start a two digit hex escape.
fn query_unescape(value: &str) -> Result<Vec<u8>, UnescapeError> {
    let bytes = value.as_bytes();
    for (i, _) in value.match_indices('%') {
        match bytes.get(i + 1..i + 3) {
            Some([hi, lo]) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {}
            _ => {
                let end = (i + 3).min(bytes.len());
                return Err(UnescapeError::InvalidEscape(
                    String::from_utf8_lossy(&bytes[i..end]).into_owned(),
                ));
            }
        }
    }
    let spaced = value.replace('+', " ");
    Ok(percent_decode_str(&spaced).collect())
}

/// Extracts the identity certificate from a URL-escaped PEM header, as set
/// by a TLS-terminating proxy (nginx `$ssl_client_escaped_cert`).
#[derive(Debug, Clone)]
pub struct PemHeaderExtractor {
    header: HeaderName,
}

impl PemHeaderExtractor {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidHeaderName`] if `name` is not a valid
    /// HTTP header name.
    pub fn from_name(name: &str) -> Result<Self, PipelineError> {
        HeaderName::from_bytes(name.as_bytes())
            .map(Self::new)
            .map_err(|_| PipelineError::InvalidHeaderName(name.to_string()))
    }
}

impl Stage for PemHeaderExtractor {
    fn handle(&self, req: &InboundRequest, scope: RequestScope) -> Flow {
        let header = self.header.as_str();
        let Some(value) = req.headers.get(&self.header).filter(|v| !v.is_empty()) else {
            tracing::debug!(header, "empty certificate header");
            return Flow::Next(scope);
        };
        let value = match value.to_str() {
            Ok(value) => value,
            Err(err) => {
                tracing::info!(header, error = %err, "reading certificate header");
                return Flow::Stop(Rejection::bad_request());
            }
        };
        let pem = match query_unescape(value) {
            Ok(pem) => pem,
            Err(err) => {
                tracing::info!(header, error = %err, "unescaping certificate header");
                return Flow::Stop(Rejection::bad_request());
            }
        };
        match IdentityCertificate::from_pem(&pem) {
            Ok(cert) => Flow::Next(scope.with_certificate(cert)),
            Err(err) => {
                tracing::info!(header, error = %err, "decoding certificate header");
                Flow::Stop(Rejection::bad_request())
            }
        }
    }
}

/// Extracts the identity certificate from the TLS client certificate.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsPeerExtractor;

impl Stage for TlsPeerExtractor {
    fn handle(&self, req: &InboundRequest, scope: RequestScope) -> Flow {
        let Some(der) = req.peer_certificates.first() else {
            tracing::debug!("no TLS peer certificate");
            return Flow::Next(scope);
        };
        match IdentityCertificate::from_der(der) {
            Ok(cert) => Flow::Next(scope.with_certificate(cert)),
            Err(err) => {
                tracing::info!(error = %err, "decoding TLS peer certificate");
                Flow::Stop(Rejection::bad_request())
            }
        }
    }
}

/// When the raw `Mdm-Signature` value is written to the logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignatureLogConfig {
    /// Attach the signature to every event and log successful verifications.
    pub always: bool,
    /// Attach the signature to verification failures.
    pub errors: bool,
}

impl SignatureLogConfig {
    fn attaches_signature(&self) -> bool {
        self.always || self.errors
    }
}

/// Extracts the identity certificate by verifying the `Mdm-Signature`
/// header against the request body.
#[derive(Debug, Clone, Default)]
pub struct MdmSignatureExtractor {
    log: SignatureLogConfig,
}

impl MdmSignatureExtractor {
    pub fn new(log: SignatureLogConfig) -> Self {
        Self { log }
    }
}

impl Stage for MdmSignatureExtractor {
    fn handle(&self, req: &InboundRequest, scope: RequestScope) -> Flow {
        let Some(value) = req
            .headers
            .get(MDM_SIGNATURE_HEADER)
            .filter(|v| !v.is_empty())
        else {
            tracing::debug!("empty Mdm-Signature header");
            return Flow::Next(scope);
        };
        let signature = match value.to_str() {
            Ok(signature) => signature,
            Err(err) => {
                tracing::info!(error = %err, "reading Mdm-Signature header");
                return Flow::Stop(Rejection::bad_request());
            }
        };
        let logged = self.log.attaches_signature().then_some(signature);

        match verify_mdm_signature(signature, &req.body) {
            Ok(cert) => {
                if self.log.always {
                    tracing::debug!(
                        mdm_signature = logged,
                        subject = cert.subject(),
                        "verified Mdm-Signature header"
                    );
                }
                Flow::Next(scope.with_certificate(cert))
            }
            Err(err) => {
                tracing::info!(
                    mdm_signature = logged,
                    error = %err,
                    "verifying Mdm-Signature header"
                );
                Flow::Stop(Rejection::bad_request())
            }
        }
    }
}

/// Rejects requests whose certificate the configured verifier refuses.
#[derive(Clone)]
pub struct CertVerifyStage {
    verifier: Arc<dyn CertVerifier>,
}

impl CertVerifyStage {
    pub fn new(verifier: Arc<dyn CertVerifier>) -> Self {
        Self { verifier }
    }
}

impl Stage for CertVerifyStage {
    fn handle(&self, _req: &InboundRequest, scope: RequestScope) -> Flow {
        let cert = scope.certificate();
        match self.verifier.verify(&scope, cert.as_ref()) {
            Ok(()) => Flow::Next(scope),
            Err(err) => {
                tracing::info!(error = %err, "verifying identity certificate");
                Flow::Stop(Rejection::bad_request())
            }
        }
    }
}

/// Binds the identity certificate to an enrollment ID through the
/// certificate association store.
pub struct EnrollmentBinder {
    hasher: HashFn,
    store: Arc<dyn CertAuthRetriever>,
    enforce: bool,
}

impl EnrollmentBinder {
    pub fn builder() -> EnrollmentBinderBuilder {
        EnrollmentBinderBuilder::default()
    }

    fn unresolved(&self, scope: RequestScope, reason: &'static str) -> Flow {
        if self.enforce {
            tracing::info!(reason, "enrollment required");
            Flow::Stop(Rejection::bad_request())
        } else {
            tracing::debug!(reason, "continuing without enrollment");
            Flow::Next(scope)
        }
    }
}

impl Stage for EnrollmentBinder {
    fn handle(&self, _req: &InboundRequest, scope: RequestScope) -> Flow {
        let Some(cert) = scope.certificate() else {
            return self.unresolved(scope, "missing identity certificate");
        };
        let hash = (self.hasher)(&cert);
        match self.store.enrollment_from_hash(&hash) {
            Err(err) => {
                tracing::info!(hash = %hash, error = %err, "retrieving enrollment for certificate");
                Flow::Stop(Rejection::internal())
            }
            Ok(id) if id.is_empty() => {
                self.unresolved(scope, "certificate not associated with an enrollment")
            }
            Ok(id) => Flow::Next(scope.with_enrollment_id(id)),
        }
    }
}

#[derive(Default)]
pub struct EnrollmentBinderBuilder {
    hasher: Option<HashFn>,
    store: Option<Arc<dyn CertAuthRetriever>>,
    enforce: bool,
}

impl EnrollmentBinderBuilder {
    pub fn hasher(mut self, hasher: HashFn) -> Self {
        self.hasher = Some(hasher);
        self
    }

    pub fn store(mut self, store: Arc<dyn CertAuthRetriever>) -> Self {
        self.store = Some(store);
        self
    }

    /// Reject requests that cannot be bound to an enrollment.
    pub fn enforce(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::MissingHasher`] or
    /// [`PipelineError::MissingStore`] when a collaborator was not supplied.
    pub fn build(self) -> Result<EnrollmentBinder, PipelineError> {
        Ok(EnrollmentBinder {
            hasher: self.hasher.ok_or(PipelineError::MissingHasher)?,
            store: self.store.ok_or(PipelineError::MissingStore)?,
            enforce: self.enforce,
        })
    }
}
