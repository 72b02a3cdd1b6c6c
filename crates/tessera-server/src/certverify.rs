//! Trust policies for identity certificates.

use tessera_identity::{CertificateError, IdentityCertificate};
use thiserror::Error;

use crate::scope::RequestScope;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("no identity certificate presented")]
    MissingCertificate,

    #[error("unhandled critical extensions: {}", .0.join(", "))]
    UnhandledCriticalExtensions(Vec<String>),

    #[error("certificate is outside its validity period")]
    OutsideValidity,

    #[error("certificate issuer {0:?} is not trusted")]
    UntrustedIssuer(String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Decides whether an identity certificate is acceptable for a request.
///
/// Implementations are shared by every in-flight request.
pub trait CertVerifier: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`VerifyError`] describing why the certificate is rejected.
    fn verify(
        &self,
        scope: &RequestScope,
        cert: Option<&IdentityCertificate>,
    ) -> Result<(), VerifyError>;
}

/// Accepts any certificate, and the absence of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CertVerifier for AllowAll {
    fn verify(
        &self,
        _scope: &RequestScope,
        _cert: Option<&IdentityCertificate>,
    ) -> Result<(), VerifyError> {
        Ok(())
    }
}

/// Accepts certificates issued directly by one of a fixed set of CAs.
#[derive(Debug, Clone)]
pub struct PoolVerifier {
    roots: Vec<IdentityCertificate>,
    check_validity: bool,
}

impl PoolVerifier {
    pub fn new(roots: Vec<IdentityCertificate>) -> Self {
        Self {
            roots,
            check_validity: true,
        }
    }

    /// Builds a verifier from a PEM bundle of CA certificates.
    ///
    /// # Errors
    ///
    /// Returns a [`CertificateError`] if any block fails to parse.
    pub fn from_pem(bundle: &[u8]) -> Result<Self, CertificateError> {
        IdentityCertificate::bundle_from_pem(bundle).map(Self::new)
    }

    pub fn with_validity_check(mut self, check_validity: bool) -> Self {
        self.check_validity = check_validity;
        self
    }

    pub fn roots(&self) -> &[IdentityCertificate] {
        &self.roots
    }
}

impl CertVerifier for PoolVerifier {
    fn verify(
        &self,
        _scope: &RequestScope,
        cert: Option<&IdentityCertificate>,
    ) -> Result<(), VerifyError> {
        let cert = cert.ok_or(VerifyError::MissingCertificate)?;
        if !cert.unhandled_critical_extensions.is_empty() {
            return Err(VerifyError::UnhandledCriticalExtensions(
                cert.unhandled_critical_extensions.clone(),
            ));
        }
        if self.check_validity && !cert.is_within_validity()? {
            return Err(VerifyError::OutsideValidity);
        }
        if self
            .roots
            .iter()
            .any(|root| cert.verify_issued_by(root).is_ok())
        {
            Ok(())
        } else {
            Err(VerifyError::UntrustedIssuer(cert.issuer().to_string()))
        }
    }
}
