//! Per-request identity state threaded through the pipeline.

use tessera_identity::IdentityCertificate;

/// What the pipeline has learned about the device behind one request.
///
/// A scope is owned by a single request and grows by replacement: each
/// `with_*` call consumes the scope and returns an extended one, so a stage
/// that stops the pipeline leaves nothing half-written behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestScope {
    certificate: Option<IdentityCertificate>,
    enrollment_id: Option<String>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the extracted identity certificate, replacing any earlier one.
    pub fn with_certificate(self, certificate: IdentityCertificate) -> Self {
        Self {
            certificate: Some(certificate),
            ..self
        }
    }

    pub fn with_enrollment_id(self, enrollment_id: impl Into<String>) -> Self {
        Self {
            enrollment_id: Some(enrollment_id.into()),
            ..self
        }
    }

    /// Returns the identity certificate with the critical SAN quirk already
    /// normalized away.
    pub fn certificate(&self) -> Option<IdentityCertificate> {
        self.certificate.clone().map(|mut cert| {
            cert.normalize_critical_extensions();
            cert
        })
    }

    pub fn has_certificate(&self) -> bool {
        self.certificate.is_some()
    }

    /// The enrollment this request was bound to, if any.
    pub fn enrollment_id(&self) -> Option<&str> {
        self.enrollment_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_identity::{testing, OID_SUBJECT_ALT_NAME};

    #[test]
    fn empty_scope_has_nothing() {
        let scope = RequestScope::new();
        assert!(scope.certificate().is_none());
        assert!(!scope.has_certificate());
        assert_eq!(scope.enrollment_id(), None);
    }

    #[test]
    fn certificate_reads_are_normalized() {
        let identity = testing::device_identity_with_extensions(
            "attested",
            vec![testing::permanent_identifier_san("SERIAL123")],
        );
        let cert = IdentityCertificate::from_der(&identity.cert_der).unwrap();
        assert_eq!(cert.unhandled_critical_extensions, [OID_SUBJECT_ALT_NAME]);

        let scope = RequestScope::new().with_certificate(cert.clone());
        let read = scope.certificate().unwrap();
        assert!(read.unhandled_critical_extensions.is_empty());
        assert_eq!(read.der(), cert.der());

        // A second read goes through the same normalization.
        assert_eq!(scope.certificate(), Some(read));
    }

    #[test]
    fn later_certificate_replaces_earlier_one() {
        let first = testing::device_identity("first");
        let second = testing::device_identity("second");
        let scope = RequestScope::new()
            .with_certificate(IdentityCertificate::from_der(&first.cert_der).unwrap())
            .with_enrollment_id("abc")
            .with_certificate(IdentityCertificate::from_der(&second.cert_der).unwrap());

        assert_eq!(scope.certificate().unwrap().der(), second.cert_der.as_slice());
        assert_eq!(scope.enrollment_id(), Some("abc"));
    }
}
