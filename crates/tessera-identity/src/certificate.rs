//! Enrollment identity certificates.

use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::CertificateError;

/// Dotted OID of the Subject Alternative Name extension.
pub const OID_SUBJECT_ALT_NAME: &str = "2.5.29.17";

/// An X.509 certificate presented by a device as its enrollment identity.
///
/// The certificate is only *asserted* identity until a trust policy has
/// accepted it. The DER bytes are kept verbatim so the certificate can be
/// hashed and re-parsed; the fields used on every request are parsed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCertificate {
    der: Vec<u8>,
    subject: String,
    issuer: String,
    serial: String,
    /// Critical extensions the parser could not act on, as dotted OIDs.
    ///
    /// Generic validation must reject a certificate while this list is
    /// non-empty.
    pub unhandled_critical_extensions: Vec<String>,
}

impl IdentityCertificate {
    /// Parses a DER encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError::Der`] for malformed input and
    /// [`CertificateError::TrailingData`] if bytes follow the certificate.
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let (rest, cert) =
            X509Certificate::from_der(der).map_err(|e| CertificateError::Der(e.to_string()))?;
        if !rest.is_empty() {
            return Err(CertificateError::TrailingData(rest.len()));
        }

        let unhandled_critical_extensions = cert
            .extensions()
            .iter()
            .filter(|ext| ext.critical && !is_handled(ext.parsed_extension()))
            .map(|ext| ext.oid.to_id_string())
            .collect();

        Ok(Self {
            der: der.to_vec(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            unhandled_critical_extensions,
        })
    }

    /// Parses the first PEM block of `pem_bytes`, which must be a `CERTIFICATE`.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError::Pem`] or [`CertificateError::UnexpectedPemTag`]
    /// for a bad envelope, and any [`IdentityCertificate::from_der`] error for
    /// the contents.
    pub fn from_pem(pem_bytes: &[u8]) -> Result<Self, CertificateError> {
        let block = pem::parse(pem_bytes).map_err(|e| CertificateError::Pem(e.to_string()))?;
        if block.tag() != "CERTIFICATE" {
            return Err(CertificateError::UnexpectedPemTag(block.tag().to_string()));
        }
        Self::from_der(block.contents())
    }

    /// Parses every `CERTIFICATE` block of a PEM bundle.
    ///
    /// # Errors
    ///
    /// Fails on the first block that is not a valid certificate.
    pub fn bundle_from_pem(pem_bytes: &[u8]) -> Result<Vec<Self>, CertificateError> {
        pem::parse_many(pem_bytes)
            .map_err(|e| CertificateError::Pem(e.to_string()))?
            .iter()
            .map(|block| {
                if block.tag() != "CERTIFICATE" {
                    return Err(CertificateError::UnexpectedPemTag(block.tag().to_string()));
                }
                Self::from_der(block.contents())
            })
            .collect()
    }

    /// Raw DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject distinguished name in RFC 4514 form.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Issuer distinguished name in RFC 4514 form.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Serial number as colon separated hex.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Removes the Subject Alternative Name from the unhandled critical
    /// extensions, leaving every other entry in place.
    ///
    /// Attestation certificates (`device-attest-01`) carry a critical SAN
    /// holding only a `PermanentIdentifier`, which the parser cannot map to
    /// any name type it understands. Running this more than once is a no-op.
    pub fn normalize_critical_extensions(&mut self) {
        self.unhandled_critical_extensions
            .retain(|oid| oid != OID_SUBJECT_ALT_NAME);
    }

    /// Re-parses the stored DER for checks that need the full structure.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError::Der`] if parsing fails, which cannot
    /// happen for a value built by [`IdentityCertificate::from_der`].
    pub fn parsed(&self) -> Result<X509Certificate<'_>, CertificateError> {
        X509Certificate::from_der(&self.der)
            .map(|(_, cert)| cert)
            .map_err(|e| CertificateError::Der(e.to_string()))
    }

    /// Whether the current time falls inside the validity period.
    ///
    /// # Errors
    ///
    /// See [`IdentityCertificate::parsed`].
    pub fn is_within_validity(&self) -> Result<bool, CertificateError> {
        Ok(self.parsed()?.validity().is_valid())
    }

    /// Checks that `issuer` issued and signed this certificate.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError::IssuerMismatch`] when the names do not
    /// chain and [`CertificateError::Signature`] when the issuer key does not
    /// verify the signature.
    pub fn verify_issued_by(&self, issuer: &IdentityCertificate) -> Result<(), CertificateError> {
        let cert = self.parsed()?;
        let issuer_cert = issuer.parsed()?;
        if cert.issuer() != issuer_cert.subject() {
            return Err(CertificateError::IssuerMismatch(issuer.subject.clone()));
        }
        cert.verify_signature(Some(issuer_cert.public_key()))
            .map_err(|e| CertificateError::Signature(e.to_string()))
    }
}

/// Hashes a certificate for enrollment lookups: hex SHA-256 of the DER bytes.
pub fn hash_cert(cert: &IdentityCertificate) -> String {
    hex::encode(Sha256::digest(cert.der()))
}

/// Whether the parser fully understood a critical extension.
///
/// A SAN only counts as handled if it names at least one DNS, e-mail, IP or
/// URI entry; a SAN of other-names alone stays unhandled.
fn is_handled(ext: &ParsedExtension<'_>) -> bool {
    match ext {
        ParsedExtension::UnsupportedExtension { .. } | ParsedExtension::ParseError { .. } => false,
        ParsedExtension::SubjectAlternativeName(san) => san.general_names.iter().any(|name| {
            matches!(
                name,
                GeneralName::DNSName(_)
                    | GeneralName::RFC822Name(_)
                    | GeneralName::IPAddress(_)
                    | GeneralName::URI(_)
            )
        }),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, permanent_identifier_san, unknown_critical_extension};

    const OTHER_OID: &str = "1.3.6.1.4.1.99999.1";

    fn cert_with_unhandled(oids: &[&str]) -> IdentityCertificate {
        let identity = testing::device_identity("unhandled-list");
        let mut cert = IdentityCertificate::from_der(&identity.cert_der).unwrap();
        cert.unhandled_critical_extensions = oids.iter().map(|oid| oid.to_string()).collect();
        cert
    }

    #[test]
    fn parses_pem_and_der_to_the_same_certificate() {
        let identity = testing::device_identity("device-1");
        let from_pem = IdentityCertificate::from_pem(identity.cert_pem.as_bytes()).unwrap();
        let from_der = IdentityCertificate::from_der(&identity.cert_der).unwrap();

        assert_eq!(from_pem, from_der);
        assert!(from_der.subject().contains("device-1"));
        assert!(from_der.unhandled_critical_extensions.is_empty());
    }

    #[test]
    fn rejects_garbage_and_wrong_pem_blocks() {
        assert!(matches!(
            IdentityCertificate::from_der(&[0x30, 0x03, 0x01, 0x02]),
            Err(CertificateError::Der(_))
        ));
        assert!(matches!(
            IdentityCertificate::from_pem(b"not a pem"),
            Err(CertificateError::Pem(_))
        ));

        let key_block = pem::encode(&pem::Pem::new("PRIVATE KEY", vec![1, 2, 3]));
        assert_eq!(
            IdentityCertificate::from_pem(key_block.as_bytes()),
            Err(CertificateError::UnexpectedPemTag("PRIVATE KEY".to_string()))
        );
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut der = testing::device_identity("trailing").cert_der;
        der.extend_from_slice(&[0, 0]);
        assert_eq!(
            IdentityCertificate::from_der(&der),
            Err(CertificateError::TrailingData(2))
        );
    }

    #[test]
    fn permanent_identifier_san_is_flagged_unhandled() {
        let identity = testing::device_identity_with_extensions(
            "attested",
            vec![permanent_identifier_san("C02ABCDEF")],
        );
        let cert = IdentityCertificate::from_der(&identity.cert_der).unwrap();
        assert_eq!(cert.unhandled_critical_extensions, vec![OID_SUBJECT_ALT_NAME]);
    }

    #[test]
    fn unknown_critical_extension_is_flagged_unhandled() {
        let identity = testing::device_identity_with_extensions(
            "unknown-ext",
            vec![
                permanent_identifier_san("C02ABCDEF"),
                unknown_critical_extension(&[1, 3, 6, 1, 4, 1, 99999, 1]),
            ],
        );
        let mut cert = IdentityCertificate::from_der(&identity.cert_der).unwrap();
        assert_eq!(cert.unhandled_critical_extensions.len(), 2);

        cert.normalize_critical_extensions();
        assert_eq!(cert.unhandled_critical_extensions, vec![OTHER_OID]);
    }

    #[test]
    fn normalize_removes_only_subject_alt_name() {
        let mut only_san = cert_with_unhandled(&[OID_SUBJECT_ALT_NAME]);
        only_san.normalize_critical_extensions();
        assert!(only_san.unhandled_critical_extensions.is_empty());

        let mut mixed = cert_with_unhandled(&[OID_SUBJECT_ALT_NAME, OTHER_OID]);
        mixed.normalize_critical_extensions();
        assert_eq!(mixed.unhandled_critical_extensions, vec![OTHER_OID]);

        let mut empty = cert_with_unhandled(&[]);
        empty.normalize_critical_extensions();
        assert!(empty.unhandled_critical_extensions.is_empty());
    }

    #[test]
    fn normalize_is_idempotent() {
        let mut once = cert_with_unhandled(&[OTHER_OID, OID_SUBJECT_ALT_NAME, "2.5.29.15"]);
        once.normalize_critical_extensions();
        let mut twice = once.clone();
        twice.normalize_critical_extensions();
        assert_eq!(once, twice);
        assert_eq!(once.unhandled_critical_extensions, vec![OTHER_OID, "2.5.29.15"]);
    }

    #[test]
    fn hash_is_hex_sha256_of_der() {
        let identity = testing::device_identity("hashing");
        let cert = IdentityCertificate::from_der(&identity.cert_der).unwrap();
        let hash = hash_cert(&cert);

        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hex::encode(Sha256::digest(&identity.cert_der)));
        assert_eq!(hash, hash_cert(&cert.clone()));
    }

    #[test]
    fn verify_issued_by_accepts_issuer_and_rejects_stranger() {
        let ca = testing::certificate_authority("Tessera Test CA");
        let leaf = testing::issued_identity(&ca, "issued-device");
        let stranger = testing::certificate_authority("Someone Else");

        let leaf_cert = IdentityCertificate::from_der(&leaf.cert_der).unwrap();
        let ca_cert = IdentityCertificate::from_der(&ca.identity.cert_der).unwrap();
        let stranger_cert = IdentityCertificate::from_der(&stranger.identity.cert_der).unwrap();

        assert_eq!(leaf_cert.verify_issued_by(&ca_cert), Ok(()));
        assert!(matches!(
            leaf_cert.verify_issued_by(&stranger_cert),
            Err(CertificateError::IssuerMismatch(_))
        ));
        assert!(leaf_cert.is_within_validity().unwrap());
    }

    #[test]
    fn parses_pem_bundle() {
        let first = testing::device_identity("bundle-1");
        let second = testing::device_identity("bundle-2");
        let bundle = format!("{}{}", first.cert_pem, second.cert_pem);

        let certs = IdentityCertificate::bundle_from_pem(bundle.as_bytes()).unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[1].der(), second.cert_der.as_slice());
    }
}
