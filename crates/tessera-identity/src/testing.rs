//! Certificate and `Mdm-Signature` fixtures for tests.
//!
//! Enabled inside this crate's own tests and, for dependent crates, through
//! the `test-util` feature. Nothing here is meant for production use, so
//! failures panic.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedAttributes, SignedData, SignerIdentifier,
    SignerInfo, SignerInfos,
};
use der::asn1::{ObjectIdentifier, OctetString, SetOfVec};
use der::{Any, Decode, Encode};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::pkcs8::DecodePrivateKey;
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, PKCS_ECDSA_P384_SHA384,
};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use x509_cert::attr::Attribute;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;

const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
const ID_CONTENT_TYPE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");
const ID_MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");

/// Digest a fixture signature is computed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureDigest {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl SignatureDigest {
    fn oid(self) -> ObjectIdentifier {
        ObjectIdentifier::new_unwrap(match self {
            Self::Sha1 => "1.3.14.3.2.26",
            Self::Sha256 => "2.16.840.1.101.3.4.2.1",
            Self::Sha384 => "2.16.840.1.101.3.4.2.2",
            Self::Sha512 => "2.16.840.1.101.3.4.2.3",
        })
    }

    fn ecdsa_oid(self) -> ObjectIdentifier {
        ObjectIdentifier::new_unwrap(match self {
            Self::Sha1 => "1.2.840.10045.4.1",
            Self::Sha256 => "1.2.840.10045.4.3.2",
            Self::Sha384 => "1.2.840.10045.4.3.3",
            Self::Sha512 => "1.2.840.10045.4.3.4",
        })
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

enum SigningKey {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

impl SigningKey {
    fn from_pkcs8_der(key_der: &[u8]) -> Self {
        match p256::ecdsa::SigningKey::from_pkcs8_der(key_der) {
            Ok(key) => Self::P256(key),
            Err(_) => Self::P384(
                p384::ecdsa::SigningKey::from_pkcs8_der(key_der).expect("P-256 or P-384 key"),
            ),
        }
    }

    /// The digest matching the curve size.
    fn natural_digest(&self) -> SignatureDigest {
        match self {
            Self::P256(_) => SignatureDigest::Sha256,
            Self::P384(_) => SignatureDigest::Sha384,
        }
    }

    fn sign_prehash(&self, prehash: &[u8]) -> Vec<u8> {
        match self {
            Self::P256(key) => {
                let signature: p256::ecdsa::Signature =
                    key.sign_prehash(prehash).expect("P-256 signature");
                signature.to_der().as_bytes().to_vec()
            }
            Self::P384(key) => {
                let signature: p384::ecdsa::Signature =
                    key.sign_prehash(prehash).expect("P-384 signature");
                signature.to_der().as_bytes().to_vec()
            }
        }
    }
}

/// A generated certificate with its ECDSA private key.
#[derive(Debug, Clone)]
pub struct TestIdentity {
    /// Certificate in DER format.
    pub cert_der: Vec<u8>,
    /// Certificate in PEM format.
    pub cert_pem: String,
    /// Private key in PKCS#8 DER format.
    pub key_der: Vec<u8>,
}

/// A generated CA able to issue further test identities.
pub struct TestAuthority {
    pub identity: TestIdentity,
    key_pair: KeyPair,
    certificate: rcgen::Certificate,
}

fn params_for(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params
}

/// Self-signed device identity without extensions beyond rcgen's defaults.
pub fn device_identity(common_name: &str) -> TestIdentity {
    device_identity_with_extensions(common_name, Vec::new())
}

/// Self-signed device identity carrying `extensions`.
pub fn device_identity_with_extensions(
    common_name: &str,
    extensions: Vec<CustomExtension>,
) -> TestIdentity {
    let key_pair = KeyPair::generate().expect("key generation");
    let mut params = params_for(common_name);
    params.custom_extensions = extensions;
    let cert = params.self_signed(&key_pair).expect("self-signed certificate");
    TestIdentity {
        cert_der: cert.der().to_vec(),
        cert_pem: cert.pem(),
        key_der: key_pair.serialize_der(),
    }
}

/// Self-signed device identity with a P-384 key.
pub fn device_identity_p384(common_name: &str) -> TestIdentity {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).expect("key generation");
    let cert = params_for(common_name)
        .self_signed(&key_pair)
        .expect("self-signed certificate");
    TestIdentity {
        cert_der: cert.der().to_vec(),
        cert_pem: cert.pem(),
        key_der: key_pair.serialize_der(),
    }
}

/// Critical SAN holding only a `PermanentIdentifier` other-name, as issued
/// for `device-attest-01` certificates.
pub fn permanent_identifier_san(value: &str) -> CustomExtension {
    let value = value.as_bytes();
    assert!(value.len() < 100, "short form DER lengths only");
    let len = value.len() as u8;

    let mut san = vec![0x30, len + 18, 0xa0, len + 16];
    // id-on-permanentIdentifier 1.3.6.1.5.5.7.8.3
    san.extend_from_slice(&[0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x08, 0x03]);
    san.extend_from_slice(&[0xa0, len + 4, 0x30, len + 2, 0x0c, len]);
    san.extend_from_slice(value);

    let mut ext = CustomExtension::from_oid_content(&[2, 5, 29, 17], san);
    ext.set_criticality(true);
    ext
}

/// Critical extension with an OID no parser knows, holding ASN.1 NULL.
pub fn unknown_critical_extension(oid: &[u64]) -> CustomExtension {
    let mut ext = CustomExtension::from_oid_content(oid, vec![0x05, 0x00]);
    ext.set_criticality(true);
    ext
}

/// Self-signed CA certificate.
pub fn certificate_authority(common_name: &str) -> TestAuthority {
    let key_pair = KeyPair::generate().expect("key generation");
    let mut params = params_for(common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let certificate = params.self_signed(&key_pair).expect("CA certificate");
    TestAuthority {
        identity: TestIdentity {
            cert_der: certificate.der().to_vec(),
            cert_pem: certificate.pem(),
            key_der: key_pair.serialize_der(),
        },
        key_pair,
        certificate,
    }
}

/// Device identity issued by `ca`.
pub fn issued_identity(ca: &TestAuthority, common_name: &str) -> TestIdentity {
    let key_pair = KeyPair::generate().expect("key generation");
    let cert = params_for(common_name)
        .signed_by(&key_pair, &ca.certificate, &ca.key_pair)
        .expect("issued certificate");
    TestIdentity {
        cert_der: cert.der().to_vec(),
        cert_pem: cert.pem(),
        key_der: key_pair.serialize_der(),
    }
}

/// TLS server identity for `dns_name` issued by `ca`.
pub fn server_identity(ca: &TestAuthority, dns_name: &str) -> TestIdentity {
    let key_pair = KeyPair::generate().expect("key generation");
    let mut params =
        CertificateParams::new(vec![dns_name.to_string()]).expect("server certificate params");
    params
        .distinguished_name
        .push(DnType::CommonName, dns_name);
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let cert = params
        .signed_by(&key_pair, &ca.certificate, &ca.key_pair)
        .expect("server certificate");
    TestIdentity {
        cert_der: cert.der().to_vec(),
        cert_pem: cert.pem(),
        key_der: key_pair.serialize_der(),
    }
}

/// Produces an `Mdm-Signature` header value for `body` signed by `identity`
/// with the digest matching its key size.
pub fn sign_detached(identity: &TestIdentity, body: &[u8]) -> String {
    let digest = SigningKey::from_pkcs8_der(&identity.key_der).natural_digest();
    sign(identity, &identity.key_der, body, digest)
}

/// Like [`sign_detached`] with an explicit digest algorithm.
pub fn sign_detached_with_digest(
    identity: &TestIdentity,
    body: &[u8],
    digest: SignatureDigest,
) -> String {
    sign(identity, &identity.key_der, body, digest)
}

/// Like [`sign_detached`] but signs with `key_der` while still naming
/// `identity` as the signer.
pub fn sign_detached_with_key(identity: &TestIdentity, key_der: &[u8], body: &[u8]) -> String {
    let digest = SigningKey::from_pkcs8_der(key_der).natural_digest();
    sign(identity, key_der, body, digest)
}

fn sign(identity: &TestIdentity, key_der: &[u8], body: &[u8], digest: SignatureDigest) -> String {
    let cert = Certificate::from_der(&identity.cert_der).expect("certificate DER");
    let digest_alg = AlgorithmIdentifierOwned {
        oid: digest.oid(),
        parameters: None,
    };

    let signed_attrs: SignedAttributes = SetOfVec::try_from(vec![
        attribute(ID_CONTENT_TYPE, Any::encode_from(&ID_DATA).expect("content type")),
        attribute(
            ID_MESSAGE_DIGEST,
            Any::encode_from(&OctetString::new(digest.digest(body)).expect("digest"))
                .expect("message digest"),
        ),
    ])
    .expect("signed attributes");

    let signing_key = SigningKey::from_pkcs8_der(key_der);
    let prehash = digest.digest(&signed_attrs.to_der().expect("attributes DER"));
    let signature = signing_key.sign_prehash(&prehash);

    let signer_info = SignerInfo {
        version: CmsVersion::V1,
        sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: cert.tbs_certificate.issuer.clone(),
            serial_number: cert.tbs_certificate.serial_number.clone(),
        }),
        digest_alg: digest_alg.clone(),
        signed_attrs: Some(signed_attrs),
        signature_algorithm: AlgorithmIdentifierOwned {
            oid: digest.ecdsa_oid(),
            parameters: None,
        },
        signature: OctetString::new(signature).expect("signature"),
        unsigned_attrs: None,
    };

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::try_from(vec![digest_alg]).expect("digest algorithms"),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: ID_DATA,
            econtent: None,
        },
        certificates: Some(CertificateSet(
            SetOfVec::try_from(vec![CertificateChoices::Certificate(cert)]).expect("certificates"),
        )),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info]).expect("signer infos")),
    };

    let content_info = ContentInfo {
        content_type: ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data).expect("signed data"),
    };
    STANDARD.encode(content_info.to_der().expect("content info DER"))
}

fn attribute(oid: ObjectIdentifier, value: Any) -> Attribute {
    Attribute {
        oid,
        values: SetOfVec::try_from(vec![value]).expect("attribute values"),
    }
}
