//! Verification of the `Mdm-Signature` request header.
//!
//! Devices sign the raw request body with their enrollment identity and send
//! the base64 of a DER CMS `ContentInfo` holding detached `SignedData`. A
//! successful verification yields the signer certificate, which then stands
//! in for a TLS client certificate.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerIdentifier, SignerInfo};
use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Encode};
use p256::ecdsa::signature::hazmat::PrehashVerifier as _;
use p256::pkcs8::DecodePublicKey as _;
use rsa::pkcs8::DecodePublicKey as _;
use rsa::Pkcs1v15Sign;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;
use x509_cert::Certificate;

use crate::{CertificateError, IdentityCertificate};

const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
const ID_MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");
const ID_SHA_1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.26");
const ID_SHA_256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
const ID_SHA_384: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.2");
const ID_SHA_512: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.3");
const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");
const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// Digest named by a signer info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    fn from_oid(oid: &ObjectIdentifier) -> Result<Self, SignatureError> {
        [
            (ID_SHA_1, Self::Sha1),
            (ID_SHA_256, Self::Sha256),
            (ID_SHA_384, Self::Sha384),
            (ID_SHA_512, Self::Sha512),
        ]
        .into_iter()
        .find(|(known, _)| known == oid)
        .map(|(_, alg)| alg)
        .ok_or_else(|| SignatureError::UnsupportedDigest(oid.to_string()))
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn pkcs1v15(self) -> Pkcs1v15Sign {
        match self {
            Self::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
            Self::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            Self::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
            Self::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
        }
    }
}

/// Errors produced while verifying an `Mdm-Signature` header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The header is not valid base64.
    #[error("signature is not valid base64: {0}")]
    Base64(String),
    /// The decoded bytes are not a CMS structure.
    #[error("malformed CMS structure: {0}")]
    Asn1(String),
    /// The `ContentInfo` holds something other than `SignedData`.
    #[error("unexpected CMS content type {0}")]
    NotSignedData(String),
    /// `SignedData` carries no signer.
    #[error("no signer info in signed data")]
    NoSigner,
    /// The signer is identified by something other than issuer and serial.
    #[error("unsupported signer identifier")]
    UnsupportedSignerIdentifier,
    /// None of the embedded certificates belongs to the signer.
    #[error("signer certificate not found")]
    SignerCertificateNotFound,
    /// The digest is not one of SHA-1, SHA-256, SHA-384 or SHA-512.
    #[error("unsupported digest algorithm {0}")]
    UnsupportedDigest(String),
    /// Signed attributes lack a usable `messageDigest`.
    #[error("missing message digest attribute")]
    MissingMessageDigest,
    /// The body does not match the signed digest.
    #[error("message digest does not match body")]
    DigestMismatch,
    /// The signer key is neither ECDSA on P-256 or P-384 nor RSA.
    #[error("unsupported signer key algorithm {0}")]
    UnsupportedKey(String),
    /// The signature does not verify under the signer key.
    #[error("signature verification failed")]
    BadSignature,
    /// The signer certificate could not be turned into an identity.
    #[error("signer certificate: {0}")]
    Certificate(#[from] CertificateError),
}

impl From<der::Error> for SignatureError {
    fn from(err: der::Error) -> Self {
        Self::Asn1(err.to_string())
    }
}

/// Verifies a detached CMS signature over `body` and returns the signer.
///
/// The first signer info is authoritative and its digest algorithm applies
/// throughout. When signed attributes are present their `messageDigest` must
/// equal the digest of `body` and the signature covers the attributes;
/// otherwise the signature covers `body` directly.
///
/// # Errors
///
/// Returns a [`SignatureError`] describing the first check that failed.
pub fn verify_mdm_signature(
    signature: &str,
    body: &[u8],
) -> Result<IdentityCertificate, SignatureError> {
    let der = STANDARD
        .decode(signature.trim())
        .map_err(|e| SignatureError::Base64(e.to_string()))?;
    let content_info = ContentInfo::from_der(&der)?;
    if content_info.content_type != ID_SIGNED_DATA {
        return Err(SignatureError::NotSignedData(
            content_info.content_type.to_string(),
        ));
    }
    let signed_data = SignedData::from_der(&content_info.content.to_der()?)?;

    let signer = signed_data
        .signer_infos
        .0
        .iter()
        .next()
        .ok_or(SignatureError::NoSigner)?;
    let cert = signer_certificate(&signed_data, signer)?;

    let digest_alg = DigestAlgorithm::from_oid(&signer.digest_alg.oid)?;

    let signed_message = match &signer.signed_attrs {
        Some(attrs) => {
            let digest = attrs
                .iter()
                .find(|attr| attr.oid == ID_MESSAGE_DIGEST)
                .and_then(|attr| attr.values.iter().next())
                .ok_or(SignatureError::MissingMessageDigest)?;
            let digest = OctetString::from_der(&digest.to_der()?)
                .map_err(|_| SignatureError::MissingMessageDigest)?;
            if digest.as_bytes() != digest_alg.digest(body).as_slice() {
                return Err(SignatureError::DigestMismatch);
            }
            attrs.to_der()?
        }
        None => body.to_vec(),
    };

    let prehash = digest_alg.digest(&signed_message);
    verify_with_certificate_key(cert, digest_alg, &prehash, signer.signature.as_bytes())?;

    Ok(IdentityCertificate::from_der(&cert.to_der()?)?)
}

fn signer_certificate<'a>(
    signed_data: &'a SignedData,
    signer: &SignerInfo,
) -> Result<&'a Certificate, SignatureError> {
    let SignerIdentifier::IssuerAndSerialNumber(sid) = &signer.sid else {
        return Err(SignatureError::UnsupportedSignerIdentifier);
    };
    signed_data
        .certificates
        .iter()
        .flat_map(|set| set.0.iter())
        .filter_map(|choice| match choice {
            CertificateChoices::Certificate(cert) => Some(cert),
            _ => None,
        })
        .find(|cert| {
            cert.tbs_certificate.issuer == sid.issuer
                && cert.tbs_certificate.serial_number == sid.serial_number
        })
        .ok_or(SignatureError::SignerCertificateNotFound)
}

fn verify_with_certificate_key(
    cert: &Certificate,
    digest_alg: DigestAlgorithm,
    prehash: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let spki = &cert.tbs_certificate.subject_public_key_info;
    let spki_der = spki.to_der()?;

    if spki.algorithm.oid == ID_EC_PUBLIC_KEY {
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .map(|params| params.to_der())
            .transpose()?
            .and_then(|params| ObjectIdentifier::from_der(&params).ok())
            .ok_or_else(|| SignatureError::UnsupportedKey("EC key without named curve".into()))?;
        if curve == SECP256R1 {
            let key = p256::ecdsa::VerifyingKey::from_public_key_der(&spki_der)
                .map_err(|e| SignatureError::UnsupportedKey(e.to_string()))?;
            let signature = p256::ecdsa::Signature::from_der(signature)
                .map_err(|_| SignatureError::BadSignature)?;
            key.verify_prehash(prehash, &signature)
                .map_err(|_| SignatureError::BadSignature)
        } else if curve == SECP384R1 {
            let key = p384::ecdsa::VerifyingKey::from_public_key_der(&spki_der)
                .map_err(|e| SignatureError::UnsupportedKey(e.to_string()))?;
            let signature = p384::ecdsa::Signature::from_der(signature)
                .map_err(|_| SignatureError::BadSignature)?;
            key.verify_prehash(prehash, &signature)
                .map_err(|_| SignatureError::BadSignature)
        } else {
            Err(SignatureError::UnsupportedKey(format!("EC curve {curve}")))
        }
    } else if spki.algorithm.oid == RSA_ENCRYPTION {
        let key = rsa::RsaPublicKey::from_public_key_der(&spki_der)
            .map_err(|e| SignatureError::UnsupportedKey(e.to_string()))?;
        key.verify(digest_alg.pkcs1v15(), prehash, signature)
            .map_err(|_| SignatureError::BadSignature)
    } else {
        Err(SignatureError::UnsupportedKey(spki.algorithm.oid.to_string()))
    }
}
