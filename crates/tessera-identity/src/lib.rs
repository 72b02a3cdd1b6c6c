//! Device identity primitives for the Tessera MDM core.
//!
//! This crate owns everything that touches X.509 material presented by a
//! device: parsing the enrollment identity certificate, repairing the
//! critical-extension quirk of attestation certificates, hashing certificates
//! for enrollment lookups, and verifying detached `Mdm-Signature` headers.

mod certificate;
mod signature;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use certificate::{hash_cert, IdentityCertificate, OID_SUBJECT_ALT_NAME};
pub use signature::{verify_mdm_signature, SignatureError};

use thiserror::Error;

/// Errors produced while parsing or checking an identity certificate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertificateError {
    /// The PEM envelope could not be parsed.
    #[error("malformed PEM: {0}")]
    Pem(String),
    /// The PEM block is not a certificate.
    #[error("unexpected PEM block type {0:?}")]
    UnexpectedPemTag(String),
    /// The DER structure is not a valid X.509 certificate.
    #[error("malformed certificate: {0}")]
    Der(String),
    /// Bytes remained after the certificate structure.
    #[error("{0} trailing bytes after certificate")]
    TrailingData(usize),
    /// The certificate names a different issuer.
    #[error("certificate was not issued by {0}")]
    IssuerMismatch(String),
    /// The issuer's key did not verify the certificate signature.
    #[error("certificate signature check failed: {0}")]
    Signature(String),
}
