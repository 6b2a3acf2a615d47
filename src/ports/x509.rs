//! X.509 certificate port.
//!
//! This defines the interface the certificate authority and issuer use for
//! key generation, self-signing, leaf issuance and chain-signature checks.
//! The concrete implementation (`adapters::rcgen_x509`) is swappable, the
//! same hexagonal split the rest of this crate uses for the runtime store
//! and the upstream cloud client.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::types::{DistinguishedName, KeyAlgorithm, SanEntry};

/// Port for X.509 key generation, self-signing, leaf issuance and chain
/// signature verification.
///
/// All operations are CPU-bound and synchronous by design (per the
/// concurrency model, issuance runs on the rotation worker rather than an
/// async executor thread); callers that need to keep an async context
/// responsive should run these through `spawn_blocking` or the worker pool
/// rather than awaiting them directly.
pub trait X509Port: Send + Sync {
    /// Generate a fresh private key for the given algorithm.
    fn generate_key_pair(&self, algorithm: KeyAlgorithm) -> Result<PrivateKey, X509Error>;

    /// Produce a self-signed CA certificate over `key`, with
    /// `BasicConstraints=CA:TRUE` and the given `path_len_constraint`.
    fn self_signed_ca(
        &self,
        subject: &DistinguishedName,
        key: &PrivateKey,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
        path_len_constraint: Option<u8>,
    ) -> Result<Certificate, X509Error>;

    /// Issue a leaf certificate signed by `issuer_key`/`issuer_cert`.
    fn issue_leaf(&self, req: &LeafRequest) -> Result<Certificate, X509Error>;

    /// Parse PEM (or DER, auto-detected) bytes into a `ParsedCertificate`.
    fn parse_certificate(&self, pem_or_der: &[u8]) -> Result<ParsedCertificate, X509Error>;

    /// Verify that `subject`'s signature was produced by `issuer`'s public
    /// key, i.e. `issuer` issued `subject`. Does not check validity
    /// windows or any other chain-building concern; callers sequence this
    /// per adjacent pair themselves.
    fn is_signed_by(
        &self,
        subject: &ParsedCertificate,
        issuer: &ParsedCertificate,
    ) -> Result<bool, X509Error>;

    /// Whether `key`'s public half is the same public key embedded in
    /// `certificate_der` (a full DER-encoded certificate). Used to catch a
    /// custom CA whose supplied certificate and private key disagree at
    /// load time rather than at first issuance.
    fn public_key_matches(&self, key: &PrivateKey, certificate_der: &[u8]) -> Result<bool, X509Error>;
}

/// A private key, carried as PKCS#8 DER plus its algorithm tag. The DER
/// bytes are the only sensitive payload in this struct; callers that hold
/// one for longer than a single operation should wrap it for zeroization
/// (see `ca::store::Secret`).
#[derive(Clone)]
pub struct PrivateKey {
    /// Key algorithm.
    pub algorithm: KeyAlgorithm,
    /// PKCS#8 DER-encoded private key bytes.
    pub pkcs8_der: Vec<u8>,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("algorithm", &self.algorithm)
            .field("pkcs8_der", &"<redacted>")
            .finish()
    }
}

/// An issued or parsed X.509 certificate, carried in both DER and PEM form
/// so callers can avoid re-encoding for the common case (persistence wants
/// PEM, chain verification wants DER).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    /// DER-encoded certificate bytes.
    pub der: Vec<u8>,
    /// PEM-encoded certificate text (BEGIN/END CERTIFICATE, 64-column
    /// wrapped, LF line endings).
    pub pem: String,
    /// Subject distinguished name.
    pub subject: DistinguishedName,
    /// Issuer distinguished name.
    pub issuer: DistinguishedName,
    /// Validity start.
    pub not_before: OffsetDateTime,
    /// Validity end.
    pub not_after: OffsetDateTime,
    /// Whether this certificate carries `BasicConstraints=CA:TRUE`.
    pub is_ca: bool,
}

/// A certificate parsed from external bytes, with enough structure to
/// drive chain validation without re-deriving it from raw DER each time.
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    /// DER-encoded certificate bytes (canonical form used for signature
    /// verification and re-export).
    pub der: Vec<u8>,
    /// Subject distinguished name.
    pub subject: DistinguishedName,
    /// Issuer distinguished name.
    pub issuer: DistinguishedName,
    /// Validity start.
    pub not_before: OffsetDateTime,
    /// Validity end.
    pub not_after: OffsetDateTime,
    /// Whether this certificate is self-signed (subject == issuer and the
    /// signature verifies against its own public key).
    pub is_self_signed: bool,
}

/// Key usage flags recognized by leaf issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    /// `digitalSignature`.
    DigitalSignature,
    /// `keyEncipherment`.
    KeyEncipherment,
    /// `keyCertSign`.
    KeyCertSign,
    /// `cRLSign`.
    CrlSign,
}

/// Extended key usage purposes recognized by leaf issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedKeyUsage {
    /// `id-kp-serverAuth`.
    ServerAuth,
    /// `id-kp-clientAuth`.
    ClientAuth,
}

/// Request to issue a leaf certificate.
pub struct LeafRequest<'a> {
    /// Leaf subject distinguished name.
    pub subject: DistinguishedName,
    /// Leaf's own key pair. Only its public half ends up in the issued
    /// certificate's SubjectPublicKeyInfo; the signature over the
    /// certificate is produced by `issuer_key`, never by this key.
    pub subject_key: &'a PrivateKey,
    /// Issuing CA certificate.
    pub issuer_cert: &'a Certificate,
    /// Issuing CA private key.
    pub issuer_key: &'a PrivateKey,
    /// Validity start.
    pub not_before: OffsetDateTime,
    /// Validity end.
    pub not_after: OffsetDateTime,
    /// Uniformly random 20-byte positive serial number.
    pub serial: [u8; 20],
    /// Key usage extension entries.
    pub key_usage: Vec<KeyUsage>,
    /// Extended key usage extension entries.
    pub extended_key_usage: Vec<ExtendedKeyUsage>,
    /// Subject Alternative Name entries (server leaves only).
    pub subject_alt_names: Vec<SanEntry>,
}

/// X.509 operation errors.
#[derive(Debug, Error)]
pub enum X509Error {
    /// A supplied key or certificate was malformed.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Certificate parsing failed.
    #[error("failed to parse certificate: {0}")]
    ParseFailed(String),

    /// Certificate/key generation or signing failed.
    #[error("certificate generation failed: {0}")]
    GenerationFailed(String),

    /// Signature verification failed due to an algorithm mismatch or
    /// corrupt signature, as distinct from "verified false".
    #[error("signature verification error: {0}")]
    VerificationError(String),
}
