//! Crate-wide error type for the client device authentication core.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the core domain, matching the kinds described by the
/// error handling design: invalid configuration, invalid CA, certificate
/// generation failure, invalid certificate, cloud interaction failure, and
/// invalid session/authorization.
#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value was missing, malformed, or internally
    /// inconsistent. Fatal to whatever operation attempted to apply it.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The configured (or newly supplied) certificate authority failed
    /// validation. The previously active CA remains live.
    #[error("invalid certificate authority: {0}")]
    InvalidCertificateAuthority(String),

    /// Issuance of a leaf certificate failed. Never propagates past the
    /// rotation worker boundary for an individual generator.
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// A certificate or chain failed structural or temporal validation.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// An upstream cloud call failed (network, throttling, 5xx, auth).
    #[error("cloud service interaction failed: {0}")]
    CloudServiceInteraction(String),

    /// A session id did not resolve to a live session.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// An authorization request was malformed or could not be evaluated.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Key material resolution or parsing failed.
    #[error(transparent)]
    KeyProvider(#[from] crate::ports::key_provider::KeyProviderError),

    /// X.509 port error.
    #[error(transparent)]
    X509(#[from] crate::ports::x509::X509Error),

    /// Runtime key/value store error.
    #[error(transparent)]
    Store(#[from] crate::ports::runtime_store::StoreError),

    /// I/O error, surfaced where the crate touches the filesystem directly
    /// (e.g. the file: key-provider scheme).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
