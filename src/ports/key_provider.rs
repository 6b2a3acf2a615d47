//! Key provider port.
//!
//! Resolves custom-CA key and certificate material from a URI, dispatching
//! on the URI scheme the way `CAStore::loadCustom` requires (`file:` at
//! minimum, `pkcs11:` behind the `pkcs11` feature).

use thiserror::Error;

use crate::ports::x509::PrivateKey;

/// Resolves key and certificate bytes referenced by a URI.
pub trait KeyProvider: Send + Sync {
    /// Fetch a private key referenced by `uri` (e.g. `file:///etc/cda/ca.key`).
    fn resolve_private_key(&self, uri: &str) -> Result<PrivateKey, KeyProviderError>;

    /// Fetch certificate bytes (PEM, possibly a chain) referenced by `uri`.
    fn resolve_certificate(&self, uri: &str) -> Result<Vec<u8>, KeyProviderError>;
}

/// A provider that dispatches to one of several schemed providers based on
/// the URI's scheme (`scheme:rest`).
pub struct SchemeRouter {
    providers: Vec<(String, Box<dyn KeyProvider>)>,
}

impl SchemeRouter {
    /// Build a router with no registered schemes.
    pub fn new() -> Self {
        Self { providers: Vec::new() }
    }

    /// Register a provider for the given scheme (without the trailing `:`).
    pub fn register(&mut self, scheme: impl Into<String>, provider: Box<dyn KeyProvider>) {
        self.providers.push((scheme.into(), provider));
    }

    fn scheme_of(uri: &str) -> Result<&str, KeyProviderError> {
        uri.split_once(':')
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| KeyProviderError::UnsupportedScheme(uri.to_string()))
    }

    fn provider_for<'a>(&'a self, uri: &str) -> Result<&'a dyn KeyProvider, KeyProviderError> {
        let scheme = Self::scheme_of(uri)?;
        self.providers
            .iter()
            .find(|(s, _)| s == scheme)
            .map(|(_, p)| p.as_ref())
            .ok_or_else(|| KeyProviderError::UnsupportedScheme(scheme.to_string()))
    }
}

impl Default for SchemeRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyProvider for SchemeRouter {
    fn resolve_private_key(&self, uri: &str) -> Result<PrivateKey, KeyProviderError> {
        self.provider_for(uri)?.resolve_private_key(uri)
    }

    fn resolve_certificate(&self, uri: &str) -> Result<Vec<u8>, KeyProviderError> {
        self.provider_for(uri)?.resolve_certificate(uri)
    }
}

/// Key provider errors.
#[derive(Debug, Error)]
pub enum KeyProviderError {
    /// No provider registered for the URI's scheme.
    #[error("unsupported key provider scheme: {0}")]
    UnsupportedScheme(String),

    /// The referenced resource does not exist or could not be read.
    #[error("key material not found: {0}")]
    NotFound(String),

    /// The resource was read but could not be parsed as key/certificate
    /// material.
    #[error("malformed key material: {0}")]
    Malformed(String),

    /// The scheme is recognized but not yet implemented on this build
    /// (e.g. `pkcs11:` without the `pkcs11` feature).
    #[error("key provider scheme not implemented in this build: {0}")]
    NotImplemented(String),
}
