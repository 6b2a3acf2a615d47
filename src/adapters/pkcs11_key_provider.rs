//! `pkcs11:` key provider scheme, stubbed.
//!
//! A full PKCS#11 adapter (slot/token selection, PIN handling, a real
//! cryptoki binding) is out of proportion to the rest of this core and
//! cannot be exercised without hardware; this stub exists so
//! `SchemeRouter` has something to register for the scheme and so a host
//! that configures `pkcs11:` URIs gets a clear, typed error rather than
//! "unsupported scheme".

use crate::ports::key_provider::{KeyProvider, KeyProviderError};
use crate::ports::x509::PrivateKey;

/// Placeholder PKCS#11 key provider. Every call returns
/// `KeyProviderError::NotImplemented`.
#[derive(Clone, Default)]
pub struct Pkcs11KeyProvider;

impl Pkcs11KeyProvider {
    /// Construct the stub provider.
    pub fn new() -> Self {
        Self
    }
}

impl KeyProvider for Pkcs11KeyProvider {
    fn resolve_private_key(&self, uri: &str) -> Result<PrivateKey, KeyProviderError> {
        Err(KeyProviderError::NotImplemented(format!(
            "pkcs11 key resolution not implemented in this build: {uri}"
        )))
    }

    fn resolve_certificate(&self, uri: &str) -> Result<Vec<u8>, KeyProviderError> {
        Err(KeyProviderError::NotImplemented(format!(
            "pkcs11 certificate resolution not implemented in this build: {uri}"
        )))
    }
}
