//! Filesystem-backed `KeyProvider` for the `file:` URI scheme.

use std::path::Path;

use crate::ports::key_provider::{KeyProvider, KeyProviderError};
use crate::ports::x509::PrivateKey;
use crate::types::KeyAlgorithm;

/// Resolves `file:///path/to/key.pem` style URIs from the local
/// filesystem.
#[derive(Clone, Default)]
pub struct FileKeyProvider;

impl FileKeyProvider {
    /// Construct a new provider.
    pub fn new() -> Self {
        Self
    }

    fn path_of(uri: &str) -> Result<&Path, KeyProviderError> {
        uri.strip_prefix("file://")
            .or_else(|| uri.strip_prefix("file:"))
            .map(Path::new)
            .ok_or_else(|| KeyProviderError::UnsupportedScheme(uri.to_string()))
    }
}

impl KeyProvider for FileKeyProvider {
    fn resolve_private_key(&self, uri: &str) -> Result<PrivateKey, KeyProviderError> {
        let path = Self::path_of(uri)?;
        let pem_text = std::fs::read_to_string(path)
            .map_err(|e| KeyProviderError::NotFound(format!("{}: {e}", path.display())))?;
        let parsed = pem::parse(pem_text.as_bytes())
            .map_err(|e| KeyProviderError::Malformed(format!("{}: {e}", path.display())))?;
        let der = parsed.contents().to_vec();

        // PKCS#8 RSA keys carry the rsaEncryption OID; anything else we
        // treat as ECDSA P-256, the only other algorithm this crate issues.
        use rsa::pkcs8::DecodePrivateKey;
        let algorithm = if rsa::RsaPrivateKey::from_pkcs8_der(&der).is_ok() {
            KeyAlgorithm::Rsa2048
        } else {
            KeyAlgorithm::EcdsaP256
        };

        Ok(PrivateKey { algorithm, pkcs8_der: der })
    }

    fn resolve_certificate(&self, uri: &str) -> Result<Vec<u8>, KeyProviderError> {
        let path = Self::path_of(uri)?;
        std::fs::read(path).map_err(|e| KeyProviderError::NotFound(format!("{}: {e}", path.display())))
    }
}
