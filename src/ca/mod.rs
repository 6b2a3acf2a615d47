//! Certificate authority lifecycle: the managed self-signed CA, a custom
//! externally-supplied CA, and the atomic swap between them.
//!
//! `CaStore` owns the active `CertificateAuthority` behind a read-mostly
//! pointer (`Arc<CertificateAuthority>` guarded by a `std::sync::RwLock`,
//! swapped wholesale rather than mutated in place) so readers never block
//! on a writer for longer than a pointer clone.

pub mod issuer;

use std::sync::{Arc, RwLock};

use rand::RngCore;
use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey};
use serde::{Deserialize, Serialize};
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::events::{CaChanged, SharedEventBus};
use crate::ports::iot_auth::IotAuthClient;
use crate::ports::key_provider::KeyProvider;
use crate::ports::runtime_store::RuntimeStore;
use crate::ports::x509::{Certificate, ParsedCertificate, PrivateKey, X509Port};
use crate::types::{CaKind, DistinguishedName, KeyAlgorithm};

const KEY_CA_BLOB: &str = "runtime.ca.blob";
const KEY_CA_AUTHORITIES: &str = "runtime.certificates.authorities";
const MANAGED_CA_VALIDITY_DAYS: i64 = 365 * 5;

/// The active certificate authority: its key material, its chain
/// (leaf-first, root-last), and which kind it is.
#[derive(Clone)]
pub struct CertificateAuthority {
    /// Managed (self-signed, locally generated) vs custom (externally
    /// supplied).
    pub kind: CaKind,
    /// Key algorithm of `private_key`.
    pub key_algorithm: KeyAlgorithm,
    /// The CA's own private key. Owned exclusively by the active
    /// `CertificateAuthority`; replaced wholesale on swap, never mutated.
    pub private_key: PrivateKey,
    /// Chain, leaf first, root last. Non-empty.
    pub chain: Vec<Certificate>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("kind", &self.kind)
            .field("key_algorithm", &self.key_algorithm)
            .field("chain_len", &self.chain.len())
            .field("leaf_subject", &self.chain.first().map(|c| c.subject.to_display_string()))
            .finish()
    }
}

impl CertificateAuthority {
    /// The leaf (signing) certificate: `chain[0]`.
    pub fn leaf(&self) -> &Certificate {
        &self.chain[0]
    }

    /// The chain as PEM text, leaf-first.
    pub fn chain_pems(&self) -> Vec<String> {
        self.chain.iter().map(|c| c.pem.clone()).collect()
    }
}

/// Shared handle to the currently active CA. Readers clone this cheaply;
/// it stays valid even across a subsequent swap (the old `Arc` simply
/// stops being reachable from `CaStore::active`).
pub type CaHandle = Arc<CertificateAuthority>;

/// Result of `CaStore::load_or_create_managed`: the active CA plus the
/// passphrase now protecting it on disk (unchanged from the caller's
/// input on the decrypt-success path; freshly generated on the
/// generate-new path).
pub struct ManagedCaLoad {
    /// The now-active managed CA.
    pub ca: CaHandle,
    /// The passphrase protecting the persisted keystore. The host must
    /// store this if it differs from what was supplied.
    pub passphrase: String,
}

#[derive(Serialize, Deserialize)]
struct PersistedCa {
    key_algorithm: KeyAlgorithm,
    private_key_der: Vec<u8>,
    chain_pems: Vec<String>,
}

/// Upstream cloud client plus this core device's own Thing name, set via
/// `CaStore::set_cloud_publisher` so every subsequent CA swap uploads the
/// new root authority. Optional: a store with none configured swaps
/// locally without attempting any upload.
#[derive(Clone)]
struct CloudPublisher {
    iot_auth: Arc<dyn IotAuthClient>,
    thing_name: String,
}

/// Owns the active `CertificateAuthority` and the operations that load,
/// create, and atomically swap it.
pub struct CaStore {
    x509: Arc<dyn X509Port>,
    store: Arc<dyn RuntimeStore>,
    key_provider: Arc<dyn KeyProvider>,
    bus: SharedEventBus,
    active: RwLock<Option<CaHandle>>,
    swap_lock: AsyncMutex<()>,
    cloud_publisher: RwLock<Option<CloudPublisher>>,
}

impl CaStore {
    /// Construct a store with no active CA yet (callers must call
    /// `load_or_create_managed` or `load_custom` before `active()` is
    /// meaningful).
    pub fn new(
        x509: Arc<dyn X509Port>,
        store: Arc<dyn RuntimeStore>,
        key_provider: Arc<dyn KeyProvider>,
        bus: SharedEventBus,
    ) -> Self {
        Self {
            x509,
            store,
            key_provider,
            bus,
            active: RwLock::new(None),
            swap_lock: AsyncMutex::new(()),
            cloud_publisher: RwLock::new(None),
        }
    }

    /// Configure the upstream cloud client and this core device's own
    /// Thing name (§6, `putCertificateAuthorities`): every CA swap from
    /// this point on uploads the chain's root authority so the cloud can
    /// validate certificates this core issues. A store with no publisher
    /// configured simply swaps locally.
    pub fn set_cloud_publisher(&self, iot_auth: Arc<dyn IotAuthClient>, thing_name: impl Into<String>) {
        *self.cloud_publisher.write().unwrap() = Some(CloudPublisher { iot_auth, thing_name: thing_name.into() });
    }

    /// The currently active CA. Panics if no CA has ever been loaded;
    /// callers are expected to load one during startup before serving
    /// requests.
    pub fn active(&self) -> CaHandle {
        self.active.read().unwrap().clone().expect("CaStore used before a CA was loaded")
    }

    /// Chain PEMs of the active CA, leaf-first.
    pub fn ca_certificates(&self) -> Vec<String> {
        self.active().chain_pems()
    }

    /// Load the managed CA, generating and persisting a fresh one if the
    /// persisted keystore cannot be opened with `passphrase`, or its
    /// stored algorithm does not match `algorithm`.
    pub async fn load_or_create_managed(&self, passphrase: &str, algorithm: KeyAlgorithm) -> Result<ManagedCaLoad> {
        let _guard = self.swap_lock.lock().await;

        if let Some(existing) = self.try_decrypt_managed(passphrase).await? {
            if existing.key_algorithm == algorithm {
                self.install(existing).await?;
                return Ok(ManagedCaLoad { ca: self.active(), passphrase: passphrase.to_string() });
            }
        }

        let fresh = self.generate_managed(algorithm)?;
        let new_passphrase = generate_ascii_passphrase(16);
        self.persist_managed(&fresh, &new_passphrase).await?;
        self.install(fresh).await?;
        Ok(ManagedCaLoad { ca: self.active(), passphrase: new_passphrase })
    }

    /// Load a custom CA from externally supplied key and certificate
    /// material. `chain_uri`, when given, overrides the certificate at
    /// `certificate_uri` being treated as a leaf-only entry and supplies
    /// the remainder of the chain (a PEM bundle, possibly multiple
    /// certificates).
    pub async fn load_custom(
        &self,
        private_key_uri: &str,
        certificate_uri: &str,
        chain_uri: Option<&str>,
    ) -> Result<CaHandle> {
        let _guard = self.swap_lock.lock().await;

        let private_key = self.key_provider.resolve_private_key(private_key_uri)?;
        let leaf_bytes = self.key_provider.resolve_certificate(certificate_uri)?;

        let mut raw_chain: Vec<Vec<u8>> = vec![leaf_bytes];
        if let Some(uri) = chain_uri {
            let bundle = self.key_provider.resolve_certificate(uri)?;
            raw_chain.extend(split_pem_bundle(&bundle)?);
        }

        let certificates: Vec<Certificate> =
            raw_chain.iter().map(|bytes| self.certificate_from_bytes(bytes)).collect::<Result<_>>()?;

        if certificates.is_empty() {
            return Err(Error::InvalidCertificateAuthority("custom CA chain is empty".to_string()));
        }

        if !self.x509.public_key_matches(&private_key, &certificates[0].der)? {
            return Err(Error::InvalidCertificateAuthority(format!(
                "supplied private key does not match the public key of leaf certificate {}",
                certificates[0].subject.to_display_string()
            )));
        }
        self.validate_custom_chain(&certificates)?;

        let new_ca = CertificateAuthority {
            kind: CaKind::Custom,
            key_algorithm: private_key.algorithm,
            private_key,
            chain: certificates,
        };

        self.swap(new_ca).await?;
        Ok(self.active())
    }

    fn certificate_from_bytes(&self, bytes: &[u8]) -> Result<Certificate> {
        let parsed: ParsedCertificate = self.x509.parse_certificate(bytes)?;
        let pem = if looks_like_pem(bytes) {
            String::from_utf8_lossy(bytes).into_owned()
        } else {
            pem::encode(&pem::Pem::new("CERTIFICATE", parsed.der.clone()))
        };
        Ok(Certificate {
            der: parsed.der,
            pem: crate::types::canonicalize_pem(&pem),
            subject: parsed.subject,
            issuer: parsed.issuer,
            not_before: parsed.not_before,
            not_after: parsed.not_after,
            is_ca: true,
        })
    }

    /// Validate the custom CA chain invariants: every adjacent pair in
    /// positions `1..n-1` is issuer-verified; the final certificate may be
    /// self-signed or simply trusted as supplied. The leaf public
    /// key/private key match (invariant (a)) is checked by the caller
    /// before this runs.
    fn validate_custom_chain(&self, chain: &[Certificate]) -> Result<()> {
        for window in chain.windows(2) {
            let (subject, issuer) = (&window[0], &window[1]);
            let subject_parsed = self.x509.parse_certificate(subject.pem.as_bytes())?;
            let issuer_parsed = self.x509.parse_certificate(issuer.pem.as_bytes())?;
            if !self.x509.is_signed_by(&subject_parsed, &issuer_parsed)? {
                return Err(Error::InvalidCertificateAuthority(format!(
                    "{} is not signed by {}",
                    subject.subject.to_display_string(),
                    issuer.subject.to_display_string()
                )));
            }
        }
        Ok(())
    }

    /// Atomically replace the active CA, zeroizing the previous private
    /// key bytes (when no other reader still holds a clone of its handle)
    /// and emitting `CaChanged`. Serialized against other swap/load calls
    /// via `swap_lock`.
    async fn swap(&self, new_ca: CertificateAuthority) -> Result<()> {
        let new_subject = new_ca.leaf().subject.to_display_string();
        let previous = {
            let mut guard = self.active.write().unwrap();
            guard.replace(Arc::new(new_ca))
        };
        if let Some(previous) = previous {
            if let Ok(mut owned) = Arc::try_unwrap(previous) {
                owned.private_key.pkcs8_der.zeroize_in_place();
            }
        }
        self.bus.emit(CaChanged { new_subject, at: chrono::Utc::now() });
        self.publish_to_cloud().await;
        Ok(())
    }

    /// Upload the active CA's root authority to the cloud, if a cloud
    /// publisher has been configured. Best-effort: a failure here is
    /// logged, not retried or surfaced, since it never blocks the swap
    /// that just completed (the next swap, or a future explicit reload,
    /// will simply try again).
    async fn publish_to_cloud(&self) {
        let publisher = self.cloud_publisher.read().unwrap().clone();
        let Some(publisher) = publisher else { return };
        let Some(root_pem) = self.active().chain.last().map(|c| c.pem.clone()) else { return };
        if let Err(error) = publisher.iot_auth.put_certificate_authorities(&publisher.thing_name, &[root_pem]).await {
            tracing::warn!(thing_name = %publisher.thing_name, %error, "failed to publish CA authority to cloud");
        }
    }

    async fn install(&self, ca: CertificateAuthority) -> Result<()> {
        self.swap(ca).await
    }

    fn generate_managed(&self, algorithm: KeyAlgorithm) -> Result<CertificateAuthority> {
        let key = self.x509.generate_key_pair(algorithm)?;
        let subject = DistinguishedName::managed_ca();
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + TimeDuration::days(MANAGED_CA_VALIDITY_DAYS);
        let leaf = self.x509.self_signed_ca(&subject, &key, not_before, not_after, Some(0))?;
        Ok(CertificateAuthority { kind: CaKind::Managed, key_algorithm: algorithm, private_key: key, chain: vec![leaf] })
    }

    async fn persist_managed(&self, ca: &CertificateAuthority, passphrase: &str) -> Result<()> {
        let payload = PersistedCa {
            key_algorithm: ca.key_algorithm,
            private_key_der: ca.private_key.pkcs8_der.clone(),
            chain_pems: ca.chain_pems(),
        };
        let plaintext = serde_json::to_vec(&payload)
            .map_err(|e| Error::InvalidCertificateAuthority(format!("failed to serialize CA: {e}")))?;
        let blob = encrypt_blob(passphrase, &plaintext)
            .map_err(|e| Error::InvalidCertificateAuthority(format!("failed to encrypt CA keystore: {e}")))?;
        self.store.put(KEY_CA_BLOB, &blob).await?;
        self.store.put(KEY_CA_AUTHORITIES, serde_json::to_vec(&payload.chain_pems).unwrap().as_slice()).await?;
        Ok(())
    }

    async fn try_decrypt_managed(&self, passphrase: &str) -> Result<Option<CertificateAuthority>> {
        let blob = match self.store.get(KEY_CA_BLOB).await? {
            Some(b) => b,
            None => return Ok(None),
        };
        let plaintext = match decrypt_blob(passphrase, &blob) {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        let payload: PersistedCa = match serde_json::from_slice(&plaintext) {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        let mut chain = Vec::with_capacity(payload.chain_pems.len());
        for pem_text in &payload.chain_pems {
            chain.push(self.certificate_from_bytes(pem_text.as_bytes())?);
        }
        Ok(Some(CertificateAuthority {
            kind: CaKind::Managed,
            key_algorithm: payload.key_algorithm,
            private_key: PrivateKey { algorithm: payload.key_algorithm, pkcs8_der: payload.private_key_der },
            chain,
        }))
    }
}

trait ZeroizeBytes {
    fn zeroize_in_place(&mut self);
}

impl ZeroizeBytes for Vec<u8> {
    fn zeroize_in_place(&mut self) {
        use zeroize::Zeroize;
        self.zeroize();
    }
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes.starts_with(b"-----BEGIN")
}

fn split_pem_bundle(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let text = String::from_utf8_lossy(bytes);
    let parsed = pem::parse_many(text.as_bytes())
        .map_err(|e| Error::InvalidCertificateAuthority(format!("failed to parse chain bundle: {e}")))?;
    Ok(parsed.into_iter().map(|p| pem::encode(&p).into_bytes()).collect())
}

/// Generate a 16-byte ASCII passphrase, every byte in the printable range
/// `[0x20, 0x7E]`, for protecting a freshly generated managed CA keystore.
fn generate_ascii_passphrase(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(len);
    while out.len() < len {
        let byte = (rng.next_u32() % 256) as u8;
        if (0x20..=0x7E).contains(&byte) {
            out.push(byte as char);
        }
    }
    out
}

struct SingleNonce(Option<[u8; 12]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0.take().map(Nonce::assume_unique_for_key).ok_or(ring::error::Unspecified)
    }
}

fn derive_aead_key(passphrase: &str, salt: &[u8; 16]) -> std::result::Result<[u8; 32], String> {
    use argon2::{Algorithm, Argon2, Params, Version};
    let params = Params::new(19 * 1024, 2, 1, Some(32)).map_err(|e| e.to_string())?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; 32];
    argon2.hash_password_into(passphrase.as_bytes(), salt, &mut out).map_err(|e| e.to_string())?;
    Ok(out)
}

/// Encrypt `plaintext` under `passphrase`: a fresh random 16-byte salt and
/// 12-byte nonce are generated, the passphrase is stretched to a 256-bit
/// key with Argon2id, and AES-256-GCM seals the payload. Layout:
/// `salt(16) || nonce(12) || ciphertext+tag`.
fn encrypt_blob(passphrase: &str, plaintext: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let mut salt = [0u8; 16];
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let key_bytes = derive_aead_key(passphrase, &salt)?;
    let unbound = UnboundKey::new(&aead::AES_256_GCM, &key_bytes).map_err(|e| format!("{e:?}"))?;
    let mut sealing = SealingKey::new(unbound, SingleNonce(Some(nonce_bytes)));

    let mut in_out = plaintext.to_vec();
    sealing.seal_in_place_append_tag(Aad::empty(), &mut in_out).map_err(|e| format!("{e:?}"))?;

    let mut out = Vec::with_capacity(16 + 12 + in_out.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Inverse of `encrypt_blob`. Returns an error on a wrong passphrase (the
/// GCM tag fails to verify) or a malformed blob.
fn decrypt_blob(passphrase: &str, blob: &[u8]) -> std::result::Result<Vec<u8>, String> {
    if blob.len() < 28 {
        return Err("keystore blob too short".to_string());
    }
    let salt: [u8; 16] = blob[..16].try_into().unwrap();
    let nonce_bytes: [u8; 12] = blob[16..28].try_into().unwrap();
    let ciphertext = &blob[28..];

    let key_bytes = derive_aead_key(passphrase, &salt)?;
    let unbound = UnboundKey::new(&aead::AES_256_GCM, &key_bytes).map_err(|e| format!("{e:?}"))?;
    let mut opening = OpeningKey::new(unbound, SingleNonce(Some(nonce_bytes)));

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening.open_in_place(Aad::empty(), &mut in_out).map_err(|e| format!("{e:?}"))?;
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_key_provider::FileKeyProvider;
    use crate::adapters::in_memory_store::InMemoryRuntimeStore;
    use crate::adapters::mock_iot_auth::MockIotAuthClient;
    use crate::adapters::rcgen_x509::RcgenX509Adapter;
    use crate::events::DomainEventBus;
    use crate::ports::key_provider::SchemeRouter;

    fn build_store() -> (Arc<CaStore>, Arc<RcgenX509Adapter>) {
        let bus = Arc::new(DomainEventBus::new());
        let x509 = Arc::new(RcgenX509Adapter::new());
        let store: Arc<dyn RuntimeStore> = Arc::new(InMemoryRuntimeStore::new());
        let mut router = SchemeRouter::new();
        router.register("file", Box::new(FileKeyProvider::new()));
        let key_provider: Arc<dyn KeyProvider> = Arc::new(router);
        let ca_store = Arc::new(CaStore::new(x509.clone(), store, key_provider, bus));
        (ca_store, x509)
    }

    fn write_pem(dir: &tempfile::TempDir, name: &str, tag: &str, der: &[u8]) -> String {
        let path = dir.path().join(name);
        let pem_text = pem::encode(&pem::Pem::new(tag, der.to_vec()));
        std::fs::write(&path, pem_text).unwrap();
        format!("file://{}", path.display())
    }

    #[tokio::test]
    async fn load_custom_rejects_a_leaf_whose_private_key_does_not_match() {
        let (ca_store, x509) = build_store();
        let dir = tempfile::tempdir().unwrap();

        let leaf_key = x509.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + TimeDuration::days(365);
        let leaf_cert =
            x509.self_signed_ca(&DistinguishedName::with_common_name("custom-root"), &leaf_key, not_before, not_after, Some(0)).unwrap();

        // A different, unrelated key than the one that produced `leaf_cert`.
        let mismatched_key = x509.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();

        let key_uri = write_pem(&dir, "leaf.key", "PRIVATE KEY", &mismatched_key.pkcs8_der);
        let cert_uri = write_pem(&dir, "leaf.crt", "CERTIFICATE", &leaf_cert.der);

        let result = ca_store.load_custom(&key_uri, &cert_uri, None).await;
        assert!(matches!(result, Err(Error::InvalidCertificateAuthority(_))));
    }

    #[tokio::test]
    async fn swap_publishes_only_the_root_authority_to_the_cloud() {
        let (ca_store, x509) = build_store();
        let dir = tempfile::tempdir().unwrap();
        let iot_auth = Arc::new(MockIotAuthClient::new());
        ca_store.set_cloud_publisher(iot_auth.clone(), "core-thing");

        let root_key = x509.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + TimeDuration::days(365);
        let root_cert =
            x509.self_signed_ca(&DistinguishedName::with_common_name("custom-root"), &root_key, not_before, not_after, Some(1)).unwrap();

        let intermediate_key = x509.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let leaf_req = crate::ports::x509::LeafRequest {
            subject: DistinguishedName::with_common_name("custom-intermediate"),
            subject_key: &intermediate_key,
            issuer_cert: &root_cert,
            issuer_key: &root_key,
            not_before,
            not_after,
            serial: [7u8; 20],
            key_usage: vec![crate::ports::x509::KeyUsage::KeyCertSign],
            extended_key_usage: vec![],
            subject_alt_names: vec![],
        };
        let intermediate_cert = x509.issue_leaf(&leaf_req).unwrap();

        let key_uri = write_pem(&dir, "intermediate.key", "PRIVATE KEY", &intermediate_key.pkcs8_der);
        let cert_uri = write_pem(&dir, "intermediate.crt", "CERTIFICATE", &intermediate_cert.der);
        let chain_uri = write_pem(&dir, "root.crt", "CERTIFICATE", &root_cert.der);

        ca_store.load_custom(&key_uri, &cert_uri, Some(&chain_uri)).await.unwrap();

        let published = iot_auth.published_authorities("core-thing").expect("a publish should have occurred");
        assert_eq!(published.len(), 1);
        assert_eq!(crate::types::canonicalize_pem(&published[0]), crate::types::canonicalize_pem(&root_cert.pem));
    }

    #[tokio::test]
    async fn a_store_with_no_cloud_publisher_swaps_without_attempting_a_publish() {
        let (ca_store, _x509) = build_store();
        ca_store.load_or_create_managed("no-publisher-passphrase", KeyAlgorithm::EcdsaP256).await.unwrap();
        // No assertion beyond "doesn't panic/hang": there is no publisher
        // configured, so `publish_to_cloud` is a no-op.
    }

    #[test]
    fn encrypt_decrypt_round_trips_with_correct_passphrase() {
        let blob = encrypt_blob("correct horse battery staple", b"hello ca").unwrap();
        let plaintext = decrypt_blob("correct horse battery staple", &blob).unwrap();
        assert_eq!(plaintext, b"hello ca");
    }

    #[test]
    fn decrypt_fails_with_wrong_passphrase() {
        let blob = encrypt_blob("correct horse battery staple", b"hello ca").unwrap();
        assert!(decrypt_blob("wrong passphrase", &blob).is_err());
    }

    #[test]
    fn generated_passphrase_is_sixteen_printable_ascii_bytes() {
        let passphrase = generate_ascii_passphrase(16);
        assert_eq!(passphrase.len(), 16);
        assert!(passphrase.bytes().all(|b| (0x20..=0x7E).contains(&b)));
    }
}
