//! Identity registry: certificate and Thing records, with a write-through
//! runtime-store backing and a bounded offline trust window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::events::{SharedEventBus, ThingUpdated};
use crate::ports::runtime_store::RuntimeStore;
use crate::types::certificate_id;

/// Trust status of a certificate record, as distinct from the upstream
/// cloud's own `CertificateStatus` (this is the registry's local view,
/// which additionally expires with age).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustStatus {
    /// Not known to be valid (never verified, or verification lapsed).
    Unknown,
    /// Verified active as of `status_last_updated`.
    Active,
}

/// A certificate's locally cached identity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// `certificateId(pem)`.
    pub certificate_id: String,
    /// Current trust status.
    pub status: TrustStatus,
    /// When `status` was last set.
    pub status_last_updated: DateTime<Utc>,
}

/// A Thing's attachment map: which certificate ids it is currently bound
/// to, and when each attachment was created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThingRecord {
    /// The Thing's name.
    pub thing_name: String,
    /// `certificateId -> attachedAt`.
    pub attachments: HashMap<String, DateTime<Utc>>,
}

fn is_valid_thing_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-')
}

fn cert_record_key(id: &str) -> String {
    format!("runtime.certificates.byId.{id}")
}

fn cert_pem_key(id: &str) -> String {
    format!("runtime.certificates.byId.{id}.pem")
}

fn thing_key(name: &str) -> String {
    format!("runtime.things.{name}")
}

/// Certificate records, Thing records, and the client-certificate PEM
/// side store. Mutations to either map are serialized behind a single
/// async mutex per side — never more than one writer at a time globally
/// for a given side; reads clone out of the map without holding the lock
/// across I/O.
pub struct IdentityRegistry {
    store: Arc<dyn RuntimeStore>,
    bus: SharedEventBus,
    certificates: tokio::sync::Mutex<HashMap<String, CertificateRecord>>,
    things: tokio::sync::Mutex<HashMap<String, ThingRecord>>,
}

impl IdentityRegistry {
    /// Construct an empty registry backed by `store`. Does not eagerly
    /// load persisted state; callers needing a warm cache should read
    /// through `store.list_prefix` themselves during startup.
    pub fn new(store: Arc<dyn RuntimeStore>, bus: SharedEventBus) -> Self {
        Self { store, bus, certificates: tokio::sync::Mutex::new(HashMap::new()), things: tokio::sync::Mutex::new(HashMap::new()) }
    }

    /// Canonicalize `pem`, compute its id, and upsert a record for it
    /// (status `Unknown` if not already present).
    pub async fn get_or_create_certificate(&self, pem: &str) -> Result<CertificateRecord> {
        let id = certificate_id(pem);
        let mut guard = self.certificates.lock().await;
        if let Some(existing) = guard.get(&id) {
            return Ok(existing.clone());
        }
        let record = CertificateRecord { certificate_id: id.clone(), status: TrustStatus::Unknown, status_last_updated: Utc::now() };
        self.persist_certificate(&record).await?;
        guard.insert(id, record.clone());
        Ok(record)
    }

    /// Last-writer-wins status update by `last_updated`: if the stored
    /// record is newer, this call is ignored.
    pub async fn update_certificate_status(&self, id: &str, status: TrustStatus, last_updated: DateTime<Utc>) -> Result<()> {
        let mut guard = self.certificates.lock().await;
        let record = guard.entry(id.to_string()).or_insert_with(|| CertificateRecord {
            certificate_id: id.to_string(),
            status: TrustStatus::Unknown,
            status_last_updated: last_updated,
        });
        if last_updated < record.status_last_updated {
            return Ok(());
        }
        record.status = status;
        record.status_last_updated = last_updated;
        let snapshot = record.clone();
        drop(guard);
        self.persist_certificate(&snapshot).await
    }

    /// Return the record for `pem` only if it is `Active` and within
    /// `trust_duration` of its last update. `trust_duration` of zero
    /// disables caching entirely: every call returns `None`. Never
    /// mutates persisted state.
    pub async fn get_certificate(&self, pem: &str, trust_duration: StdDuration) -> Result<Option<CertificateRecord>> {
        if trust_duration.is_zero() {
            return Ok(None);
        }
        let id = certificate_id(pem);
        let guard = self.certificates.lock().await;
        Ok(guard.get(&id).cloned().filter(|record| Self::is_within_trust_window(record, trust_duration)))
    }

    /// Same as `get_certificate` but by id, for callers that already hold
    /// the canonical id (e.g. Thing attachment checks).
    pub async fn get_certificate_by_id(&self, id: &str, trust_duration: StdDuration) -> Result<Option<CertificateRecord>> {
        if trust_duration.is_zero() {
            return Ok(None);
        }
        let guard = self.certificates.lock().await;
        Ok(guard.get(id).cloned().filter(|record| Self::is_within_trust_window(record, trust_duration)))
    }

    fn is_within_trust_window(record: &CertificateRecord, trust_duration: StdDuration) -> bool {
        if record.status != TrustStatus::Active {
            return false;
        }
        let age = Utc::now().signed_duration_since(record.status_last_updated);
        let window = chrono::Duration::from_std(trust_duration).unwrap_or(chrono::Duration::zero());
        age <= window
    }

    /// Remove a certificate record and its stored PEM.
    pub async fn delete_certificate(&self, id: &str) -> Result<()> {
        self.certificates.lock().await.remove(id);
        self.store.delete(&cert_record_key(id)).await?;
        self.store.delete(&cert_pem_key(id)).await?;
        Ok(())
    }

    /// Store the PEM text for a certificate id in the side store (used so
    /// offline verification can return the original PEM on request).
    pub async fn store_pem(&self, id: &str, pem: &str) -> Result<()> {
        self.store.put(&cert_pem_key(id), pem.as_bytes()).await?;
        Ok(())
    }

    /// Load the stored PEM text for a certificate id, if present.
    pub async fn load_pem(&self, id: &str) -> Result<Option<String>> {
        Ok(self.store.get(&cert_pem_key(id)).await?.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn persist_certificate(&self, record: &CertificateRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record).map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        self.store.put(&cert_record_key(&record.certificate_id), &bytes).await?;
        Ok(())
    }

    /// Get or create a Thing record by name, validating the name pattern
    /// (`[A-Za-z0-9:_-]+`, non-empty). Returns whether it was newly
    /// created.
    pub async fn get_or_create_thing(&self, name: &str) -> Result<(ThingRecord, bool)> {
        if !is_valid_thing_name(name) {
            return Err(Error::InvalidConfiguration(format!("invalid thing name: {name}")));
        }
        let mut guard = self.things.lock().await;
        if let Some(existing) = guard.get(name) {
            return Ok((existing.clone(), false));
        }
        let record = ThingRecord { thing_name: name.to_string(), attachments: HashMap::new() };
        self.persist_thing(&record).await?;
        guard.insert(name.to_string(), record.clone());
        Ok((record, true))
    }

    /// Replace a Thing's attachment map. A no-op (no persistence, no
    /// event) if the new value is identical to the stored one.
    pub async fn update_thing(&self, thing: ThingRecord) -> Result<()> {
        let mut guard = self.things.lock().await;
        if guard.get(&thing.thing_name) == Some(&thing) {
            return Ok(());
        }
        guard.insert(thing.thing_name.clone(), thing.clone());
        drop(guard);
        self.persist_thing(&thing).await?;
        self.bus.emit(ThingUpdated { thing_name: thing.thing_name, at: Utc::now() });
        Ok(())
    }

    /// Attach `cert_id` to `name` at `at`. Idempotent: attaching an
    /// already-attached id is a no-op.
    pub async fn attach(&self, name: &str, cert_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut guard = self.things.lock().await;
        let record = guard.entry(name.to_string()).or_insert_with(|| ThingRecord { thing_name: name.to_string(), attachments: HashMap::new() });
        if record.attachments.contains_key(cert_id) {
            return Ok(());
        }
        record.attachments.insert(cert_id.to_string(), at);
        let snapshot = record.clone();
        drop(guard);
        self.persist_thing(&snapshot).await
    }

    /// Detach `cert_id` from `name`. Idempotent: detaching an
    /// already-absent id is a no-op.
    pub async fn detach(&self, name: &str, cert_id: &str) -> Result<()> {
        let mut guard = self.things.lock().await;
        let Some(record) = guard.get_mut(name) else { return Ok(()) };
        if record.attachments.remove(cert_id).is_none() {
            return Ok(());
        }
        let snapshot = record.clone();
        drop(guard);
        self.persist_thing(&snapshot).await
    }

    /// All registered Thing records.
    pub async fn all_things(&self) -> Vec<ThingRecord> {
        self.things.lock().await.values().cloned().collect()
    }

    /// All registered certificate records, for background reconciliation.
    pub async fn all_certificates(&self) -> Vec<CertificateRecord> {
        self.certificates.lock().await.values().cloned().collect()
    }

    /// Remove a Thing record entirely.
    pub async fn delete_thing(&self, name: &str) -> Result<()> {
        self.things.lock().await.remove(name);
        self.store.delete(&thing_key(name)).await?;
        Ok(())
    }

    /// Whether any remaining Thing references `cert_id`, used by
    /// background refresh to decide whether an orphaned certificate
    /// record can be deleted.
    pub async fn any_thing_references(&self, cert_id: &str) -> bool {
        self.things.lock().await.values().any(|t| t.attachments.contains_key(cert_id))
    }

    async fn persist_thing(&self, thing: &ThingRecord) -> Result<()> {
        let bytes = serde_json::to_vec(thing).map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        self.store.put(&thing_key(&thing.thing_name), &bytes).await?;
        Ok(())
    }
}
