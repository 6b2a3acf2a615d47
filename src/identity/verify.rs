//! Verify identity pipeline: chain validation against the local CA, then
//! the upstream cloud oracle, then the local trust cache as a fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use time::OffsetDateTime;

use crate::ca::CaStore;
use crate::error::Result;
use crate::identity::registry::{IdentityRegistry, TrustStatus};
use crate::metrics::{Counter, MetricsSink, NoopMetricsSink};
use crate::ports::iot_auth::{CertificateStatus, IotAuthClient};
use crate::ports::x509::X509Port;
use crate::types::{canonicalize_pem, certificate_id};

/// Chain-validation-first, upstream-second, cached-fallback-last
/// verification of client certificates and Thing↔certificate bindings.
pub struct VerifyIdentityPipeline {
    x509: Arc<dyn X509Port>,
    ca_store: Arc<CaStore>,
    iot_auth: Arc<dyn IotAuthClient>,
    registry: Arc<IdentityRegistry>,
    trust_duration: StdDuration,
    metrics: Arc<dyn MetricsSink>,
}

impl VerifyIdentityPipeline {
    /// Construct a pipeline. `trust_duration` gates both the fast-path
    /// cache hit and the cloud-failure fallback. Reports to a no-op
    /// metrics sink; use `with_metrics` to wire in a real one.
    pub fn new(
        x509: Arc<dyn X509Port>,
        ca_store: Arc<CaStore>,
        iot_auth: Arc<dyn IotAuthClient>,
        registry: Arc<IdentityRegistry>,
        trust_duration: StdDuration,
    ) -> Self {
        Self::with_metrics(x509, ca_store, iot_auth, registry, trust_duration, Arc::new(NoopMetricsSink))
    }

    /// Same as `new`, reporting verification outcomes to `metrics`.
    pub fn with_metrics(
        x509: Arc<dyn X509Port>,
        ca_store: Arc<CaStore>,
        iot_auth: Arc<dyn IotAuthClient>,
        registry: Arc<IdentityRegistry>,
        trust_duration: StdDuration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { x509, ca_store, iot_auth, registry, trust_duration, metrics }
    }

    /// Verify a client certificate. `leaf_pem` is the leading leaf of the
    /// presented chain; any intermediates the client sent beyond the leaf
    /// are not separately validated by this core (it only ever needs to
    /// recognize its own local CA's leaf, which issues directly).
    pub async fn verify_client_certificate(&self, leaf_pem: &str) -> Result<bool> {
        let verified = self.verify_client_certificate_inner(leaf_pem).await?;
        self.metrics.increment(if verified { Counter::IdentityVerified } else { Counter::IdentityRejected });
        Ok(verified)
    }

    async fn verify_client_certificate_inner(&self, leaf_pem: &str) -> Result<bool> {
        let leaf = match self.x509.parse_certificate(leaf_pem.as_bytes()) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(false),
        };

        let now = OffsetDateTime::now_utc();
        if now < leaf.not_before || now > leaf.not_after {
            return Ok(false);
        }

        let ca = self.ca_store.active();
        if let Ok(ca_leaf) = self.x509.parse_certificate(ca.leaf().pem.as_bytes()) {
            if self.x509.is_signed_by(&leaf, &ca_leaf).unwrap_or(false) {
                return Ok(true);
            }
        }

        let canonical = canonicalize_pem(leaf_pem);
        let id = certificate_id(&canonical);

        if let Some(record) = self.registry.get_certificate(&canonical, self.trust_duration).await? {
            if record.status == TrustStatus::Active {
                return Ok(true);
            }
        }

        match self.iot_auth.get_iot_certificate(&canonical).await {
            Ok(CertificateStatus::Active) => {
                self.registry.get_or_create_certificate(&canonical).await?;
                self.registry.update_certificate_status(&id, TrustStatus::Active, Utc::now()).await?;
                self.registry.store_pem(&id, &canonical).await?;
                Ok(true)
            }
            Ok(CertificateStatus::Inactive) | Ok(CertificateStatus::NotFound) => {
                self.registry.get_or_create_certificate(&canonical).await?;
                self.registry.update_certificate_status(&id, TrustStatus::Unknown, Utc::now()).await?;
                Ok(false)
            }
            Err(_) => {
                let fallback = self.registry.get_certificate_by_id(&id, self.trust_duration).await?;
                Ok(fallback.map(|r| r.status == TrustStatus::Active).unwrap_or(false))
            }
        }
    }

    /// Verify that `thing_name` is attached to `certificate_id`.
    pub async fn verify_thing_attached_to_certificate(&self, thing_name: &str, certificate_id: &str) -> Result<bool> {
        let (thing, _) = self.registry.get_or_create_thing(thing_name).await?;
        if let Some(attached_at) = thing.attachments.get(certificate_id) {
            let age = Utc::now().signed_duration_since(*attached_at);
            let window = chrono::Duration::from_std(self.trust_duration).unwrap_or(chrono::Duration::zero());
            if !self.trust_duration.is_zero() && age <= window {
                return Ok(true);
            }
        }

        match self.iot_auth.is_thing_attached_to_certificate(thing_name, certificate_id).await {
            Ok(true) => {
                self.registry.attach(thing_name, certificate_id, Utc::now()).await?;
                Ok(true)
            }
            Ok(false) => {
                self.registry.detach(thing_name, certificate_id).await?;
                Ok(false)
            }
            Err(_) => Ok(thing.attachments.contains_key(certificate_id)),
        }
    }

    /// Fetch the cloud-reported Thing attribute namespace for
    /// `thing_name`, for the caller to fold into `SessionIdentity` before
    /// `SessionManager::create_session` so device-group selection rules
    /// can match on them. A cloud error yields an empty map rather than
    /// failing session creation outright.
    pub async fn fetch_thing_attributes(&self, thing_name: &str) -> HashMap<String, String> {
        self.iot_auth.get_thing_attributes(thing_name).await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::in_memory_store::InMemoryRuntimeStore;
    use crate::adapters::mock_iot_auth::MockIotAuthClient;
    use crate::adapters::rcgen_x509::RcgenX509Adapter;
    use crate::events::DomainEventBus;
    use crate::ports::key_provider::SchemeRouter;
    use crate::types::KeyAlgorithm;

    async fn build_pipeline() -> (VerifyIdentityPipeline, Arc<CaStore>, Arc<RcgenX509Adapter>) {
        let bus = Arc::new(DomainEventBus::new());
        let x509 = Arc::new(RcgenX509Adapter::new());
        let store: Arc<dyn crate::ports::runtime_store::RuntimeStore> = Arc::new(InMemoryRuntimeStore::new());
        let key_provider: Arc<dyn crate::ports::key_provider::KeyProvider> = Arc::new(SchemeRouter::new());
        let ca_store = Arc::new(CaStore::new(x509.clone(), store.clone(), key_provider, bus.clone()));
        ca_store.load_or_create_managed("verify-pipeline-passphrase", KeyAlgorithm::EcdsaP256).await.unwrap();

        let registry = Arc::new(IdentityRegistry::new(store, bus));
        let iot_auth = Arc::new(MockIotAuthClient::new());
        let pipeline = VerifyIdentityPipeline::new(x509.clone(), ca_store.clone(), iot_auth, registry, StdDuration::from_secs(720 * 60));
        (pipeline, ca_store, x509)
    }

    #[tokio::test]
    async fn a_leaf_issued_by_the_local_ca_verifies_without_any_cloud_call() {
        let (pipeline, ca_store, x509) = build_pipeline().await;
        let ca = ca_store.active();
        let issuer = crate::ca::issuer::CertificateIssuer::new(x509.clone() as Arc<dyn X509Port>);
        let leaf_key = x509.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let leaf = issuer
            .issue_client(&ca, &crate::types::DistinguishedName::with_common_name("component-1"), &leaf_key, StdDuration::from_secs(3600))
            .unwrap();

        assert!(pipeline.verify_client_certificate(&leaf.pem).await.unwrap());
    }

    #[tokio::test]
    async fn an_unrecognized_leaf_not_known_to_the_cloud_fails_verification() {
        let (pipeline, _ca_store, x509) = build_pipeline().await;
        let stray_key = x509.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let not_before = time::OffsetDateTime::now_utc();
        let not_after = not_before + time::Duration::days(1);
        let stray = x509
            .self_signed_ca(&crate::types::DistinguishedName::with_common_name("stray"), &stray_key, not_before, not_after, None)
            .unwrap();

        assert!(!pipeline.verify_client_certificate(&stray.pem).await.unwrap());
    }

    #[tokio::test]
    async fn fetch_thing_attributes_returns_what_the_cloud_reports() {
        let bus = Arc::new(DomainEventBus::new());
        let x509 = Arc::new(RcgenX509Adapter::new());
        let store: Arc<dyn crate::ports::runtime_store::RuntimeStore> = Arc::new(InMemoryRuntimeStore::new());
        let key_provider: Arc<dyn crate::ports::key_provider::KeyProvider> = Arc::new(SchemeRouter::new());
        let ca_store = Arc::new(CaStore::new(x509.clone(), store.clone(), key_provider, bus.clone()));
        ca_store.load_or_create_managed("attrs-pipeline-passphrase", KeyAlgorithm::EcdsaP256).await.unwrap();
        let registry = Arc::new(IdentityRegistry::new(store, bus));

        let iot_auth = Arc::new(MockIotAuthClient::new());
        let mut attrs = std::collections::HashMap::new();
        attrs.insert("deviceGroup".to_string(), "sensors".to_string());
        iot_auth.set_thing_attributes("living-room-sensor", attrs.clone());

        let pipeline =
            VerifyIdentityPipeline::new(x509, ca_store, iot_auth, registry, StdDuration::from_secs(720 * 60));
        assert_eq!(pipeline.fetch_thing_attributes("living-room-sensor").await, attrs);
    }

    #[tokio::test]
    async fn fetch_thing_attributes_falls_back_to_empty_on_cloud_failure() {
        let bus = Arc::new(DomainEventBus::new());
        let x509 = Arc::new(RcgenX509Adapter::new());
        let store: Arc<dyn crate::ports::runtime_store::RuntimeStore> = Arc::new(InMemoryRuntimeStore::new());
        let key_provider: Arc<dyn crate::ports::key_provider::KeyProvider> = Arc::new(SchemeRouter::new());
        let ca_store = Arc::new(CaStore::new(x509.clone(), store.clone(), key_provider, bus.clone()));
        ca_store.load_or_create_managed("attrs-pipeline-failure-passphrase", KeyAlgorithm::EcdsaP256).await.unwrap();
        let registry = Arc::new(IdentityRegistry::new(store, bus));

        let iot_auth = Arc::new(MockIotAuthClient::new());
        iot_auth.fail_with("outage");

        let pipeline =
            VerifyIdentityPipeline::new(x509, ca_store, iot_auth, registry, StdDuration::from_secs(720 * 60));
        assert!(pipeline.fetch_thing_attributes("living-room-sensor").await.is_empty());
    }
}
