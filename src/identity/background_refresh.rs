//! 24h-cadence reconciliation job: lists the Things the cloud currently
//! associates with this core device, prunes local records the cloud no
//! longer reports, re-verifies remaining attachments, and refreshes every
//! cached certificate's trust status.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use crate::identity::registry::IdentityRegistry;
use crate::identity::verify::VerifyIdentityPipeline;
use crate::metrics::{Counter, MetricsSink, NoopMetricsSink};
use crate::network::NetworkStateProvider;
use crate::ports::iot_auth::IotAuthClient;

const DEFAULT_CADENCE: StdDuration = StdDuration::from_secs(24 * 3600);

/// Drives the reconciliation run, gated on network-up and on at least one
/// cadence interval having elapsed since the previous run. Concurrent
/// invocations within the same window are collapsed to a single run: a
/// caller that finds one already in flight returns immediately rather
/// than waiting for it.
pub struct BackgroundRefresh {
    registry: Arc<IdentityRegistry>,
    iot_auth: Arc<dyn IotAuthClient>,
    verify: Arc<VerifyIdentityPipeline>,
    network: Arc<NetworkStateProvider>,
    cadence: StdDuration,
    last_run: Mutex<Option<Instant>>,
    running: AtomicBool,
    metrics: Arc<dyn MetricsSink>,
}

impl BackgroundRefresh {
    /// Construct a job with the default 24h cadence. Reports to a no-op
    /// metrics sink; use `with_cadence_and_metrics` to wire in a real one.
    pub fn new(
        registry: Arc<IdentityRegistry>,
        iot_auth: Arc<dyn IotAuthClient>,
        verify: Arc<VerifyIdentityPipeline>,
        network: Arc<NetworkStateProvider>,
    ) -> Self {
        Self::with_cadence(registry, iot_auth, verify, network, DEFAULT_CADENCE)
    }

    /// Construct a job with an explicit cadence, for tests that cannot
    /// wait 24 real hours between ticks.
    pub fn with_cadence(
        registry: Arc<IdentityRegistry>,
        iot_auth: Arc<dyn IotAuthClient>,
        verify: Arc<VerifyIdentityPipeline>,
        network: Arc<NetworkStateProvider>,
        cadence: StdDuration,
    ) -> Self {
        Self::with_cadence_and_metrics(registry, iot_auth, verify, network, cadence, Arc::new(NoopMetricsSink))
    }

    /// Same as `with_cadence`, reporting completed runs to `metrics`.
    pub fn with_cadence_and_metrics(
        registry: Arc<IdentityRegistry>,
        iot_auth: Arc<dyn IotAuthClient>,
        verify: Arc<VerifyIdentityPipeline>,
        network: Arc<NetworkStateProvider>,
        cadence: StdDuration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { registry, iot_auth, verify, network, cadence, last_run: Mutex::new(None), running: AtomicBool::new(false), metrics }
    }

    /// Run the reconciliation if due (network up, cadence elapsed, no
    /// other run in flight). Returns whether a run actually executed.
    pub async fn run_if_due(&self) -> crate::error::Result<bool> {
        if !self.network.is_up() {
            return Ok(false);
        }
        if let Some(last) = *self.last_run.lock().unwrap() {
            if last.elapsed() < self.cadence {
                return Ok(false);
            }
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let outcome = self.run_once().await;
        *self.last_run.lock().unwrap() = Some(Instant::now());
        self.running.store(false, Ordering::SeqCst);
        outcome?;
        self.metrics.increment(Counter::BackgroundRefreshCompleted);
        Ok(true)
    }

    async fn run_once(&self) -> crate::error::Result<()> {
        let cloud_things = match self.list_all_cloud_things().await {
            Ok(names) => names,
            Err(error) => {
                tracing::warn!(%error, "background refresh: cloud listing failed, rescheduling");
                return Ok(());
            }
        };

        for thing in self.registry.all_things().await {
            if !cloud_things.contains(&thing.thing_name) {
                self.registry.delete_thing(&thing.thing_name).await?;
                for cert_id in thing.attachments.keys() {
                    if !self.registry.any_thing_references(cert_id).await {
                        self.registry.delete_certificate(cert_id).await?;
                    }
                }
                continue;
            }
            for cert_id in thing.attachments.keys() {
                let still_attached = self.verify.verify_thing_attached_to_certificate(&thing.thing_name, cert_id).await?;
                if !still_attached {
                    self.registry.detach(&thing.thing_name, cert_id).await?;
                }
            }
        }

        for record in self.registry.all_certificates().await {
            if let Some(pem) = self.registry.load_pem(&record.certificate_id).await? {
                self.verify.verify_client_certificate(&pem).await?;
            }
        }

        Ok(())
    }

    async fn list_all_cloud_things(&self) -> Result<HashSet<String>, crate::ports::iot_auth::CloudError> {
        let mut names = HashSet::new();
        let mut page_token = None;
        loop {
            let page = self.iot_auth.list_things_attached_to_core(page_token).await?;
            names.extend(page.things);
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::in_memory_store::InMemoryRuntimeStore;
    use crate::adapters::mock_iot_auth::MockIotAuthClient;
    use crate::adapters::rcgen_x509::RcgenX509Adapter;
    use crate::ca::CaStore;
    use crate::events::DomainEventBus;
    use crate::ports::iot_auth::CertificateStatus;
    use crate::ports::key_provider::SchemeRouter;
    use crate::types::KeyAlgorithm;

    async fn build() -> (Arc<BackgroundRefresh>, Arc<IdentityRegistry>, Arc<MockIotAuthClient>, Arc<NetworkStateProvider>) {
        let bus = Arc::new(DomainEventBus::new());
        let x509 = Arc::new(RcgenX509Adapter::new());
        let store: Arc<dyn crate::ports::runtime_store::RuntimeStore> = Arc::new(InMemoryRuntimeStore::new());
        let key_provider: Arc<dyn crate::ports::key_provider::KeyProvider> = Arc::new(SchemeRouter::new());
        let ca_store = Arc::new(CaStore::new(x509.clone(), store.clone(), key_provider, bus.clone()));
        ca_store.load_or_create_managed("background-refresh-passphrase", KeyAlgorithm::EcdsaP256).await.unwrap();

        let registry = Arc::new(IdentityRegistry::new(store, bus));
        let iot_auth = Arc::new(MockIotAuthClient::new());
        let verify = Arc::new(VerifyIdentityPipeline::new(
            x509,
            ca_store,
            iot_auth.clone(),
            registry.clone(),
            StdDuration::from_secs(3600),
        ));
        let network = Arc::new(NetworkStateProvider::new(Arc::new(DomainEventBus::new())));
        network.notify_up();

        let refresh = Arc::new(BackgroundRefresh::with_cadence(
            registry.clone(),
            iot_auth.clone(),
            verify,
            network.clone(),
            StdDuration::from_millis(10),
        ));
        (refresh, registry, iot_auth, network)
    }

    #[tokio::test]
    async fn a_thing_absent_from_the_cloud_listing_is_pruned_along_with_its_orphaned_certificate() {
        let (refresh, registry, iot_auth, _network) = build().await;
        registry.attach("orphaned-thing", "cert-x", chrono::Utc::now()).await.unwrap();
        registry.get_or_create_certificate("cert-x-pem").await.unwrap();
        iot_auth.set_things_on_core(vec![]);

        assert!(refresh.run_if_due().await.unwrap());
        assert!(registry.all_things().await.is_empty());
    }

    #[tokio::test]
    async fn run_if_due_is_a_no_op_when_the_network_is_down() {
        let (refresh, _registry, _iot_auth, network) = build().await;
        network.notify_down();
        assert!(!refresh.run_if_due().await.unwrap());
    }

    #[tokio::test]
    async fn a_second_call_within_the_cadence_window_does_not_run_again() {
        let (refresh, registry, iot_auth, _network) = build().await;
        iot_auth.set_things_on_core(vec!["thing-1".to_string()]);
        registry.attach("thing-1", "cert-y", chrono::Utc::now()).await.unwrap();
        iot_auth.set_attachment("thing-1", "cert-y", true);

        assert!(refresh.run_if_due().await.unwrap());
        assert!(!refresh.run_if_due().await.unwrap());
    }

    #[tokio::test]
    async fn certificate_records_are_revalidated_against_the_cloud_oracle() {
        let (refresh, registry, iot_auth, _network) = build().await;
        let pem = "-----BEGIN CERTIFICATE-----\nrefresh-me\n-----END CERTIFICATE-----\n";
        let record = registry.get_or_create_certificate(pem).await.unwrap();
        registry.store_pem(&record.certificate_id, pem).await.unwrap();
        iot_auth.set_certificate_status(&crate::types::canonicalize_pem(pem), CertificateStatus::Active);

        assert!(refresh.run_if_due().await.unwrap());
        let refreshed = registry.get_certificate_by_id(&record.certificate_id, StdDuration::from_secs(3600)).await.unwrap();
        assert!(refreshed.is_some());
    }
}
