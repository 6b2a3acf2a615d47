//! Certificate rotation engine: the three trigger sources (expiry timer,
//! CA change, connectivity change) driving the set of active generators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use time::OffsetDateTime;

use crate::events::{CaChanged, ConnectivityChanged, SharedEventBus};
use crate::rotation::generator::{CertificateGenerator, RotationReason};

/// Owns the strong map of active `CertificateGenerator`s and drives them
/// from the expiry timer, `CAChanged`, and `ConnectivityChanged`.
/// Per-trigger processing is serialized through `trigger_lock` so
/// generation events across triggers never interleave, matching the
/// single-rotation-worker resource model; within one trigger, generators
/// are walked sequentially and a failure in one does not abort the rest.
pub struct CertificateRotationEngine {
    generators: RwLock<HashMap<String, Arc<CertificateGenerator>>>,
    trigger_lock: Mutex<()>,
}

impl Default for CertificateRotationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateRotationEngine {
    /// Construct an engine with no registered generators.
    pub fn new() -> Self {
        Self { generators: RwLock::new(HashMap::new()), trigger_lock: Mutex::new(()) }
    }

    /// Register a generator, enrolling it in the expiry and CA-change
    /// monitor sets always, and the connectivity set when its role
    /// watches connectivity.
    pub fn register(&self, generator: Arc<CertificateGenerator>) {
        self.generators.write().unwrap().insert(generator.id().to_string(), generator);
    }

    /// Remove a subscription's generator from every monitor set.
    pub fn unregister(&self, id: &str) {
        self.generators.write().unwrap().remove(id);
    }

    /// Number of currently registered generators, for diagnostics.
    pub fn generator_count(&self) -> usize {
        self.generators.read().unwrap().len()
    }

    /// Expiry tick: walk every generator, issuing for any whose leaf is
    /// within its rotation lead time.
    pub fn tick_expiry(&self, now: OffsetDateTime, default_hosts: &dyn Fn() -> Vec<String>) {
        let _guard = self.trigger_lock.lock().unwrap();
        for generator in self.snapshot() {
            if generator.should_rotate(now) {
                if let Err(error) = generator.generate(RotationReason::Expiring, default_hosts) {
                    tracing::error!(subscription_id = generator.id(), %error, "expiry rotation failed");
                }
            }
        }
    }

    /// CA-change trigger: every generator reissues, regardless of expiry.
    pub fn on_ca_changed(&self, default_hosts: &dyn Fn() -> Vec<String>) {
        let _guard = self.trigger_lock.lock().unwrap();
        for generator in self.snapshot() {
            if let Err(error) = generator.generate(RotationReason::CaChanged, default_hosts) {
                tracing::error!(subscription_id = generator.id(), %error, "ca-change rotation failed");
            }
        }
    }

    /// Connectivity-change trigger: only generators in the connectivity
    /// set reissue, with `addresses` as their new SAN source.
    pub fn on_connectivity_changed(&self, addresses: Vec<String>) {
        let _guard = self.trigger_lock.lock().unwrap();
        let supplier = move || addresses.clone();
        for generator in self.snapshot() {
            if !generator.watches_connectivity() {
                continue;
            }
            if let Err(error) = generator.generate(RotationReason::ConnectivityChanged, &supplier) {
                tracing::error!(subscription_id = generator.id(), %error, "connectivity rotation failed");
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<CertificateGenerator>> {
        self.generators.read().unwrap().values().cloned().collect()
    }

    /// Subscribe this engine to `CAChanged` and `ConnectivityChanged` on
    /// `bus`, so CA swaps and connectivity updates drive rotation without
    /// the host having to wire each event manually.
    pub fn install(engine: Arc<Self>, bus: &SharedEventBus) {
        let ca_engine = engine.clone();
        bus.subscribe::<CaChanged>(move |_event| {
            ca_engine.on_ca_changed(&|| Vec::new());
        });

        let connectivity_engine = engine;
        bus.subscribe::<ConnectivityChanged>(move |event| {
            connectivity_engine.on_connectivity_changed(event.addresses.clone());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::in_memory_store::InMemoryRuntimeStore;
    use crate::adapters::rcgen_x509::RcgenX509Adapter;
    use crate::ca::issuer::CertificateIssuer;
    use crate::ca::CaStore;
    use crate::events::DomainEventBus;
    use crate::ports::key_provider::SchemeRouter;
    use crate::rotation::generator::{CertificateSubscriber, CertificateSubscription, CertificateUpdateEvent};
    use crate::types::{DistinguishedName, KeyAlgorithm, Role};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    struct CountingSubscriber(AtomicUsize);
    impl CertificateSubscriber for CountingSubscriber {
        fn on_certificate_update(&self, _event: &CertificateUpdateEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn ca_changed_event_triggers_every_registered_generator() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let bus = Arc::new(DomainEventBus::new());
        let x509 = Arc::new(RcgenX509Adapter::new());
        let store: Arc<dyn crate::ports::runtime_store::RuntimeStore> = Arc::new(InMemoryRuntimeStore::new());
        let key_provider: Arc<dyn crate::ports::key_provider::KeyProvider> = Arc::new(SchemeRouter::new());
        let ca_store = Arc::new(CaStore::new(x509.clone(), store, key_provider, bus.clone()));
        rt.block_on(ca_store.load_or_create_managed("another-test-passphrase", KeyAlgorithm::EcdsaP256)).unwrap();

        let issuer = Arc::new(CertificateIssuer::new(x509.clone()));
        let subscriber = Arc::new(CountingSubscriber(AtomicUsize::new(0)));
        let subject = DistinguishedName::with_common_name("client-device-2");
        let key_pair = x509.generate_key_pair(KeyAlgorithm::Rsa4096).unwrap();
        let subscription = CertificateSubscription {
            id: CertificateSubscription::compute_id(&subject, Role::Client),
            role: Role::Client,
            subject,
            key_pair,
            subscriber: subscriber.clone(),
        };
        let generator = Arc::new(crate::rotation::generator::CertificateGenerator::new(
            subscription,
            issuer,
            ca_store,
            StdDuration::from_secs(7 * 24 * 3600),
            false,
        ));

        let engine = Arc::new(CertificateRotationEngine::new());
        engine.register(generator);
        CertificateRotationEngine::install(engine.clone(), &bus);

        bus.emit(CaChanged { new_subject: "CN=test".to_string(), at: chrono::Utc::now() });
        assert_eq!(subscriber.0.load(Ordering::SeqCst), 1);
    }
}
