//! Per-subscription certificate generator: remembers a subscription's
//! subject, key pair, subscriber callback and most recently issued leaf,
//! and knows how to produce a fresh one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use time::OffsetDateTime;

use crate::ca::issuer::CertificateIssuer;
use crate::ca::CaStore;
use crate::error::Result;
use crate::metrics::{Counter, MetricsSink, NoopMetricsSink};
use crate::ports::x509::{Certificate, PrivateKey};
use crate::types::{certificate_id, DistinguishedName, Role};

/// Debounce window for duplicate rotation triggers against the same CA
/// fingerprint, per the open decision recorded for config-transition
/// double-firing.
const DEBOUNCE_WINDOW: StdDuration = StdDuration::from_millis(250);

/// Why a generation was triggered, carried through to log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    /// The previous leaf is within its rotation lead time of expiry.
    Expiring,
    /// The active CA was swapped.
    CaChanged,
    /// The cloud-reported connectivity address set changed.
    ConnectivityChanged,
}

impl RotationReason {
    /// Short tag used in log messages (`"expiring"`, `"ca changed"`,
    /// `"connectivity changed"`).
    pub fn as_str(self) -> &'static str {
        match self {
            RotationReason::Expiring => "expiring",
            RotationReason::CaChanged => "ca changed",
            RotationReason::ConnectivityChanged => "connectivity changed",
        }
    }
}

/// A static description of a subscriber's certificate interest: subject,
/// role, the device-local key pair, and the callback to invoke on a new
/// issuance.
pub struct CertificateSubscription {
    /// Opaque id, a fingerprint of `subject` and `role`.
    pub id: String,
    /// Client, server, or both.
    pub role: Role,
    /// Leaf subject name.
    pub subject: DistinguishedName,
    /// The subscription's own (device-local) key pair. Certificate
    /// reissuance never changes this; only the signed leaf changes.
    pub key_pair: PrivateKey,
    /// Invoked with each freshly issued leaf.
    pub subscriber: Arc<dyn CertificateSubscriber>,
}

impl CertificateSubscription {
    /// Compute the opaque subscription id for a `(subject, role)` pair.
    pub fn compute_id(subject: &DistinguishedName, role: Role) -> String {
        let seed = format!("{}|{:?}", subject.to_display_string(), role);
        certificate_id(&seed)
    }
}

/// Receives certificate update events for a subscription.
pub trait CertificateSubscriber: Send + Sync {
    /// Called with each freshly issued leaf. Never called on an issuance
    /// failure.
    fn on_certificate_update(&self, event: &CertificateUpdateEvent);
}

/// Delivered to a subscriber on each successful issuance.
#[derive(Clone)]
pub struct CertificateUpdateEvent {
    /// The subscription's own key pair (unchanged across reissuances).
    pub key_pair: PrivateKey,
    /// The freshly issued leaf.
    pub leaf: Certificate,
    /// The CA chain as it was at the moment of issuance.
    pub ca_chain_at_issue: Vec<Certificate>,
}

struct IssuedState {
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

/// Stateful per-subscription generator. Exclusively owns the
/// subscription's key pair and its record of the most recently issued
/// leaf's validity window.
pub struct CertificateGenerator {
    subscription: CertificateSubscription,
    issuer: Arc<CertificateIssuer>,
    ca_store: Arc<CaStore>,
    validity: StdDuration,
    disable_rotation: bool,
    last_issued: Mutex<Option<IssuedState>>,
    issued_once: AtomicBool,
    last_debounce: Mutex<Option<(String, Instant)>>,
    metrics: Arc<dyn MetricsSink>,
}

impl CertificateGenerator {
    /// Construct a generator for `subscription`, issuing leaves valid for
    /// `validity` and signed through `issuer` against `ca_store`'s active
    /// CA. When `disable_rotation` is true, only the first `generate`
    /// call actually issues; later calls are no-ops. Reports to a no-op
    /// metrics sink; use `with_metrics` to wire in a real one.
    pub fn new(
        subscription: CertificateSubscription,
        issuer: Arc<CertificateIssuer>,
        ca_store: Arc<CaStore>,
        validity: StdDuration,
        disable_rotation: bool,
    ) -> Self {
        Self::with_metrics(subscription, issuer, ca_store, validity, disable_rotation, Arc::new(NoopMetricsSink))
    }

    /// Same as `new`, reporting issuance outcomes to `metrics`.
    pub fn with_metrics(
        subscription: CertificateSubscription,
        issuer: Arc<CertificateIssuer>,
        ca_store: Arc<CaStore>,
        validity: StdDuration,
        disable_rotation: bool,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            subscription,
            issuer,
            ca_store,
            validity,
            disable_rotation,
            last_issued: Mutex::new(None),
            issued_once: AtomicBool::new(false),
            last_debounce: Mutex::new(None),
            metrics,
        }
    }

    /// The subscription id.
    pub fn id(&self) -> &str {
        &self.subscription.id
    }

    /// Whether this generator belongs to the connectivity-change monitor
    /// set (server and client-and-server roles).
    pub fn watches_connectivity(&self) -> bool {
        self.subscription.role.watches_connectivity()
    }

    /// Whether the most recently issued leaf is within its rotation lead
    /// time (half its validity) of `not_after`, or no leaf has been
    /// issued yet.
    pub fn should_rotate(&self, now: OffsetDateTime) -> bool {
        match self.last_issued.lock().unwrap().as_ref() {
            None => true,
            Some(state) => {
                let lead = (state.not_after - state.not_before) / 2;
                now >= state.not_after - lead
            }
        }
    }

    /// Issue a fresh leaf and notify the subscriber, unless
    /// `disable_rotation` has already fired once, or this call is a
    /// debounced duplicate of a very recent call against the same CA
    /// fingerprint. Issuance failures are returned to the caller and the
    /// subscriber is not invoked.
    pub fn generate(&self, reason: RotationReason, address_supplier: &dyn Fn() -> Vec<String>) -> Result<()> {
        if self.disable_rotation && self.issued_once.load(Ordering::SeqCst) {
            return Ok(());
        }

        let ca = self.ca_store.active();
        let ca_fingerprint = certificate_id(&ca.leaf().pem);
        {
            let mut debounce = self.last_debounce.lock().unwrap();
            if let Some((last_fp, last_at)) = debounce.as_ref() {
                if *last_fp == ca_fingerprint && last_at.elapsed() < DEBOUNCE_WINDOW {
                    tracing::debug!(
                        subscription_id = self.id(),
                        reason = reason.as_str(),
                        "debounced duplicate rotation trigger"
                    );
                    return Ok(());
                }
            }
            *debounce = Some((ca_fingerprint, Instant::now()));
        }

        let leaf = if self.subscription.role.is_server() {
            let hosts = address_supplier();
            self.issuer.issue_server(&ca, &self.subscription.subject, &self.subscription.key_pair, self.validity, &hosts)
        } else {
            self.issuer.issue_client(&ca, &self.subscription.subject, &self.subscription.key_pair, self.validity)
        };
        let leaf = match leaf {
            Ok(leaf) => leaf,
            Err(error) => {
                self.metrics.increment(Counter::CertificateGenerationFailed);
                return Err(error);
            }
        };
        self.metrics.increment(Counter::CertificateIssued);

        *self.last_issued.lock().unwrap() =
            Some(IssuedState { not_before: leaf.not_before, not_after: leaf.not_after });
        self.issued_once.store(true, Ordering::SeqCst);

        let event = CertificateUpdateEvent {
            key_pair: self.subscription.key_pair.clone(),
            leaf,
            ca_chain_at_issue: ca.chain.clone(),
        };
        self.subscription.subscriber.on_certificate_update(&event);
        tracing::info!(subscription_id = self.id(), reason = reason.as_str(), "issued certificate");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::in_memory_store::InMemoryRuntimeStore;
    use crate::adapters::rcgen_x509::RcgenX509Adapter;
    use crate::events::DomainEventBus;
    use crate::ports::key_provider::SchemeRouter;
    use crate::types::KeyAlgorithm;
    use std::sync::atomic::AtomicUsize;

    struct CountingSubscriber(AtomicUsize);

    impl CertificateSubscriber for CountingSubscriber {
        fn on_certificate_update(&self, _event: &CertificateUpdateEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_generator(disable_rotation: bool) -> (Arc<CertificateGenerator>, Arc<CountingSubscriber>) {
        let bus = Arc::new(DomainEventBus::new());
        let x509 = Arc::new(RcgenX509Adapter::new());
        let store: Arc<dyn crate::ports::runtime_store::RuntimeStore> = Arc::new(InMemoryRuntimeStore::new());
        let key_provider: Arc<dyn crate::ports::key_provider::KeyProvider> = Arc::new(SchemeRouter::new());
        let ca_store = Arc::new(CaStore::new(x509.clone(), store, key_provider, bus));

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(ca_store.load_or_create_managed("test-passphrase-0123456789", KeyAlgorithm::EcdsaP256))
            .unwrap();

        let issuer = Arc::new(CertificateIssuer::new(x509.clone()));
        let subscriber = Arc::new(CountingSubscriber(AtomicUsize::new(0)));
        let subject = DistinguishedName::with_common_name("client-device-1");
        let key_pair = x509.generate_key_pair(KeyAlgorithm::Rsa4096).unwrap();
        let subscription = CertificateSubscription {
            id: CertificateSubscription::compute_id(&subject, Role::Client),
            role: Role::Client,
            subject,
            key_pair,
            subscriber: subscriber.clone(),
        };
        let generator = Arc::new(CertificateGenerator::new(
            subscription,
            issuer,
            ca_store,
            StdDuration::from_secs(7 * 24 * 3600),
            disable_rotation,
        ));
        (generator, subscriber)
    }

    #[test]
    fn first_generate_always_issues_even_with_rotation_disabled() {
        let (generator, subscriber) = test_generator(true);
        generator.generate(RotationReason::CaChanged, &|| Vec::<String>::new()).unwrap();
        assert_eq!(subscriber.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disabled_rotation_is_a_no_op_after_first_issuance() {
        let (generator, subscriber) = test_generator(true);
        generator.generate(RotationReason::CaChanged, &|| Vec::<String>::new()).unwrap();
        generator.generate(RotationReason::Expiring, &|| Vec::<String>::new()).unwrap();
        generator.generate(RotationReason::ConnectivityChanged, &|| Vec::<String>::new()).unwrap();
        assert_eq!(subscriber.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn should_rotate_is_true_before_any_issuance() {
        let (generator, _subscriber) = test_generator(false);
        assert!(generator.should_rotate(OffsetDateTime::now_utc()));
    }
}
