//! End-to-end exercise of the CA → issuance → verification → registry →
//! authorization chain against the in-memory/mock adapters, the way a
//! host wires these pieces together in production.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use client_device_auth_core::adapters::{InMemoryRuntimeStore, MockIotAuthClient, RcgenX509Adapter};
use client_device_auth_core::config::{DeviceGroup, DeviceGroupPolicy};
use client_device_auth_core::prelude::*;
use client_device_auth_core::rotation::generator::{CertificateSubscriber, CertificateUpdateEvent};

fn device_group_config() -> DeviceGroup {
    let mut policy_variables = HashMap::new();
    policy_variables.insert("roomName".to_string(), "livingroom".to_string());

    let mut policies = HashMap::new();
    policies.insert(
        "default".to_string(),
        DeviceGroupPolicy {
            policy_variables,
            operations: vec!["mqtt:Publish".to_string(), "mqtt:Subscribe".to_string()],
            resources: vec!["mqtt:topic:devices/${iot:Connection.Thing.ThingName}/*".to_string()],
            principals: vec!["*".to_string()],
        },
    );

    DeviceGroup { selection_rule: r#"Thing.ThingName: MATCHES_EXPRESSION: "livingroom-*""#.to_string(), policies }
}

async fn build_harness() -> (Arc<CaStore>, Arc<RcgenX509Adapter>, Arc<IdentityRegistry>, Arc<MockIotAuthClient>, Arc<VerifyIdentityPipeline>)
{
    let bus = Arc::new(DomainEventBus::new());
    let x509 = Arc::new(RcgenX509Adapter::new());
    let store: Arc<dyn client_device_auth_core::ports::runtime_store::RuntimeStore> = Arc::new(InMemoryRuntimeStore::new());
    let key_provider: Arc<dyn client_device_auth_core::ports::key_provider::KeyProvider> =
        Arc::new(client_device_auth_core::ports::key_provider::SchemeRouter::new());
    let ca_store = Arc::new(CaStore::new(x509.clone(), store.clone(), key_provider, bus.clone()));
    ca_store.load_or_create_managed("end-to-end-test-passphrase", KeyAlgorithm::EcdsaP256).await.unwrap();

    let registry = Arc::new(IdentityRegistry::new(store, bus));
    let iot_auth = Arc::new(MockIotAuthClient::new());
    let verify = Arc::new(VerifyIdentityPipeline::new(
        x509.clone(),
        ca_store.clone(),
        iot_auth.clone(),
        registry.clone(),
        Duration::from_secs(3600),
    ));

    (ca_store, x509, registry, iot_auth, verify)
}

#[tokio::test]
async fn a_freshly_issued_leaf_is_trusted_and_its_thing_attachment_is_authorized() {
    let (ca_store, x509, registry, iot_auth, verify) = build_harness().await;

    let ca = ca_store.active();
    let issuer = CertificateIssuer::new(x509.clone() as Arc<dyn client_device_auth_core::ports::x509::X509Port>);
    let key_pair = x509.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
    let leaf = issuer
        .issue_client(&ca, &DistinguishedName::with_common_name("livingroom-sensor-1"), &key_pair, Duration::from_secs(3600))
        .unwrap();

    assert!(verify.verify_client_certificate(&leaf.pem).await.unwrap());

    let certificate_id = client_device_auth_core::types::certificate_id(&client_device_auth_core::types::canonicalize_pem(&leaf.pem));
    iot_auth.set_attachment("livingroom-sensor-1", &certificate_id, true);
    assert!(verify.verify_thing_attached_to_certificate("livingroom-sensor-1", &certificate_id).await.unwrap());

    let (thing, _) = registry.get_or_create_thing("livingroom-sensor-1").await.unwrap();
    assert!(thing.attachments.contains_key(&certificate_id));

    let mut groups = HashMap::new();
    groups.insert("livingroom".to_string(), device_group_config());
    let evaluator = PolicyEvaluator::new(GroupManager::new(groups));

    let mut attributes = HashMap::new();
    attributes.insert("Thing.ThingName".to_string(), "livingroom-sensor-1".to_string());
    let session = Session { session_id: "session-1".to_string(), attributes };

    assert!(evaluator
        .authorize(&session, "mqtt:Publish", "mqtt:topic:devices/livingroom-sensor-1/telemetry")
        .unwrap());
    assert!(!evaluator
        .authorize(&session, "mqtt:Publish", "mqtt:topic:devices/other-thing/telemetry")
        .unwrap());
}

#[tokio::test]
async fn background_refresh_prunes_a_thing_the_cloud_no_longer_reports() {
    let (_ca_store, _x509, registry, iot_auth, verify) = build_harness().await;
    let network = Arc::new(NetworkStateProvider::new(Arc::new(DomainEventBus::new())));
    network.notify_up();

    registry.attach("stale-thing", "stale-cert", chrono::Utc::now()).await.unwrap();
    registry.get_or_create_certificate("stale-cert-pem").await.unwrap();
    iot_auth.set_things_on_core(vec![]);

    let refresh = BackgroundRefresh::with_cadence(
        registry.clone(),
        iot_auth.clone(),
        verify,
        network,
        Duration::from_millis(10),
    );

    assert!(refresh.run_if_due().await.unwrap());
    assert!(registry.all_things().await.is_empty());
}

struct CountingSubscriber(std::sync::atomic::AtomicUsize);

impl CertificateSubscriber for CountingSubscriber {
    fn on_certificate_update(&self, _event: &CertificateUpdateEvent) {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[tokio::test]
async fn a_ca_change_event_reissues_every_registered_generator() {
    let (ca_store, x509, _registry, _iot_auth, _verify) = build_harness().await;

    let subject = DistinguishedName::with_common_name("rotating-thing");
    let key_pair = x509.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
    let subscriber = Arc::new(CountingSubscriber(std::sync::atomic::AtomicUsize::new(0)));
    let subscription = CertificateSubscription {
        id: CertificateSubscription::compute_id(&subject, client_device_auth_core::types::Role::Client),
        role: client_device_auth_core::types::Role::Client,
        subject,
        key_pair,
        subscriber: subscriber.clone(),
    };
    let issuer = Arc::new(CertificateIssuer::new(x509.clone() as Arc<dyn client_device_auth_core::ports::x509::X509Port>));
    let generator = Arc::new(CertificateGenerator::new(subscription, issuer, ca_store.clone(), Duration::from_secs(3600), false));

    let engine = CertificateRotationEngine::new();
    engine.register(generator);
    engine.on_ca_changed(&|| Vec::new());

    assert_eq!(subscriber.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(engine.generator_count(), 1);
}
