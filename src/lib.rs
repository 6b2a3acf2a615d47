//! Client device authentication core: a local certificate authority,
//! certificate issuance and rotation, a connectivity-aware device shadow
//! state machine, an identity registry with a bounded offline trust cache,
//! and a session/authorization policy engine for an MQTT-facing edge
//! gateway.
//!
//! The crate is organized as a small hexagon: `ports` defines the
//! interfaces the domain logic depends on (X.509 operations, durable
//! key/value storage, CA key material resolution, the upstream device
//! registry, the device shadow transport); `adapters` provides concrete
//! implementations of those ports (`rcgen`/`x509-parser`-backed crypto, an
//! in-memory store, file-based key resolution, and test-double mocks for
//! the cloud and shadow transports). The domain modules (`ca`, `rotation`,
//! `shadow`, `identity`, `session`) depend only on the ports, never on a
//! concrete adapter, so they can be exercised in tests against the mock
//! adapters exactly as a host exercises them against the real ones.

pub mod adapters;
pub mod ca;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod metrics;
pub mod network;
pub mod ports;
pub mod rotation;
pub mod session;
pub mod shadow;
pub mod types;
pub mod worker;

/// Re-exports of the types most hosts need, so a binary crate or
/// integration test can `use client_device_auth_core::prelude::*;`
/// instead of reaching into individual modules.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::events::{CaChanged, ConnectivityChanged, DomainEvent, DomainEventBus, NetworkTransition, SharedEventBus, ThingUpdated};
    pub use crate::metrics::{Counter, InMemoryMetricsSink, MetricsSink, NoopMetricsSink};
    pub use crate::network::NetworkStateProvider;
    pub use crate::types::{CaKind, DistinguishedName, KeyAlgorithm, Role, SanEntry, canonicalize_pem, certificate_id};

    pub use crate::ca::{CaHandle, CaStore};
    pub use crate::ca::issuer::CertificateIssuer;
    pub use crate::identity::background_refresh::BackgroundRefresh;
    pub use crate::identity::registry::IdentityRegistry;
    pub use crate::identity::verify::VerifyIdentityPipeline;
    pub use crate::rotation::engine::CertificateRotationEngine;
    pub use crate::rotation::generator::{CertificateGenerator, CertificateSubscription, RotationReason};
    pub use crate::session::manager::{Session, SessionManager};
    pub use crate::session::policy::{GroupManager, PolicyEvaluator};
    pub use crate::shadow::machine::ConnectivityShadowMachine;

    pub use crate::ports::iot_auth::IotAuthClient;
    pub use crate::ports::key_provider::KeyProvider;
    pub use crate::ports::runtime_store::RuntimeStore;
    pub use crate::ports::shadow_client::ShadowClient;
    pub use crate::ports::x509::X509Port;
}
