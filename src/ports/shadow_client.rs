//! Abstract MQTT shadow transport port.
//!
//! The shadow transport itself (AT_LEAST_ONCE MQTT, the concrete topic
//! wire format) is explicitly out of scope; this module only defines the
//! shape `ConnectivityShadowMachine` drives it through.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Abstract connectivity-info shadow transport for one Thing's `-gci`
/// named shadow.
#[async_trait]
pub trait ShadowClient: Send + Sync {
    /// Subscribe to `delta`, `get/accepted` and `get/rejected` for
    /// `thing_name`'s shadow. Events are delivered to `sink` until
    /// `unsubscribe` is called. Implementations retry subscribe failures
    /// with exponential backoff themselves (base 1s, cap 30s, indefinite).
    async fn subscribe(&self, thing_name: &str, sink: Arc<dyn ShadowEventSink>) -> Result<(), ShadowError>;

    /// Tear down the subscriptions established by `subscribe`.
    async fn unsubscribe(&self, thing_name: &str) -> Result<(), ShadowError>;

    /// Publish a `get` request for `thing_name`'s shadow.
    async fn publish_get(&self, thing_name: &str) -> Result<(), ShadowError>;

    /// Publish `state.reported = desired_state` for `thing_name`'s shadow.
    async fn publish_reported(
        &self,
        thing_name: &str,
        desired_state: serde_json::Value,
    ) -> Result<(), ShadowError>;
}

/// Receives shadow events pushed by a `ShadowClient` subscription.
pub trait ShadowEventSink: Send + Sync {
    /// Called once per `delta` or `get/accepted` message.
    fn on_shadow_state(&self, event: ShadowEvent);

    /// Called once per `get/rejected` message.
    fn on_get_rejected(&self, code: u32, message: String);
}

/// A single shadow version observation, either from `delta` or
/// `get/accepted`.
#[derive(Debug, Clone)]
pub struct ShadowEvent {
    /// Monotonic shadow document version from the cloud.
    pub shadow_version: u64,
    /// Opaque `desired.version` field used as the CIS version tiebreaker.
    pub cis_version: String,
    /// The raw desired-state document.
    pub desired_state: serde_json::Value,
}

/// Shadow transport errors.
#[derive(Debug, Error)]
pub enum ShadowError {
    /// Subscribe failed (caller retries with backoff).
    #[error("shadow subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Publish failed.
    #[error("shadow publish failed: {0}")]
    PublishFailed(String),

    /// Waiting for `get/accepted` or `get/rejected` exceeded
    /// `mqttOperationTimeout + 5s`.
    #[error("timed out waiting for shadow get response")]
    Timeout,
}
