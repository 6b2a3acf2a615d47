//! Upstream IoT cloud identity oracle port.
//!
//! The concrete cloud SDK and its transport are out of scope for this
//! core; this crate only defines the shape every caller
//! (`VerifyIdentityPipeline`, `BackgroundRefresh`, `ConnectivityShadowMachine`)
//! needs and retries against.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Upstream cloud identity oracle.
#[async_trait]
pub trait IotAuthClient: Send + Sync {
    /// Ask whether `certificate_pem` is active in the cloud registry.
    async fn get_iot_certificate(&self, certificate_pem: &str) -> Result<CertificateStatus, CloudError>;

    /// Ask whether `thing_name` is attached to `certificate_id`.
    async fn is_thing_attached_to_certificate(
        &self,
        thing_name: &str,
        certificate_id: &str,
    ) -> Result<bool, CloudError>;

    /// List the Things currently associated with this core device,
    /// paginated.
    async fn list_things_attached_to_core(
        &self,
        page_token: Option<String>,
    ) -> Result<ThingPage, CloudError>;

    /// Fetch the cloud-reported connectivity info (host addresses) for
    /// `thing_name`, or `None` if the cloud has nothing on file yet.
    async fn get_connectivity_info(&self, thing_name: &str) -> Result<Option<ConnectivityInfo>, CloudError>;

    /// Push the local CA chain up to the cloud so it can validate
    /// certificates this core issues.
    async fn put_certificate_authorities(&self, thing_name: &str, pems: &[String]) -> Result<(), CloudError>;

    /// Fetch arbitrary cloud-side Thing attributes, used to populate
    /// session attributes beyond `ThingName`.
    async fn get_thing_attributes(&self, thing_name: &str) -> Result<HashMap<String, String>, CloudError>;
}

/// Cloud-reported certificate activation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateStatus {
    /// The certificate is active and trusted.
    Active,
    /// The certificate is known but inactive/revoked.
    Inactive,
    /// The certificate is unknown to the cloud registry.
    NotFound,
}

/// One page of a Things-attached-to-core listing.
#[derive(Debug, Clone, Default)]
pub struct ThingPage {
    /// Thing names returned in this page.
    pub things: Vec<String>,
    /// Token to pass back in for the next page, or `None` if this was the
    /// last page.
    pub next_page_token: Option<String>,
}

/// Cloud-reported connectivity info: the host address set the core should
/// advertise in its server certificate SANs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityInfo {
    /// Host addresses (hostnames or IP literals), unordered.
    pub addresses: Vec<String>,
    /// Opaque desired-state version from the cloud shadow (`desired.version`).
    pub cis_version: String,
}

/// Cloud interaction errors, classified by retry semantics: `Throttling`
/// and `ServerError` are retried indefinitely by callers that specify so;
/// `Validation` and `NotFound` are not retried.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The cloud rejected the request as invalid; retrying with the same
    /// input would not help.
    #[error("validation error: {0}")]
    Validation(String),

    /// The referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The cloud is throttling this caller; retry with backoff.
    #[error("throttled: {0}")]
    Throttling(String),

    /// The cloud returned a server-side error; retry with backoff.
    #[error("server error: {0}")]
    ServerError(String),

    /// Transport-level failure (connection reset, timeout, DNS, TLS).
    #[error("transport error: {0}")]
    Transport(String),
}

impl CloudError {
    /// Whether a caller should retry this error indefinitely (throttling
    /// and server errors) versus not at all (validation, not-found).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Throttling(_) | CloudError::ServerError(_) | CloudError::Transport(_))
    }
}
