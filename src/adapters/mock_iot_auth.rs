//! Deterministic in-memory `IotAuthClient` test double.
//!
//! This plays the same role the sibling example repos' `mock_ca_server`
//! fixtures play for their TLS stacks: it lets the rotation, verification
//! and background-refresh logic be exercised without a live cloud
//! endpoint.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::ports::iot_auth::{CertificateStatus, CloudError, ConnectivityInfo, IotAuthClient, ThingPage};

/// Configurable in-memory stand-in for the upstream cloud identity oracle.
#[derive(Default)]
pub struct MockIotAuthClient {
    certificates: RwLock<HashMap<String, CertificateStatus>>,
    attachments: RwLock<HashMap<(String, String), bool>>,
    things_on_core: RwLock<Vec<String>>,
    connectivity: RwLock<HashMap<String, ConnectivityInfo>>,
    attributes: RwLock<HashMap<String, HashMap<String, String>>>,
    published_authorities: RwLock<HashMap<String, Vec<String>>>,
    /// When set, every call fails with this error instead of consulting
    /// the maps above — used to simulate a cloud outage.
    pub force_error: RwLock<Option<String>>,
}

impl MockIotAuthClient {
    /// Construct an empty double; every call returns `NotFound`/`false`
    /// until configured via the `set_*` helpers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `pem` is known to the cloud with the given status.
    pub fn set_certificate_status(&self, pem: &str, status: CertificateStatus) {
        self.certificates.write().unwrap().insert(pem.to_string(), status);
    }

    /// Record that `thing_name` is attached to `certificate_id`.
    pub fn set_attachment(&self, thing_name: &str, certificate_id: &str, attached: bool) {
        self.attachments
            .write()
            .unwrap()
            .insert((thing_name.to_string(), certificate_id.to_string()), attached);
    }

    /// Replace the set of Things the cloud reports as attached to this
    /// core device.
    pub fn set_things_on_core(&self, things: Vec<String>) {
        *self.things_on_core.write().unwrap() = things;
    }

    /// Record cloud-reported connectivity info for `thing_name`.
    pub fn set_connectivity_info(&self, thing_name: &str, info: ConnectivityInfo) {
        self.connectivity.write().unwrap().insert(thing_name.to_string(), info);
    }

    /// Record cloud-side attributes for `thing_name`.
    pub fn set_thing_attributes(&self, thing_name: &str, attrs: HashMap<String, String>) {
        self.attributes.write().unwrap().insert(thing_name.to_string(), attrs);
    }

    /// Inspect what was last published via `put_certificate_authorities`.
    pub fn published_authorities(&self, thing_name: &str) -> Option<Vec<String>> {
        self.published_authorities.read().unwrap().get(thing_name).cloned()
    }

    /// Make every subsequent call fail with `CloudError::Transport(message)`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.force_error.write().unwrap() = Some(message.into());
    }

    /// Clear a previously configured forced failure.
    pub fn clear_failure(&self) {
        *self.force_error.write().unwrap() = None;
    }

    fn check_forced_failure(&self) -> Result<(), CloudError> {
        if let Some(message) = self.force_error.read().unwrap().clone() {
            return Err(CloudError::Transport(message));
        }
        Ok(())
    }
}

#[async_trait]
impl IotAuthClient for MockIotAuthClient {
    async fn get_iot_certificate(&self, certificate_pem: &str) -> Result<CertificateStatus, CloudError> {
        self.check_forced_failure()?;
        Ok(self
            .certificates
            .read()
            .unwrap()
            .get(certificate_pem)
            .copied()
            .unwrap_or(CertificateStatus::NotFound))
    }

    async fn is_thing_attached_to_certificate(
        &self,
        thing_name: &str,
        certificate_id: &str,
    ) -> Result<bool, CloudError> {
        self.check_forced_failure()?;
        Ok(self
            .attachments
            .read()
            .unwrap()
            .get(&(thing_name.to_string(), certificate_id.to_string()))
            .copied()
            .unwrap_or(false))
    }

    async fn list_things_attached_to_core(&self, page_token: Option<String>) -> Result<ThingPage, CloudError> {
        self.check_forced_failure()?;
        if page_token.is_some() {
            return Ok(ThingPage { things: vec![], next_page_token: None });
        }
        Ok(ThingPage {
            things: self.things_on_core.read().unwrap().clone(),
            next_page_token: None,
        })
    }

    async fn get_connectivity_info(&self, thing_name: &str) -> Result<Option<ConnectivityInfo>, CloudError> {
        self.check_forced_failure()?;
        Ok(self.connectivity.read().unwrap().get(thing_name).cloned())
    }

    async fn put_certificate_authorities(&self, thing_name: &str, pems: &[String]) -> Result<(), CloudError> {
        self.check_forced_failure()?;
        self.published_authorities
            .write()
            .unwrap()
            .insert(thing_name.to_string(), pems.to_vec());
        Ok(())
    }

    async fn get_thing_attributes(&self, thing_name: &str) -> Result<HashMap<String, String>, CloudError> {
        self.check_forced_failure()?;
        Ok(self.attributes.read().unwrap().get(thing_name).cloned().unwrap_or_default())
    }
}
