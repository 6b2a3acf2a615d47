//! Configuration.
//!
//! Centralizes every recognized option this crate exposes: CA selection,
//! trust duration, cloud-call concurrency limits, certificate validity
//! windows, the device-group policy tree, and metrics knobs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::types::KeyAlgorithm;

/// Top-level configuration snapshot. Hot reconfiguration replaces the
/// pointer to this struct atomically (`Arc<Config>` swap); components
/// read the pointer once per operation rather than re-resolving fields
/// mid-operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Certificate authority selection.
    pub certificate_authority: CertificateAuthorityConfig,
    /// Trust-cache and cloud-call concurrency knobs.
    pub security: SecurityConfig,
    /// Cloud-call worker pool sizing.
    pub performance: PerformanceConfig,
    /// Certificate validity windows and rotation toggle.
    pub certificates: CertificatesConfig,
    /// Device group authorization policy tree.
    #[serde(default)]
    pub device_groups: HashMap<String, DeviceGroup>,
    /// Metrics knobs.
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            certificate_authority: CertificateAuthorityConfig::default(),
            security: SecurityConfig::default(),
            performance: PerformanceConfig::default(),
            certificates: CertificatesConfig::default(),
            device_groups: HashMap::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// `certificateAuthority.*` options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateAuthorityConfig {
    /// `RSA_2048` or `ECDSA_P256`.
    pub ca_type: String,
    /// When set together with `certificate_uri`, switches to custom CA mode.
    pub private_key_uri: Option<String>,
    /// When set together with `private_key_uri`, switches to custom CA mode.
    pub certificate_uri: Option<String>,
    /// Optional full chain override for custom mode.
    pub certificate_chain_uri: Option<String>,
}

impl Default for CertificateAuthorityConfig {
    fn default() -> Self {
        Self {
            ca_type: "RSA_2048".to_string(),
            private_key_uri: None,
            certificate_uri: None,
            certificate_chain_uri: None,
        }
    }
}

impl CertificateAuthorityConfig {
    /// Whether this configuration selects the custom CA (both a private
    /// key URI and a certificate URI present) versus the managed CA.
    pub fn is_custom(&self) -> bool {
        self.private_key_uri.is_some() && self.certificate_uri.is_some()
    }

    /// Parse `ca_type` into a `KeyAlgorithm`, defaulting to RSA-2048 on an
    /// unrecognized value (validated separately by `Config::validate`).
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::from_config_str(&self.ca_type).unwrap_or_default()
    }
}

/// `security.*` options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Maximum age, in minutes, for which a cached upstream identity
    /// decision may be used offline. `0` disables trust caching (strict
    /// online verification).
    pub client_device_trust_duration_minutes: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { client_device_trust_duration_minutes: 720 }
    }
}

impl SecurityConfig {
    /// The configured trust duration as a `Duration`.
    pub fn trust_duration(&self) -> Duration {
        Duration::from_secs(self.client_device_trust_duration_minutes * 60)
    }
}

/// `performance.*` options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Bounded queue size for the cloud-call worker pool.
    pub cloud_request_queue_size: usize,
    /// Maximum concurrent in-flight cloud requests.
    pub max_concurrent_cloud_requests: usize,
    /// Maximum number of active auth tokens (sessions) retained at once.
    pub max_active_auth_tokens: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            cloud_request_queue_size: 100,
            max_concurrent_cloud_requests: 1,
            max_active_auth_tokens: 2500,
        }
    }
}

/// `certificates.*` options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificatesConfig {
    /// Server leaf validity, in seconds.
    pub server_certificate_validity_seconds: u64,
    /// Client leaf validity, in seconds.
    pub client_certificate_validity_seconds: u64,
    /// When true, a subscription issues at most once for the process
    /// lifetime (the initial issuance still fires).
    pub disable_certificate_rotation: bool,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            server_certificate_validity_seconds: 7 * 24 * 3600,
            client_certificate_validity_seconds: 7 * 24 * 3600,
            disable_certificate_rotation: false,
        }
    }
}

impl CertificatesConfig {
    /// Configured server leaf validity as a `Duration`.
    pub fn server_validity(&self) -> Duration {
        Duration::from_secs(self.server_certificate_validity_seconds)
    }

    /// Configured client leaf validity as a `Duration`.
    pub fn client_validity(&self) -> Duration {
        Duration::from_secs(self.client_certificate_validity_seconds)
    }
}

/// A named device group: a selection rule plus the policies that apply to
/// sessions matching it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGroup {
    /// Rule matched against session attributes to decide membership
    /// (e.g. `thingName: MATCHES_EXPRESSION: "livingroom-*"`).
    pub selection_rule: String,
    /// Named policies applying to members of this group.
    pub policies: HashMap<String, DeviceGroupPolicy>,
}

/// One named authorization policy within a device group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGroupPolicy {
    /// Template variable substitutions available to this policy's
    /// resource templates, beyond the built-in `${iot:...}` ones.
    #[serde(default)]
    pub policy_variables: HashMap<String, String>,
    /// Allowed operations (`service:action`, possibly wildcarded).
    pub operations: Vec<String>,
    /// Allowed resources (`service:type:name`, possibly wildcarded).
    pub resources: Vec<String>,
    /// Principals this policy applies to (`*` for "session's own
    /// identity").
    #[serde(default = "default_principal")]
    pub principals: Vec<String>,
}

fn default_principal() -> Vec<String> {
    vec!["*".to_string()]
}

/// `metrics.*` options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Disables metrics emission entirely.
    pub disable_metrics: bool,
    /// Aggregation period, in seconds.
    pub aggregate_period_seconds: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { disable_metrics: false, aggregate_period_seconds: 3600 }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// Validate recognized options, matching the invariants other modules
    /// rely on (a valid `caType`, a non-conflicting CA mode selection).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if KeyAlgorithm::from_config_str(&self.certificate_authority.ca_type).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unrecognized certificateAuthority.caType: {}",
                self.certificate_authority.ca_type
            )));
        }

        let has_key_uri = self.certificate_authority.private_key_uri.is_some();
        let has_cert_uri = self.certificate_authority.certificate_uri.is_some();
        if has_key_uri != has_cert_uri {
            return Err(ConfigError::Invalid(
                "certificateAuthority.privateKeyUri and certificateUri must be set together".to_string(),
            ));
        }

        if self.performance.max_concurrent_cloud_requests == 0 {
            return Err(ConfigError::Invalid(
                "performance.maxConcurrentCloudRequests must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the configuration file failed.
    #[error("io error: {0}")]
    Io(String),
    /// The file could not be parsed as TOML matching `Config`'s shape.
    #[error("parse error: {0}")]
    Parse(String),
    /// The configuration could not be serialized back to TOML.
    #[error("serialize error: {0}")]
    Serialize(String),
    /// A recognized option held a value that fails validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
