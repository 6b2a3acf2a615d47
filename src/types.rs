//! Shared value types for the certificate authority, rotation, identity and
//! session domains.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Key algorithm used for a CA or a leaf key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// RSA with a 2048-bit modulus.
    Rsa2048,
    /// RSA with a 4096-bit modulus, the default for device-local
    /// subscription key pairs (as distinct from the CA's own key).
    Rsa4096,
    /// ECDSA on the NIST P-256 curve.
    EcdsaP256,
}

impl KeyAlgorithm {
    /// Parse the `certificateAuthority.caType` configuration value.
    pub fn from_config_str(s: &str) -> Option<Self> {
        match s {
            "RSA_2048" => Some(Self::Rsa2048),
            "ECDSA_P256" => Some(Self::EcdsaP256),
            _ => None,
        }
    }
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        Self::Rsa2048
    }
}

/// Which kind of certificate authority is currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaKind {
    /// Self-generated, locally managed CA.
    Managed,
    /// Externally supplied CA key and chain.
    Custom,
}

/// The role a certificate subscription plays, which determines which
/// rotation triggers it is enrolled in (see `CertificateRotationEngine`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Client-auth leaf only; enrolled in expiry and CA-change triggers.
    Client,
    /// Server-auth leaf only; enrolled in all three triggers.
    Server,
    /// Both client-auth and server-auth EKUs on one leaf; enrolled in all
    /// three triggers.
    ClientAndServer,
}

impl Role {
    /// Whether this role's generator should be enrolled in the
    /// connectivity-change monitor set.
    pub fn watches_connectivity(self) -> bool {
        matches!(self, Role::Server | Role::ClientAndServer)
    }

    /// Whether this role requests a server EKU / SAN set.
    pub fn is_server(self) -> bool {
        matches!(self, Role::Server | Role::ClientAndServer)
    }

    /// Whether this role requests a client EKU.
    pub fn is_client(self) -> bool {
        matches!(self, Role::Client | Role::ClientAndServer)
    }
}

/// An X.500 distinguished name, used both for the CA subject and for leaf
/// subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistinguishedName {
    /// Common Name (CN).
    pub common_name: String,
    /// Organization (O).
    pub organization: Option<String>,
    /// Organizational Unit (OU).
    pub organizational_unit: Option<String>,
    /// Locality (L).
    pub locality: Option<String>,
    /// State or Province (ST).
    pub state: Option<String>,
    /// Country (C).
    pub country: Option<String>,
}

impl DistinguishedName {
    /// The distinguished name the managed CA always uses:
    /// `CN=Greengrass Core CA, O=Amazon.com Inc., OU=Amazon Web Services,
    /// L=Seattle, ST=Washington, C=US`.
    pub fn managed_ca() -> Self {
        Self {
            common_name: "Greengrass Core CA".to_string(),
            organization: Some("Amazon.com Inc.".to_string()),
            organizational_unit: Some("Amazon Web Services".to_string()),
            locality: Some("Seattle".to_string()),
            state: Some("Washington".to_string()),
            country: Some("US".to_string()),
        }
    }

    /// A bare subject with only a common name, used for leaf subjects built
    /// from a subscription's subject string.
    pub fn with_common_name(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
            organizational_unit: None,
            locality: None,
            state: None,
            country: None,
        }
    }

    /// Render as an RFC 4514-ish display string, used only for log messages
    /// and equality checks in tests (`CN=...,O=...`).
    pub fn to_display_string(&self) -> String {
        let mut parts = vec![format!("CN={}", self.common_name)];
        if let Some(o) = &self.organization {
            parts.push(format!("O={}", o));
        }
        if let Some(ou) = &self.organizational_unit {
            parts.push(format!("OU={}", ou));
        }
        if let Some(l) = &self.locality {
            parts.push(format!("L={}", l));
        }
        if let Some(st) = &self.state {
            parts.push(format!("ST={}", st));
        }
        if let Some(c) = &self.country {
            parts.push(format!("C={}", c));
        }
        parts.join(",")
    }
}

/// A classified Subject Alternative Name entry: the SAN builder must tell
/// IPv4, IPv6 and hostnames apart rather than emitting everything as a DNS
/// name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SanEntry {
    /// A DNS hostname entry.
    Dns(String),
    /// An IPv4 or IPv6 address entry.
    Ip(IpAddr),
}

impl SanEntry {
    /// Classify a raw address/hostname string the way `CertificateIssuer`
    /// must: parse as an IP address first, fall back to a DNS name.
    pub fn classify(raw: &str) -> Self {
        match raw.parse::<IpAddr>() {
            Ok(ip) => SanEntry::Ip(ip),
            Err(_) => SanEntry::Dns(raw.to_string()),
        }
    }
}

/// Canonicalize PEM text the way the identity registry expects: strip a
/// trailing newline, normalize line endings to LF, ensure exactly one
/// trailing newline. This makes `certificate_id` deterministic regardless
/// of how the PEM was sourced.
pub fn canonicalize_pem(pem: &str) -> String {
    let normalized = pem.replace("\r\n", "\n");
    let trimmed = normalized.trim_end_matches('\n');
    format!("{trimmed}\n")
}

/// `certificateId(P) = lowercase_hex(sha256(utf8(P)))` over the
/// canonicalized PEM text, as required by the testable properties.
pub fn certificate_id(pem: &str) -> String {
    let canonical = canonicalize_pem(pem);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_id_is_deterministic() {
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        let a = certificate_id(pem);
        let b = certificate_id(pem);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn certificate_id_ignores_line_ending_and_trailing_newline_differences() {
        let lf = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        let crlf = "-----BEGIN CERTIFICATE-----\r\nMIIB\r\n-----END CERTIFICATE-----\r\n";
        let no_trailing_newline = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----";
        assert_eq!(certificate_id(lf), certificate_id(crlf));
        assert_eq!(certificate_id(lf), certificate_id(no_trailing_newline));
    }

    #[test]
    fn san_entry_classifies_ip_vs_hostname() {
        assert_eq!(SanEntry::classify("127.0.0.1"), SanEntry::Ip("127.0.0.1".parse().unwrap()));
        assert_eq!(
            SanEntry::classify("::1"),
            SanEntry::Ip("::1".parse().unwrap())
        );
        assert_eq!(
            SanEntry::classify("gateway.local"),
            SanEntry::Dns("gateway.local".to_string())
        );
    }
}
