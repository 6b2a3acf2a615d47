//! Leaf certificate issuance: client-auth and server-auth certificates
//! signed by the currently active CA.

use std::sync::Arc;

use time::{Duration as TimeDuration, OffsetDateTime};

use crate::ca::CaHandle;
use crate::error::Result;
use crate::ports::x509::{Certificate, ExtendedKeyUsage, KeyUsage, LeafRequest, PrivateKey, X509Port};
use crate::types::{DistinguishedName, SanEntry};

/// Issues leaf certificates signed by a `CaHandle`'s key and chain.
/// Stateless: every call takes the CA snapshot to sign against, so a CA
/// swap mid-issuance only affects the *next* call, never one already in
/// flight.
pub struct CertificateIssuer {
    x509: Arc<dyn X509Port>,
}

impl CertificateIssuer {
    /// Construct an issuer over the given X.509 port.
    pub fn new(x509: Arc<dyn X509Port>) -> Self {
        Self { x509 }
    }

    /// Issue a client-auth leaf certificate for `subject`/`subject_key`,
    /// signed by `ca`'s leaf, valid for `validity`.
    pub fn issue_client(
        &self,
        ca: &CaHandle,
        subject: &DistinguishedName,
        subject_key: &PrivateKey,
        validity: std::time::Duration,
    ) -> Result<Certificate> {
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + to_time_duration(validity);
        let req = LeafRequest {
            subject: subject.clone(),
            subject_key,
            issuer_cert: ca.leaf(),
            issuer_key: &ca.private_key,
            not_before,
            not_after,
            serial: random_serial(),
            key_usage: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
            extended_key_usage: vec![ExtendedKeyUsage::ClientAuth],
            subject_alt_names: Vec::new(),
        };
        Ok(self.x509.issue_leaf(&req)?)
    }

    /// Issue a server-auth leaf certificate. `san_hosts` is the raw
    /// address/hostname set from the connectivity supplier; `localhost`
    /// is always included.
    pub fn issue_server(
        &self,
        ca: &CaHandle,
        subject: &DistinguishedName,
        subject_key: &PrivateKey,
        validity: std::time::Duration,
        san_hosts: &[String],
    ) -> Result<Certificate> {
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + to_time_duration(validity);

        let mut sans = vec![SanEntry::classify("localhost")];
        for host in san_hosts {
            let entry = SanEntry::classify(host);
            if !sans.contains(&entry) {
                sans.push(entry);
            }
        }

        let req = LeafRequest {
            subject: subject.clone(),
            subject_key,
            issuer_cert: ca.leaf(),
            issuer_key: &ca.private_key,
            not_before,
            not_after,
            serial: random_serial(),
            key_usage: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
            extended_key_usage: vec![ExtendedKeyUsage::ServerAuth],
            subject_alt_names: sans,
        };
        Ok(self.x509.issue_leaf(&req)?)
    }
}

fn to_time_duration(d: std::time::Duration) -> TimeDuration {
    TimeDuration::seconds(d.as_secs() as i64)
}

fn random_serial() -> [u8; 20] {
    use rand::RngCore;
    let mut serial = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut serial);
    serial[0] &= 0x7F;
    serial
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::rcgen_x509::RcgenX509Adapter;
    use crate::ca::CertificateAuthority;
    use crate::types::{CaKind, KeyAlgorithm};

    fn build_managed_ca(x509: &RcgenX509Adapter) -> CaHandle {
        let key = x509.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let subject = DistinguishedName::managed_ca();
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + TimeDuration::days(365);
        let leaf = x509.self_signed_ca(&subject, &key, not_before, not_after, Some(0)).unwrap();
        Arc::new(CertificateAuthority {
            kind: CaKind::Managed,
            key_algorithm: KeyAlgorithm::EcdsaP256,
            private_key: key,
            chain: vec![leaf],
        })
    }

    #[test]
    fn client_leaf_issuer_matches_ca_subject_and_carries_client_eku_only() {
        let x509 = RcgenX509Adapter::default();
        let ca = build_managed_ca(&x509);
        let issuer = CertificateIssuer::new(Arc::new(x509.clone()));

        let subject_key = x509.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let subject = DistinguishedName::with_common_name("client-1");
        let leaf = issuer
            .issue_client(&ca, &subject, &subject_key, std::time::Duration::from_secs(3600))
            .unwrap();

        assert_eq!(leaf.issuer.to_display_string(), ca.leaf().subject.to_display_string());
        assert!(!leaf.is_ca);
    }

    #[test]
    fn server_leaf_san_set_includes_localhost_and_supplied_hosts() {
        let x509 = RcgenX509Adapter::default();
        let ca = build_managed_ca(&x509);
        let issuer = CertificateIssuer::new(Arc::new(x509.clone()));

        let subject_key = x509.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let subject = DistinguishedName::with_common_name("server-1");
        let leaf = issuer
            .issue_server(
                &ca,
                &subject,
                &subject_key,
                std::time::Duration::from_secs(3600),
                &["192.168.1.10".to_string()],
            )
            .unwrap();

        assert_eq!(leaf.issuer.to_display_string(), ca.leaf().subject.to_display_string());
    }
}
