//! `rcgen` + `x509-parser` backed implementation of `X509Port`.

use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName as RcgenDn, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair as RcgenKeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use time::OffsetDateTime;
use x509_parser::prelude::*;

use crate::ports::x509::{
    Certificate, ExtendedKeyUsage, KeyUsage, LeafRequest, ParsedCertificate, PrivateKey, X509Error, X509Port,
};
use crate::types::{DistinguishedName, KeyAlgorithm, SanEntry};

/// `X509Port` implementation backed by `rcgen` for generation/signing and
/// `x509-parser` for parsing externally-supplied bytes.
#[derive(Clone, Default)]
pub struct RcgenX509Adapter;

impl RcgenX509Adapter {
    /// Construct a new adapter. Stateless; safe to share across threads.
    pub fn new() -> Self {
        Self
    }

    fn rcgen_key_pair(key: &PrivateKey) -> Result<RcgenKeyPair, X509Error> {
        RcgenKeyPair::try_from(key.pkcs8_der.as_slice())
            .map_err(|e| X509Error::InvalidKeyMaterial(e.to_string()))
    }

    fn to_rcgen_dn(subject: &DistinguishedName) -> RcgenDn {
        let mut dn = RcgenDn::new();
        dn.push(DnType::CommonName, subject.common_name.as_str());
        if let Some(o) = &subject.organization {
            dn.push(DnType::OrganizationName, o.as_str());
        }
        if let Some(ou) = &subject.organizational_unit {
            dn.push(DnType::OrganizationalUnitName, ou.as_str());
        }
        if let Some(l) = &subject.locality {
            dn.push(DnType::LocalityName, l.as_str());
        }
        if let Some(st) = &subject.state {
            dn.push(DnType::StateOrProvinceName, st.as_str());
        }
        if let Some(c) = &subject.country {
            dn.push(DnType::CountryName, c.as_str());
        }
        dn
    }

    fn random_serial() -> [u8; 20] {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        // A positive serial requires the high bit of the first byte clear.
        bytes[0] &= 0x7f;
        bytes
    }

    fn to_rcgen_key_usage(usage: &[KeyUsage]) -> Vec<KeyUsagePurpose> {
        usage
            .iter()
            .map(|u| match u {
                KeyUsage::DigitalSignature => KeyUsagePurpose::DigitalSignature,
                KeyUsage::KeyEncipherment => KeyUsagePurpose::KeyEncipherment,
                KeyUsage::KeyCertSign => KeyUsagePurpose::KeyCertSign,
                KeyUsage::CrlSign => KeyUsagePurpose::CrlSign,
            })
            .collect()
    }

    fn to_rcgen_eku(usage: &[ExtendedKeyUsage]) -> Vec<ExtendedKeyUsagePurpose> {
        usage
            .iter()
            .map(|u| match u {
                ExtendedKeyUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
            })
            .collect()
    }

    fn to_rcgen_san(entries: &[SanEntry]) -> Result<Vec<SanType>, X509Error> {
        entries
            .iter()
            .map(|entry| match entry {
                SanEntry::Dns(host) => host
                    .clone()
                    .try_into()
                    .map(SanType::DnsName)
                    .map_err(|e| X509Error::GenerationFailed(format!("invalid DNS SAN {host:?}: {e:?}"))),
                SanEntry::Ip(ip) => Ok(SanType::IpAddress(*ip)),
            })
            .collect()
    }

    fn dn_from_parsed(name: &x509_parser::x509::X509Name) -> DistinguishedName {
        use x509_parser::der_parser::oid::Oid;
        use x509_parser::oid_registry::{
            OID_X509_COMMON_NAME, OID_X509_COUNTRY_NAME, OID_X509_LOCALITY_NAME, OID_X509_ORGANIZATION_NAME,
            OID_X509_ORGANIZATIONAL_UNIT, OID_X509_STATE_OR_PROVINCE_NAME,
        };
        let attr = |oid: &Oid| {
            name.iter_by_oid(oid)
                .next()
                .and_then(|a| a.as_str().ok())
                .map(|s| s.to_string())
        };
        DistinguishedName {
            common_name: attr(&OID_X509_COMMON_NAME).unwrap_or_default(),
            organization: attr(&OID_X509_ORGANIZATION_NAME),
            organizational_unit: attr(&OID_X509_ORGANIZATIONAL_UNIT),
            locality: attr(&OID_X509_LOCALITY_NAME),
            state: attr(&OID_X509_STATE_OR_PROVINCE_NAME),
            country: attr(&OID_X509_COUNTRY_NAME),
        }
    }
}

impl X509Port for RcgenX509Adapter {
    fn generate_key_pair(&self, algorithm: KeyAlgorithm) -> Result<PrivateKey, X509Error> {
        match algorithm {
            KeyAlgorithm::EcdsaP256 => {
                let kp = RcgenKeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
                    .map_err(|e| X509Error::GenerationFailed(e.to_string()))?;
                Ok(PrivateKey {
                    algorithm,
                    pkcs8_der: kp.serialize_der(),
                })
            }
            KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa4096 => {
                let bits = if algorithm == KeyAlgorithm::Rsa4096 { 4096 } else { 2048 };
                let mut rng = rand::thread_rng();
                let key = rsa::RsaPrivateKey::new(&mut rng, bits)
                    .map_err(|e| X509Error::GenerationFailed(e.to_string()))?;
                let der = key
                    .to_pkcs8_der()
                    .map_err(|e| X509Error::GenerationFailed(e.to_string()))?;
                Ok(PrivateKey {
                    algorithm,
                    pkcs8_der: der.as_bytes().to_vec(),
                })
            }
        }
    }

    fn self_signed_ca(
        &self,
        subject: &DistinguishedName,
        key: &PrivateKey,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
        path_len_constraint: Option<u8>,
    ) -> Result<Certificate, X509Error> {
        let key_pair = Self::rcgen_key_pair(key)?;
        let mut params = CertificateParams::default();
        params.distinguished_name = Self::to_rcgen_dn(subject);
        params.is_ca = IsCa::Ca(match path_len_constraint {
            Some(len) => BasicConstraints::Constrained(len),
            None => BasicConstraints::Unconstrained,
        });
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = not_before;
        params.not_after = not_after;
        params.serial_number = Some(SerialNumber::from_slice(&Self::random_serial()));

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| X509Error::GenerationFailed(e.to_string()))?;

        Ok(Certificate {
            der: cert.der().to_vec(),
            pem: cert.pem(),
            subject: subject.clone(),
            issuer: subject.clone(),
            not_before,
            not_after,
            is_ca: true,
        })
    }

    fn issue_leaf(&self, req: &LeafRequest) -> Result<Certificate, X509Error> {
        let subject_key_pair = Self::rcgen_key_pair(req.subject_key)?;
        let issuer_key_pair = Self::rcgen_key_pair(req.issuer_key)?;
        let issuer_params = CertificateParams::from_ca_cert_der(&req.issuer_cert.der.as_slice().into())
            .map_err(|e| X509Error::InvalidKeyMaterial(e.to_string()))?;
        let issuer_cert = issuer_params
            .self_signed(&issuer_key_pair)
            .map_err(|e| X509Error::InvalidKeyMaterial(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = Self::to_rcgen_dn(&req.subject);
        params.is_ca = IsCa::NoCa;
        params.not_before = req.not_before;
        params.not_after = req.not_after;
        params.serial_number = Some(SerialNumber::from_slice(&req.serial));
        params.key_usages = Self::to_rcgen_key_usage(&req.key_usage);
        params.extended_key_usages = Self::to_rcgen_eku(&req.extended_key_usage);
        params.subject_alt_names = Self::to_rcgen_san(&req.subject_alt_names)?;

        let cert = params
            .signed_by(&subject_key_pair, &issuer_cert, &issuer_key_pair)
            .map_err(|e| X509Error::GenerationFailed(e.to_string()))?;

        Ok(Certificate {
            der: cert.der().to_vec(),
            pem: cert.pem(),
            subject: req.subject.clone(),
            issuer: req.issuer_cert.subject.clone(),
            not_before: req.not_before,
            not_after: req.not_after,
            is_ca: false,
        })
    }

    fn parse_certificate(&self, pem_or_der: &[u8]) -> Result<ParsedCertificate, X509Error> {
        let der = if pem_or_der.starts_with(b"-----BEGIN") {
            let (_, pem) = parse_x509_pem(pem_or_der).map_err(|e| X509Error::ParseFailed(e.to_string()))?;
            pem.contents
        } else {
            pem_or_der.to_vec()
        };
        let (_, cert) = X509Certificate::from_der(&der).map_err(|e| X509Error::ParseFailed(e.to_string()))?;

        let subject = Self::dn_from_parsed(cert.subject());
        let issuer = Self::dn_from_parsed(cert.issuer());
        let is_self_signed = cert.subject() == cert.issuer() && cert.verify_signature(None).is_ok();

        Ok(ParsedCertificate {
            der,
            subject,
            issuer,
            not_before: cert.validity().not_before.to_datetime(),
            not_after: cert.validity().not_after.to_datetime(),
            is_self_signed,
        })
    }

    fn is_signed_by(&self, subject: &ParsedCertificate, issuer: &ParsedCertificate) -> Result<bool, X509Error> {
        let (_, subject_cert) =
            X509Certificate::from_der(&subject.der).map_err(|e| X509Error::ParseFailed(e.to_string()))?;
        let (_, issuer_cert) =
            X509Certificate::from_der(&issuer.der).map_err(|e| X509Error::ParseFailed(e.to_string()))?;
        Ok(subject_cert.verify_signature(Some(issuer_cert.public_key())).is_ok())
    }

    fn public_key_matches(&self, key: &PrivateKey, certificate_der: &[u8]) -> Result<bool, X509Error> {
        use rcgen::PublicKeyData;
        let key_pair = Self::rcgen_key_pair(key)?;
        let (_, cert) =
            X509Certificate::from_der(certificate_der).map_err(|e| X509Error::ParseFailed(e.to_string()))?;
        let cert_public_key: &[u8] = cert.public_key().subject_public_key.as_ref();
        Ok(key_pair.raw_bytes() == cert_public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn self_signed_managed_ca_round_trips_through_parse() {
        let adapter = RcgenX509Adapter::new();
        let key = adapter.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let subject = DistinguishedName::managed_ca();
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + Duration::days(365 * 5);

        let ca = adapter
            .self_signed_ca(&subject, &key, not_before, not_after, Some(0))
            .unwrap();
        assert!(ca.is_ca);
        assert_eq!(ca.subject, subject);

        let parsed = adapter.parse_certificate(ca.pem.as_bytes()).unwrap();
        assert!(parsed.is_self_signed);
        assert_eq!(parsed.subject.common_name, "Greengrass Core CA");
    }

    #[test]
    fn leaf_issued_by_ca_verifies_against_ca_public_key() {
        let adapter = RcgenX509Adapter::new();
        let ca_key = adapter.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let subject = DistinguishedName::managed_ca();
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + Duration::days(365 * 5);
        let ca = adapter
            .self_signed_ca(&subject, &ca_key, not_before, not_after, Some(0))
            .unwrap();

        let leaf_key = adapter.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let leaf = adapter
            .issue_leaf(&LeafRequest {
                subject: DistinguishedName::with_common_name("core-device-1"),
                subject_key: &leaf_key,
                issuer_cert: &ca,
                issuer_key: &ca_key,
                not_before,
                not_after: not_before + Duration::days(7),
                serial: RcgenX509Adapter::random_serial(),
                key_usage: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
                extended_key_usage: vec![ExtendedKeyUsage::ClientAuth],
                subject_alt_names: vec![],
            })
            .unwrap();

        let parsed_leaf = adapter.parse_certificate(leaf.pem.as_bytes()).unwrap();
        let parsed_ca = adapter.parse_certificate(ca.pem.as_bytes()).unwrap();
        assert!(adapter.is_signed_by(&parsed_leaf, &parsed_ca).unwrap());
    }

    #[test]
    fn public_key_matches_the_key_that_signed_the_certificate() {
        let adapter = RcgenX509Adapter::new();
        let key = adapter.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let subject = DistinguishedName::managed_ca();
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + Duration::days(365);
        let ca = adapter.self_signed_ca(&subject, &key, not_before, not_after, Some(0)).unwrap();

        assert!(adapter.public_key_matches(&key, &ca.der).unwrap());
    }

    #[test]
    fn public_key_does_not_match_an_unrelated_key() {
        let adapter = RcgenX509Adapter::new();
        let key = adapter.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let other_key = adapter.generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let subject = DistinguishedName::managed_ca();
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + Duration::days(365);
        let ca = adapter.self_signed_ca(&subject, &key, not_before, not_after, Some(0)).unwrap();

        assert!(!adapter.public_key_matches(&other_key, &ca.der).unwrap());
    }
}
