//! Key and certificate helpers for ACME orders
//!
//! The CA only ever sees a CSR; the private key is generated here and
//! travels straight into the TLS secret. Renewal reuses the stored key and
//! reads the domain list back out of the issued certificate.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// CSR generation failed
    #[error("CSR generation failed: {0}")]
    CsrGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("parse error: {0}")]
    ParseError(String),
}

impl From<PkiError> for crate::Error {
    fn from(e: PkiError) -> Self {
        crate::Error::pki(e.to_string())
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// A CSR covering a set of domains plus the key that signed it
pub struct CertificateRequest {
    key_pem: String,
    csr_der: Vec<u8>,
}

impl CertificateRequest {
    /// Generate a fresh P-256 key and a CSR for `domains`
    pub fn new(domains: &[String]) -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate key: {e}")))?;
        Self::build(domains, key_pair)
    }

    /// Build a CSR for `domains` signed by an existing PEM key
    pub fn with_key(domains: &[String], key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse private key: {e}")))?;
        Self::build(domains, key_pair)
    }

    fn build(domains: &[String], key_pair: KeyPair) -> Result<Self> {
        if domains.is_empty() {
            return Err(PkiError::CsrGenerationFailed(
                "at least one domain is required".to_string(),
            ));
        }

        let mut params = CertificateParams::new(domains.to_vec())
            .map_err(|e| PkiError::CsrGenerationFailed(format!("invalid domain: {e}")))?;
        // Let's Encrypt ignores the subject; the SANs carry the names
        params.distinguished_name = DistinguishedName::new();

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| PkiError::CsrGenerationFailed(format!("failed to create CSR: {e}")))?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            csr_der: csr.der().to_vec(),
        })
    }

    /// DER-encoded CSR for order finalization
    pub fn csr_der(&self) -> &[u8] {
        &self.csr_der
    }

    /// Private key in PEM format
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

fn with_leaf<T>(cert_pem: &[u8], f: impl FnOnce(&X509Certificate<'_>) -> Result<T>) -> Result<T> {
    let (_, pem) = parse_x509_pem(cert_pem)
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {e}")))?;
    let (_, cert) = parse_x509_certificate(&pem.contents)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {e}")))?;
    f(&cert)
}

/// DNS names a certificate covers, read from the leaf of a PEM bundle
///
/// Falls back to the subject common name when there is no SAN extension.
pub fn certificate_domains(cert_pem: &[u8]) -> Result<Vec<String>> {
    with_leaf(cert_pem, |cert| {
        let san = cert
            .subject_alternative_name()
            .map_err(|e| PkiError::ParseError(format!("bad SAN extension: {e}")))?;

        let mut domains: Vec<String> = san
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(dns.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        if domains.is_empty() {
            if let Some(cn) = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
            {
                domains.push(cn.to_string());
            }
        }

        if domains.is_empty() {
            return Err(PkiError::ParseError(
                "certificate names no domains".to_string(),
            ));
        }
        Ok(domains)
    })
}

/// Expiry of the leaf certificate in a PEM bundle
pub fn not_after(cert_pem: &[u8]) -> Result<SystemTime> {
    with_leaf(cert_pem, |cert| {
        let ts = cert.validity().not_after.timestamp();
        let secs = u64::try_from(ts)
            .map_err(|_| PkiError::ParseError(format!("notAfter before epoch: {ts}")))?;
        Ok(UNIX_EPOCH + Duration::from_secs(secs))
    })
}

/// Validity left at `now`; zero once expired
pub fn remaining_validity(cert_pem: &[u8], now: SystemTime) -> Result<Duration> {
    let expiry = not_after(cert_pem)?;
    Ok(expiry.duration_since(now).unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-01T00:00:00Z
    const JAN_1_2024: u64 = 1_704_067_200;
    const DAY: u64 = 24 * 3600;

    /// Certificate valid from 2024-01-01 to 2024-04-01 (91 days)
    fn self_signed(domains: &[&str]) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(domains.iter().map(|d| d.to_string()).collect::<Vec<_>>())
                .unwrap();
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2024, 4, 1);
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn fresh_request_carries_key_and_csr() {
        let request = CertificateRequest::new(&["a.com".to_string()]).unwrap();
        assert!(!request.csr_der().is_empty());
        assert!(request.private_key_pem().contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn request_reuses_existing_key() {
        let (_, key_pem) = self_signed(&["a.com"]);
        let request = CertificateRequest::with_key(&["a.com".to_string()], &key_pem).unwrap();
        assert_eq!(request.private_key_pem(), key_pem);
    }

    #[test]
    fn empty_domain_list_is_rejected() {
        assert!(matches!(
            CertificateRequest::new(&[]),
            Err(PkiError::CsrGenerationFailed(_))
        ));
    }

    #[test]
    fn domains_are_read_from_sans() {
        let (cert, _) = self_signed(&["a.com", "www.a.com"]);
        assert_eq!(
            certificate_domains(cert.as_bytes()).unwrap(),
            vec!["a.com", "www.a.com"]
        );
    }

    #[test]
    fn remaining_validity_tracks_not_after() {
        let (cert, _) = self_signed(&["a.com"]);
        let start = UNIX_EPOCH + Duration::from_secs(JAN_1_2024);
        assert_eq!(
            remaining_validity(cert.as_bytes(), start).unwrap(),
            Duration::from_secs(91 * DAY)
        );

        let later = start + Duration::from_secs(365 * DAY);
        assert_eq!(remaining_validity(cert.as_bytes(), later).unwrap(), Duration::ZERO);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            not_after(b"not a certificate"),
            Err(PkiError::ParseError(_))
        ));
        let err: crate::Error = PkiError::ParseError("x".into()).into();
        assert!(matches!(err, crate::Error::Pki(_)));
    }
}
