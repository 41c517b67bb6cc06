//! Annotation contract
//!
//! All control state lives in annotations on the user's own Service and
//! Deployment objects; there is no custom resource. The keys below are a
//! versioned contract with users and must not change meaning.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{Error, Result};

/// Service: `"true"` requests first issuance, `"done"` marks a finished challenge cycle
pub const INJECT: &str = "cert.injector.ko/inject";
/// Service: `"true"` lets the materializer flag the target Deployment
pub const AUTO_INJECT: &str = "cert.injector.ko/auto-inject";
/// Service: ACME account contact
pub const EMAIL: &str = "cert.injector.ko/email";
/// Service: ACME directory URL
pub const CA_URL: &str = "cert.injector.ko/ca-url";
/// Service: comma-separated domain list
pub const DOMAINS: &str = "cert.injector.ko/domains";
/// Service: explicit name of the Deployment to flag for injection
pub const DEPLOYMENT: &str = "cert.injector.ko/deployment";

/// Deployment: `"true"` requests a certificate mount at admission time
pub const MOUNT: &str = "cert.injector.ko/mount";
/// Deployment: name of the TLS secret to mount
pub const CERT_NAME: &str = "cert.injector.ko/cert-name";

/// Value that switches a boolean annotation on
pub const ENABLED: &str = "true";
/// Value of [`INJECT`] once a challenge cycle has completed
pub const CHALLENGE_COMPLETE: &str = "done";

/// Contact used when the Service names none
pub const DEFAULT_EMAIL: &str = "your@email.local";
/// Directory used when the Service names none (Let's Encrypt staging)
pub const DEFAULT_CA_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Read a single annotation
pub fn get<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// True when the annotation is present and equals [`ENABLED`]
pub fn is_enabled(meta: &ObjectMeta, key: &str) -> bool {
    get(meta, key) == Some(ENABLED)
}

/// Set an annotation, creating the map if needed
pub fn set(meta: &mut ObjectMeta, key: &str, value: impl Into<String>) {
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.into());
}

/// Issuance trigger on a Service
pub fn issuance_requested(meta: &ObjectMeta) -> bool {
    is_enabled(meta, INJECT)
}

/// Renewal trigger on a Service: a previous challenge cycle completed
pub fn renewal_requested(meta: &ObjectMeta) -> bool {
    get(meta, INJECT) == Some(CHALLENGE_COMPLETE)
}

/// Record that a challenge cycle finished for this Service
pub fn mark_challenge_complete(meta: &mut ObjectMeta) {
    set(meta, INJECT, CHALLENGE_COMPLETE);
}

/// ACME contact, defaulting to [`DEFAULT_EMAIL`]
pub fn email(meta: &ObjectMeta) -> String {
    get(meta, EMAIL).unwrap_or(DEFAULT_EMAIL).to_string()
}

/// ACME directory URL, defaulting to [`DEFAULT_CA_URL`]
pub fn ca_url(meta: &ObjectMeta) -> String {
    get(meta, CA_URL).unwrap_or(DEFAULT_CA_URL).to_string()
}

/// Domains to certify
///
/// Entries are trimmed and empty entries dropped. A missing annotation or an
/// annotation with no usable entry is [`Error::NotFound`].
pub fn domains(meta: &ObjectMeta) -> Result<Vec<String>> {
    let raw = get(meta, DOMAINS).ok_or_else(|| Error::not_found(DOMAINS))?;
    let domains: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(String::from)
        .collect();
    if domains.is_empty() {
        return Err(Error::not_found(DOMAINS));
    }
    Ok(domains)
}

/// Explicitly named Deployment, if any
pub fn deployment_name(meta: &ObjectMeta) -> Option<&str> {
    get(meta, DEPLOYMENT).filter(|name| !name.is_empty())
}

/// Name of the TLS secret holding a Service's certificate
pub fn tls_secret_name(service_name: &str) -> String {
    format!("{service_name}-tls")
}

/// Flag a Deployment for admission-time injection of `secret_name`
pub fn mark_for_injection(meta: &mut ObjectMeta, secret_name: &str) {
    set(meta, MOUNT, ENABLED);
    set(meta, CERT_NAME, secret_name);
}
