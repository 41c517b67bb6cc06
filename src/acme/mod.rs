//! ACME collaborator boundary
//!
//! The orchestrator talks to a CA only through [`AcmeDirectory`] and
//! [`AcmeSession`]. [`instant::InstantAcmeDirectory`] is the production
//! implementation.

pub mod instant;

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::challenge::ChallengeProvider;
use crate::Result;

pub use instant::InstantAcmeDirectory;

/// Certificate chain plus the private key it was issued for, both PEM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateArtifact {
    /// Full chain, leaf first
    pub certificate: Vec<u8>,
    /// Private key of the leaf
    pub private_key: Vec<u8>,
}

/// Serialized ACME account credentials
///
/// Opaque to everything but the directory that produced it. It embeds the
/// account's P-256 private key, so whoever holds it controls the account.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountKey(Vec<u8>);

impl AccountKey {
    /// Wrap stored credential bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Credential bytes for storage
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccountKey(<redacted>)")
    }
}

/// Factory for authenticated ACME sessions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AcmeDirectory: Send + Sync {
    /// Register a new account, generating its key
    async fn register(&self, email: &str, ca_url: &str)
        -> Result<(Box<dyn AcmeSession>, AccountKey)>;

    /// Open a session for an existing account
    async fn resolve_account_by_key(
        &self,
        key: &AccountKey,
        ca_url: &str,
    ) -> Result<Box<dyn AcmeSession>>;
}

/// An authenticated account able to place orders
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AcmeSession: Send + Sync {
    /// Install the HTTP-01 provider used by later orders
    fn set_challenge_provider(&mut self, provider: Arc<dyn ChallengeProvider>);

    /// Order one certificate covering every domain
    async fn obtain(&self, domains: &[String]) -> Result<CertificateArtifact>;

    /// Re-issue an existing certificate for the same domains
    async fn renew(&self, current: &CertificateArtifact) -> Result<CertificateArtifact>;
}
