//! HTTP-01 challenge handling
//!
//! A [`ChallengeProvider`] makes a key authorization reachable at
//! `http://<domain>/.well-known/acme-challenge/<token>` and takes it down
//! again. [`solve_with`] brackets a validation between the two calls so the
//! routing change is always undone, whatever happens in between.
//!
//! - [`router`] - the provider that retargets a Service at a resolver pod
//! - [`resolver`] - the HTTP endpoint running inside that pod

pub mod resolver;
pub mod router;

use std::future::Future;

use async_trait::async_trait;
use tracing::error;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Path prefix ACME validators request
pub const WELL_KNOWN_PREFIX: &str = "/.well-known/acme-challenge";

/// One HTTP-01 challenge to answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    /// Domain being validated
    pub domain: String,
    /// Token from the ACME server, last path segment of the validation URL
    pub token: String,
    /// Expected response body
    pub key_authorization: String,
}

/// Publishes and withdraws HTTP-01 challenge responses
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChallengeProvider: Send + Sync {
    /// Make the response reachable before returning
    async fn present(&self, challenge: &Challenge) -> Result<()>;

    /// Withdraw the response and restore prior routing
    ///
    /// Must succeed when called after a failed or partial `present`, and when
    /// called twice.
    async fn clean_up(&self, challenge: &Challenge) -> Result<()>;
}

/// Run `validate` while `challenge` is presented
///
/// `clean_up` runs on every exit path, including a failed `present`. A
/// clean-up failure is returned even when validation succeeded. When both
/// fail, the validation error wins and the clean-up error is logged.
pub async fn solve_with<F, Fut, T>(
    provider: &dyn ChallengeProvider,
    challenge: &Challenge,
    validate: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let outcome = match provider.present(challenge).await {
        Ok(()) => validate().await,
        Err(e) => Err(e),
    };

    match (outcome, provider.clean_up(challenge).await) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup)) => Err(cleanup),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => {
            error!(
                domain = %challenge.domain,
                error = %cleanup,
                "challenge clean-up failed after an earlier failure"
            );
            Err(e)
        }
    }
}
