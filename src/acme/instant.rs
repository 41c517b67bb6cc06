//! ACME client built on `instant-acme`
//!
//! One order per request covers every domain. Authorizations are solved one
//! at a time: present, tell the CA the challenge is ready, poll until the
//! authorization settles, clean up. Only one resolver pod ever backs the
//! Service.

use std::sync::Arc;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use tracing::{debug, info, warn};

use super::{AccountKey, AcmeDirectory, AcmeSession, CertificateArtifact};
use crate::challenge::{solve_with, Challenge, ChallengeProvider};
use crate::pki::{self, CertificateRequest};
use crate::retry::{retry_with_backoff, Backoff, RetryConfig};
use crate::{Error, Result};

/// Wrap an `instant-acme` error, keeping the problem type in the message
///
/// Debug formatting carries `urn:ietf:params:acme:error:rateLimited`, which
/// [`Error::acme`] classifies as throttling.
fn acme_err(context: &'static str) -> impl Fn(instant_acme::Error) -> Error {
    move |e| Error::acme(format!("{context}: {e:?}"))
}

/// [`AcmeDirectory`] backed by `instant-acme`
#[derive(Clone, Debug)]
pub struct InstantAcmeDirectory {
    polling: RetryConfig,
}

impl Default for InstantAcmeDirectory {
    fn default() -> Self {
        Self {
            polling: RetryConfig::acme_polling(),
        }
    }
}

impl InstantAcmeDirectory {
    /// Directory with a custom polling budget
    pub fn with_polling(polling: RetryConfig) -> Self {
        Self { polling }
    }
}

fn parse_credentials(document: serde_json::Value) -> Result<AccountCredentials> {
    serde_json::from_value(document)
        .map_err(|e| Error::serialization(format!("invalid account credentials: {e}")))
}

#[async_trait]
impl AcmeDirectory for InstantAcmeDirectory {
    async fn register(
        &self,
        email: &str,
        ca_url: &str,
    ) -> Result<(Box<dyn AcmeSession>, AccountKey)> {
        let contact = format!("mailto:{email}");
        let new_account = NewAccount {
            contact: &[contact.as_str()],
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) = Account::create(&new_account, ca_url, None)
            .await
            .map_err(acme_err("account registration"))?;
        info!(ca_url, account = %account.id(), "registered acme account");

        let key = serde_json::to_vec(&credentials)
            .map_err(|e| Error::serialization(format!("account credentials: {e}")))?;

        let session = InstantAcmeSession::new(account, self.polling.clone());
        Ok((Box::new(session), AccountKey::from_bytes(key)))
    }

    async fn resolve_account_by_key(
        &self,
        key: &AccountKey,
        ca_url: &str,
    ) -> Result<Box<dyn AcmeSession>> {
        let document: serde_json::Value = serde_json::from_slice(key.as_bytes())
            .map_err(|e| Error::serialization(format!("invalid account credentials: {e}")))?;
        parse_credentials(document.clone())?;

        if let Some(registered) = document.get("directory").and_then(|d| d.as_str()) {
            if registered != ca_url {
                warn!(
                    registered,
                    requested = ca_url,
                    "stored account belongs to a different directory, using it anyway"
                );
            }
        }

        // Restoring only fetches the directory, so transient failures are retried
        let account = retry_with_backoff(
            &RetryConfig::with_max_attempts(3),
            "acme account restore",
            || {
                let document = document.clone();
                async move {
                    Account::from_credentials(parse_credentials(document)?)
                        .await
                        .map_err(acme_err("account restore"))
                }
            },
        )
        .await?;
        debug!(account = %account.id(), "restored acme account");

        Ok(Box::new(InstantAcmeSession::new(account, self.polling.clone())))
    }
}

/// [`AcmeSession`] for one `instant-acme` account
pub struct InstantAcmeSession {
    account: Account,
    provider: Option<Arc<dyn ChallengeProvider>>,
    polling: RetryConfig,
}

impl InstantAcmeSession {
    fn new(account: Account, polling: RetryConfig) -> Self {
        Self {
            account,
            provider: None,
            polling,
        }
    }

    fn provider(&self) -> Result<&dyn ChallengeProvider> {
        self.provider
            .as_deref()
            .ok_or_else(|| Error::acme("no HTTP-01 challenge provider installed"))
    }

    /// Place an order for `domains` and drive it to a certificate
    async fn issue(&self, domains: &[String], request: CertificateRequest) -> Result<CertificateArtifact> {
        let provider = self.provider()?;
        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();

        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(acme_err("new order"))?;
        debug!(?domains, "order placed");

        self.authorize(&mut order, provider).await?;
        self.await_ready(&mut order).await?;

        order
            .finalize(request.csr_der())
            .await
            .map_err(acme_err("finalize"))?;

        let chain = self.await_certificate(&mut order).await?;
        info!(?domains, "certificate issued");

        Ok(CertificateArtifact {
            certificate: chain.into_bytes(),
            private_key: request.private_key_pem().as_bytes().to_vec(),
        })
    }

    async fn authorize(&self, order: &mut Order, provider: &dyn ChallengeProvider) -> Result<()> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(acme_err("fetch authorizations"))?;

        for auth in authorizations {
            #[allow(irrefutable_let_patterns)]
            let Identifier::Dns(domain) = &auth.identifier
            else {
                return Err(Error::acme("unsupported identifier type"));
            };
            let domain = domain.clone();

            match &auth.status {
                AuthorizationStatus::Valid => {
                    debug!(domain = %domain, "authorization already valid");
                    continue;
                }
                AuthorizationStatus::Pending => {}
                other => {
                    return Err(Error::acme(format!("authorization for {domain} is {other:?}")));
                }
            }

            let http01 = auth
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| Error::acme(format!("no HTTP-01 challenge offered for {domain}")))?;

            let challenge = Challenge {
                domain: domain.clone(),
                token: http01.token.clone(),
                key_authorization: order.key_authorization(http01).as_str().to_string(),
            };
            let url = http01.url.clone();
            let polling = &self.polling;
            let order = &mut *order;

            solve_with(provider, &challenge, move || async move {
                order
                    .set_challenge_ready(&url)
                    .await
                    .map_err(acme_err("set challenge ready"))?;
                await_authorization(order, &domain, polling).await
            })
            .await?;
        }
        Ok(())
    }

    async fn await_ready(&self, order: &mut Order) -> Result<()> {
        let mut backoff = Backoff::new(&self.polling);
        loop {
            let state = order.refresh().await.map_err(acme_err("refresh order"))?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(Error::acme(format!("order invalid: {:?}", state.error)));
                }
                OrderStatus::Pending | OrderStatus::Processing => {}
            }
            if !backoff.wait("order ready").await {
                return Err(Error::acme("timed out waiting for order to become ready"));
            }
        }
    }

    async fn await_certificate(&self, order: &mut Order) -> Result<String> {
        let mut backoff = Backoff::new(&self.polling);
        loop {
            if let Some(chain) = order
                .certificate()
                .await
                .map_err(acme_err("download certificate"))?
            {
                return Ok(chain);
            }
            if !backoff.wait("certificate download").await {
                return Err(Error::acme("timed out waiting for certificate"));
            }
        }
    }
}

/// Poll until the authorization for `domain` leaves `pending`
async fn await_authorization(order: &mut Order, domain: &str, polling: &RetryConfig) -> Result<()> {
    let mut backoff = Backoff::new(polling);
    loop {
        let authorizations = order
            .authorizations()
            .await
            .map_err(acme_err("poll authorization"))?;
        let auth = authorizations
            .iter()
            .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == domain))
            .ok_or_else(|| Error::acme(format!("authorization for {domain} disappeared")))?;

        match &auth.status {
            AuthorizationStatus::Valid => {
                info!(domain, "authorization valid");
                return Ok(());
            }
            AuthorizationStatus::Pending => {}
            other => {
                let problems: Vec<_> = auth.challenges.iter().filter_map(|c| c.error.as_ref()).collect();
                return Err(Error::acme(format!(
                    "authorization for {domain} is {other:?}: {problems:?}"
                )));
            }
        }

        if !backoff.wait("authorization").await {
            return Err(Error::acme(format!("timed out validating {domain}")));
        }
    }
}

#[async_trait]
impl AcmeSession for InstantAcmeSession {
    fn set_challenge_provider(&mut self, provider: Arc<dyn ChallengeProvider>) {
        self.provider = Some(provider);
    }

    async fn obtain(&self, domains: &[String]) -> Result<CertificateArtifact> {
        let request = CertificateRequest::new(domains)?;
        self.issue(domains, request).await
    }

    async fn renew(&self, current: &CertificateArtifact) -> Result<CertificateArtifact> {
        let domains = pki::certificate_domains(&current.certificate)?;
        let key_pem = std::str::from_utf8(&current.private_key)
            .map_err(|e| Error::pki(format!("private key is not PEM text: {e}")))?;
        let request = CertificateRequest::with_key(&domains, key_pem)?;
        debug!(?domains, "renewing with existing key");
        self.issue(&domains, request).await
    }
}
