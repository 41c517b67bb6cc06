//! Certificate Orchestrator
//!
//! One state machine serves both issuance and renewal:
//!
//! ```text
//! NotRequired -> AccountReady -> ChallengeRegistered -> ObtainedOrRenewed -> Persisted
//! ```
//!
//! The trigger check runs before any network or key work. Throttling by the
//! CA ends the flow without an error so the caller can back off for a week.

pub mod account;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::acme::{AcmeDirectory, CertificateArtifact};
use crate::annotations;
use crate::challenge::router::{RouterConfig, ServiceRouter};
use crate::kube_client::KubeClient;
use crate::materializer::Materializer;
use crate::{pki, Result, DEFAULT_PRE_OBTAIN_WAIT, RENEW_BEFORE};

/// Which trigger a reconcile answers to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// First issuance, triggered by `inject: "true"`
    Issue,
    /// Renewal, triggered by `inject: "done"`
    Renew,
}

/// Orchestrator states, logged as they are reached
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Trigger absent; nothing to do
    NotRequired,
    /// Account session open
    AccountReady,
    /// Challenge router installed
    ChallengeRegistered,
    /// Certificate in hand
    ObtainedOrRenewed,
    /// Secret written and Deployment flagged
    Persisted,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::NotRequired => "NotRequired",
            State::AccountReady => "AccountReady",
            State::ChallengeRegistered => "ChallengeRegistered",
            State::ObtainedOrRenewed => "ObtainedOrRenewed",
            State::Persisted => "Persisted",
        };
        f.write_str(s)
    }
}

/// How a run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Certificate stored
    Persisted,
    /// Trigger absent
    NotRequired,
    /// CA throttled the account or order
    RateLimited,
    /// Current certificate is still fresh; check again after this long
    RenewalNotDue(Duration),
}

/// Orchestrator tuning
#[derive(Clone, Debug)]
pub struct IssuerConfig {
    /// Challenge router settings
    pub router: RouterConfig,
    /// Wait before an order is placed
    pub pre_obtain_wait: Duration,
    /// Renew once less than this much validity remains
    pub renew_before: Duration,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            pre_obtain_wait: DEFAULT_PRE_OBTAIN_WAIT,
            renew_before: RENEW_BEFORE,
        }
    }
}

/// Drives one Service through issuance or renewal
pub struct Orchestrator {
    client: Arc<dyn KubeClient>,
    acme: Arc<dyn AcmeDirectory>,
    materializer: Materializer,
    config: IssuerConfig,
}

impl Orchestrator {
    /// Create an orchestrator
    pub fn new(client: Arc<dyn KubeClient>, acme: Arc<dyn AcmeDirectory>, config: IssuerConfig) -> Self {
        Self {
            materializer: Materializer::new(client.clone()),
            client,
            acme,
            config,
        }
    }

    /// Run the state machine for `namespace/name`
    ///
    /// `NotRequired` and throttling are outcomes, not errors.
    pub async fn run(&self, mode: Mode, namespace: &str, name: &str) -> Result<Outcome> {
        match self.drive(mode, namespace, name).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_not_required() => Ok(Outcome::NotRequired),
            Err(e) if e.is_rate_limited() => {
                warn!(namespace, service = name, error = %e, "rate limited by CA");
                Ok(Outcome::RateLimited)
            }
            Err(e) => Err(e),
        }
    }

    async fn drive(&self, mode: Mode, namespace: &str, name: &str) -> Result<Outcome> {
        let service = match self.client.get_service(namespace, name).await {
            Ok(service) => service,
            Err(e) if e.is_not_exist() => return Ok(Outcome::NotRequired),
            Err(e) => return Err(e),
        };

        let triggered = match mode {
            Mode::Issue => annotations::issuance_requested(&service.metadata),
            Mode::Renew => annotations::renewal_requested(&service.metadata),
        };
        if !triggered {
            debug!(namespace, service = name, ?mode, state = %State::NotRequired, "no trigger");
            return Ok(Outcome::NotRequired);
        }

        let current = match mode {
            Mode::Issue => None,
            Mode::Renew => self.current_certificate(namespace, name).await?,
        };
        let current = match current {
            Some(current) => match self.renewal_check(&current) {
                Renewal::NotDue(wait) => {
                    info!(namespace, service = name, wait_secs = wait.as_secs(), "renewal not due");
                    // A flag lost to a failed Deployment write is restored here
                    self.materializer
                        .inject_cert_into_deployment(namespace, name)
                        .await?;
                    return Ok(Outcome::RenewalNotDue(wait));
                }
                Renewal::Due => Some(current),
                Renewal::Unreadable => None,
            },
            None => None,
        };
        let domains = match current {
            Some(_) => Vec::new(),
            None => annotations::domains(&service.metadata)?,
        };

        let email = annotations::email(&service.metadata);
        let ca_url = annotations::ca_url(&service.metadata);
        let mut session =
            account::resolve_session(&*self.client, &*self.acme, namespace, &email, &ca_url).await?;
        info!(namespace, service = name, state = %State::AccountReady, %ca_url);

        session.set_challenge_provider(Arc::new(ServiceRouter::new(
            self.client.clone(),
            namespace,
            name,
            self.config.router.clone(),
        )));
        info!(namespace, service = name, state = %State::ChallengeRegistered);

        if !self.config.pre_obtain_wait.is_zero() {
            tokio::time::sleep(self.config.pre_obtain_wait).await;
        }
        let artifact = match &current {
            Some(current) => session.renew(current).await?,
            None => session.obtain(&domains).await?,
        };
        info!(namespace, service = name, state = %State::ObtainedOrRenewed);

        self.materializer
            .create_or_update_secret(namespace, name, &artifact)
            .await?;
        self.materializer
            .inject_cert_into_deployment(namespace, name)
            .await?;
        info!(namespace, service = name, state = %State::Persisted);

        Ok(Outcome::Persisted)
    }

    /// Existing certificate for a renewal; `None` falls back to issuance
    async fn current_certificate(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CertificateArtifact>> {
        match self.materializer.read_certificate(namespace, name).await {
            Ok(artifact) => Ok(Some(artifact)),
            Err(e) if e.is_not_exist() => {
                info!(namespace, service = name, "no certificate to renew, issuing a new one");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn renewal_check(&self, current: &CertificateArtifact) -> Renewal {
        match pki::remaining_validity(&current.certificate, SystemTime::now()) {
            Ok(left) if left > self.config.renew_before => {
                Renewal::NotDue(left - self.config.renew_before)
            }
            Ok(_) => Renewal::Due,
            Err(e) => {
                warn!(error = %e, "unreadable certificate, issuing a new one");
                Renewal::Unreadable
            }
        }
    }
}

/// Where a stored certificate stands against the renewal window
enum Renewal {
    /// Still fresh; the window opens after this long
    NotDue(Duration),
    Due,
    /// Cannot be parsed, so it cannot be renewed in place
    Unreadable,
}
