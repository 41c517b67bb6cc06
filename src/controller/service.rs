//! Service reconcilers

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument};

use crate::acme::{AcmeDirectory, InstantAcmeDirectory};
use crate::annotations;
use crate::issuer::{IssuerConfig, Mode, Orchestrator, Outcome};
use crate::kube_client::{KubeClient, KubeClientImpl};
use crate::{Error, RATE_LIMIT_REQUEUE, RENEWAL_INTERVAL};

/// Controller context shared across reconciles
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .issuer_config(config)
///     .build();
/// ```
pub struct Context {
    /// Issuance and renewal state machine
    pub orchestrator: Orchestrator,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context around an already assembled orchestrator
    pub fn with_orchestrator(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        acme: Arc<dyn AcmeDirectory>,
        config: IssuerConfig,
    ) -> Self {
        Self {
            orchestrator: Orchestrator::new(kube, acme, config),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    acme: Option<Arc<dyn AcmeDirectory>>,
    config: IssuerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            acme: None,
            config: IssuerConfig::default(),
        }
    }

    /// Override the orchestrator tuning
    pub fn issuer_config(mut self, config: IssuerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the ACME directory
    pub fn acme_directory(mut self, acme: Arc<dyn AcmeDirectory>) -> Self {
        self.acme = Some(acme);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let acme = self
            .acme
            .unwrap_or_else(|| Arc::new(InstantAcmeDirectory::default()));
        Context {
            orchestrator: Orchestrator::new(kube, acme, self.config),
        }
    }
}

async fn run(mode: Mode, service: &Service, ctx: &Context) -> Result<Outcome, Error> {
    let namespace = service
        .namespace()
        .ok_or_else(|| Error::validation("service has no namespace"))?;
    ctx.orchestrator
        .run(mode, &namespace, &service.name_any())
        .await
}

/// Reconcile a Service's certificate
///
/// One entry point serves both triggers: `inject: "true"` issues and
/// `inject: "done"` renews. Both modes must go through this one controller;
/// the runtime serializes reconciles per Service only within a controller.
#[instrument(skip(service, ctx), fields(service = %service.name_any()))]
pub async fn reconcile(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action, Error> {
    let mode = if annotations::issuance_requested(&service.metadata) {
        info!("issuing certificate");
        Mode::Issue
    } else if annotations::renewal_requested(&service.metadata) {
        debug!("checking renewal");
        Mode::Renew
    } else {
        return Ok(Action::await_change());
    };

    let outcome = run(mode, &service, &ctx).await?;
    Ok(action_for(mode, outcome))
}

/// Requeue decision for a finished run
fn action_for(mode: Mode, outcome: Outcome) -> Action {
    match (mode, outcome) {
        (_, Outcome::RateLimited) => Action::requeue(RATE_LIMIT_REQUEUE),
        (_, Outcome::RenewalNotDue(wait)) => Action::requeue(wait),
        (Mode::Renew, Outcome::Persisted) => {
            info!("certificate renewed");
            Action::requeue(RENEWAL_INTERVAL)
        }
        (Mode::Issue, Outcome::Persisted) | (_, Outcome::NotRequired) => Action::await_change(),
    }
}

/// Requeue failed reconciles after a short delay
pub fn error_policy(service: Arc<Service>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        service = %service.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
