//! Challenge Router
//!
//! Answers HTTP-01 by steering a Service's live traffic to a transient
//! resolver pod. `present` adds a marker key to the Service selector and
//! starts a pod carrying that marker; the application's own pods stop
//! matching, so validation requests reach the resolver. `clean_up` deletes the
//! pod and drops the marker again, leaving the selector exactly as it was.
//!
//! The Service write uses the stored `resourceVersion`: a concurrent writer
//! makes the update fail and the whole cycle abort.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, Pod, PodSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::{Challenge, ChallengeProvider};
use crate::kube_client::{label_selector, KubeClient};
use crate::{annotations, Error, Result, DEFAULT_PROPAGATION_WAIT, DEFAULT_RESOLVER_PORT};

/// Selector key that steers a Service at the resolver pod
pub const SOLVER_LABEL: &str = "acmesolver";
/// Value paired with [`SOLVER_LABEL`]
pub const SOLVER_LABEL_VALUE: &str = "true";
/// `generateName` prefix of resolver pods
pub const RESOLVER_POD_PREFIX: &str = "acmeresolver-";
/// Name of the resolver container
pub const RESOLVER_CONTAINER: &str = "acmeresolver";
/// Image used unless `RESOLVER_CUSTOM_IMAGE` names another
pub const DEFAULT_RESOLVER_IMAGE: &str = "yotsyni/acmeresolver:latest";

/// Subcommand the resolver image is started with
const RESOLVER_SUBCOMMAND: &str = "resolver";

const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
const COMPONENT_VALUE: &str = "acme-resolver";

/// Router tuning
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Resolver container image
    pub resolver_image: String,
    /// Time given to endpoints and load balancers to converge after `present`
    pub propagation_wait: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            resolver_image: DEFAULT_RESOLVER_IMAGE.to_string(),
            propagation_wait: DEFAULT_PROPAGATION_WAIT,
        }
    }
}

/// [`ChallengeProvider`] that retargets one Service
pub struct ServiceRouter {
    client: Arc<dyn KubeClient>,
    namespace: String,
    service: String,
    config: RouterConfig,
}

impl ServiceRouter {
    /// Router for the Service `namespace/service`
    pub fn new(
        client: Arc<dyn KubeClient>,
        namespace: impl Into<String>,
        service: impl Into<String>,
        config: RouterConfig,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            service: service.into(),
            config,
        }
    }

    fn resolver_pod(&self, selector: &BTreeMap<String, String>, port: i32, challenge: &Challenge) -> Pod {
        // The pod must match every selector key, so an existing component label wins
        let mut labels = selector.clone();
        labels
            .entry(COMPONENT_LABEL.to_string())
            .or_insert_with(|| COMPONENT_VALUE.to_string());

        let env = [
            ("DOMAIN_NAME", challenge.domain.clone()),
            ("TOKEN", challenge.token.clone()),
            ("AUTH_KEY", challenge.key_authorization.clone()),
            ("PORT", port.to_string()),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        })
        .collect();

        Pod {
            metadata: ObjectMeta {
                generate_name: Some(RESOLVER_POD_PREFIX.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Always".to_string()),
                containers: vec![Container {
                    name: RESOLVER_CONTAINER.to_string(),
                    image: Some(self.config.resolver_image.clone()),
                    args: Some(vec![RESOLVER_SUBCOMMAND.to_string()]),
                    env: Some(env),
                    ports: Some(vec![ContainerPort {
                        container_port: port,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Port the Service forwards to, so the resolver listens where traffic lands
///
/// Named target ports cannot be resolved without the backing pods and fall
/// back to the resolver default.
fn target_port(service: &Service) -> i32 {
    let Some(port) = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|p| p.first())
    else {
        return i32::from(DEFAULT_RESOLVER_PORT);
    };

    match &port.target_port {
        Some(IntOrString::Int(n)) => *n,
        Some(IntOrString::String(_)) => i32::from(DEFAULT_RESOLVER_PORT),
        None => port.port,
    }
}

fn selector_of(service: &Service) -> Option<&BTreeMap<String, String>> {
    service.spec.as_ref().and_then(|s| s.selector.as_ref())
}

fn with_marker(selector: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut marked = selector.clone();
    marked.insert(SOLVER_LABEL.to_string(), SOLVER_LABEL_VALUE.to_string());
    marked
}

#[async_trait]
impl ChallengeProvider for ServiceRouter {
    async fn present(&self, challenge: &Challenge) -> Result<()> {
        let mut service = self.client.get_service(&self.namespace, &self.service).await?;

        let selector = selector_of(&service)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::validation(format!("service {} has no selector to retarget", self.service))
            })?;
        let marked = with_marker(selector);
        let port = target_port(&service);

        if let Some(spec) = service.spec.as_mut() {
            spec.selector = Some(marked.clone());
        }
        self.client.replace_service(&service).await?;
        debug!(service = %self.service, domain = %challenge.domain, "service selector retargeted");

        let pod = self.resolver_pod(&marked, port, challenge);
        let created = self.client.create_pod(&pod).await?;
        info!(
            service = %self.service,
            domain = %challenge.domain,
            pod = %created.name_any(),
            "resolver pod created"
        );

        if !self.config.propagation_wait.is_zero() {
            debug!(wait_secs = self.config.propagation_wait.as_secs(), "waiting for endpoints to converge");
            tokio::time::sleep(self.config.propagation_wait).await;
        }
        Ok(())
    }

    async fn clean_up(&self, challenge: &Challenge) -> Result<()> {
        let service = self.client.get_service(&self.namespace, &self.service).await?;
        let selector = selector_of(&service).cloned().unwrap_or_default();

        let pods = self
            .client
            .list_pods(&self.namespace, &label_selector(&with_marker(&selector)))
            .await?;
        if pods.len() > 1 {
            warn!(service = %self.service, count = pods.len(), "more than one resolver pod found");
        }
        for pod in &pods {
            match self.client.delete_pod(&self.namespace, &pod.name_any()).await {
                Ok(()) => debug!(pod = %pod.name_any(), "resolver pod deleted"),
                Err(e) if e.is_not_exist() => {}
                Err(e) => return Err(e),
            }
        }

        // Re-read: the Service may have moved on while pods were deleted
        let mut service = self.client.get_service(&self.namespace, &self.service).await?;
        let mut changed = false;
        if let Some(selector) = service.spec.as_mut().and_then(|s| s.selector.as_mut()) {
            changed |= selector.remove(SOLVER_LABEL).is_some();
        }
        if !annotations::renewal_requested(&service.metadata) {
            annotations::mark_challenge_complete(&mut service.metadata);
            changed = true;
        }
        if changed {
            self.client.replace_service(&service).await?;
        }

        info!(service = %self.service, domain = %challenge.domain, "service routing restored");
        Ok(())
    }
}
