//! End-to-end certificate flow against an in-memory cluster and CA
//!
//! The fake CA validates HTTP-01 the way a real one would from the outside:
//! it reads the resolver pod the router created and asks the resolver
//! server for the token while the Service points at it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, Pod, PodSpec, PodTemplateSpec, Secret, Service, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::core::admission::{AdmissionRequest, AdmissionReview};
use kube::ResourceExt;
use rcgen::{CertificateParams, KeyPair};
use tower::ServiceExt;

use cert_injector::acme::{AccountKey, AcmeDirectory, AcmeSession, CertificateArtifact};
use cert_injector::annotations;
use cert_injector::challenge::resolver::{resolver_router, ResolverConfig};
use cert_injector::challenge::router::{RouterConfig, SOLVER_LABEL};
use cert_injector::challenge::{solve_with, Challenge, ChallengeProvider, WELL_KNOWN_PREFIX};
use cert_injector::controller::{reconcile, Context};
use cert_injector::issuer::account::ACCOUNT_SECRET;
use cert_injector::issuer::{IssuerConfig, Mode, Orchestrator, Outcome};
use cert_injector::kube_client::KubeClient;
use cert_injector::materializer::{TLS_CERT_KEY, TLS_SECRET_TYPE};
use cert_injector::webhook::deployment::{mutate_deployment, CERT_VOLUME};
use cert_injector::{pki, Error, Result};

const NS: &str = "default";

// =============================================================================
// In-memory cluster
// =============================================================================

#[derive(Default)]
struct State {
    services: BTreeMap<String, Service>,
    secrets: BTreeMap<String, Secret>,
    deployments: BTreeMap<String, Deployment>,
    pods: BTreeMap<String, Pod>,
    next_pod: u32,
}

#[derive(Default)]
struct FakeCluster {
    state: Mutex<State>,
    /// Certificate orders placed with the CA
    orders: AtomicUsize,
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

impl FakeCluster {
    fn service(&self, name: &str) -> Service {
        self.state.lock().unwrap().services[name].clone()
    }

    fn secret(&self, name: &str) -> Option<Secret> {
        self.state.lock().unwrap().secrets.get(name).cloned()
    }

    fn deployment(&self, name: &str) -> Deployment {
        self.state.lock().unwrap().deployments[name].clone()
    }

    fn pods(&self) -> Vec<Pod> {
        self.state.lock().unwrap().pods.values().cloned().collect()
    }
}

#[async_trait]
impl KubeClient for FakeCluster {
    async fn get_service(&self, _namespace: &str, name: &str) -> Result<Service> {
        let state = self.state.lock().unwrap();
        state.services.get(name).cloned().ok_or_else(|| Error::not_exist(name))
    }

    async fn replace_service(&self, service: &Service) -> Result<Service> {
        let mut state = self.state.lock().unwrap();
        state.services.insert(service.name_any(), service.clone());
        Ok(service.clone())
    }

    async fn get_secret(&self, _namespace: &str, name: &str) -> Result<Secret> {
        let state = self.state.lock().unwrap();
        state.secrets.get(name).cloned().ok_or_else(|| Error::not_exist(name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let mut state = self.state.lock().unwrap();
        let name = secret.name_any();
        if state.secrets.contains_key(&name) {
            return Err(Error::already_exists(name));
        }
        state.secrets.insert(name, secret.clone());
        Ok(secret.clone())
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret> {
        let mut state = self.state.lock().unwrap();
        let name = secret.name_any();
        if state.secrets.get(&name).and_then(|s| s.immutable) == Some(true) {
            return Err(Error::validation(format!("secret {name} is immutable")));
        }
        state.secrets.insert(name, secret.clone());
        Ok(secret.clone())
    }

    async fn get_deployment(&self, _namespace: &str, name: &str) -> Result<Deployment> {
        let state = self.state.lock().unwrap();
        state.deployments.get(name).cloned().ok_or_else(|| Error::not_exist(name))
    }

    async fn list_deployments(&self, _namespace: &str, label_selector: &str) -> Result<Vec<Deployment>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .deployments
            .values()
            .filter(|d| matches_selector(d.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let mut state = self.state.lock().unwrap();
        state.deployments.insert(deployment.name_any(), deployment.clone());
        Ok(deployment.clone())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let mut state = self.state.lock().unwrap();
        state.next_pod += 1;
        let mut pod = pod.clone();
        pod.metadata.name = Some(format!(
            "{}{:05}",
            pod.metadata.generate_name.clone().unwrap_or_default(),
            state.next_pod
        ));
        state.pods.insert(pod.name_any(), pod.clone());
        Ok(pod)
    }

    async fn list_pods(&self, _namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .values()
            .filter(|p| matches_selector(p.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pods.remove(name).map(|_| ()).ok_or_else(|| Error::not_exist(name))
    }
}

// =============================================================================
// In-memory CA
// =============================================================================

struct FakeCa {
    cluster: Arc<FakeCluster>,
    rate_limited: bool,
}

#[async_trait]
impl AcmeDirectory for FakeCa {
    async fn register(&self, _email: &str, _ca_url: &str) -> Result<(Box<dyn AcmeSession>, AccountKey)> {
        Ok((self.session(), AccountKey::from_bytes(b"{\"id\":\"acct-1\"}".to_vec())))
    }

    async fn resolve_account_by_key(&self, _key: &AccountKey, _ca_url: &str) -> Result<Box<dyn AcmeSession>> {
        Ok(self.session())
    }
}

impl FakeCa {
    fn session(&self) -> Box<dyn AcmeSession> {
        Box::new(FakeSession {
            cluster: self.cluster.clone(),
            provider: None,
            rate_limited: self.rate_limited,
        })
    }
}

struct FakeSession {
    cluster: Arc<FakeCluster>,
    provider: Option<Arc<dyn ChallengeProvider>>,
    rate_limited: bool,
}

/// Ask the resolver described by a pod's environment for the token
async fn validate_through_resolver(cluster: &FakeCluster, challenge: &Challenge) -> Result<()> {
    let service = cluster.service("web");
    let selector = service.spec.and_then(|s| s.selector).unwrap_or_default();
    if !selector.contains_key(SOLVER_LABEL) {
        return Err(Error::acme("service does not route to a resolver"));
    }

    let pods = cluster.pods();
    let pod = pods
        .first()
        .ok_or_else(|| Error::acme("no resolver pod"))?;
    let env: BTreeMap<String, String> = pod.spec.as_ref().unwrap().containers[0]
        .env
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|e| (e.name, e.value.unwrap_or_default()))
        .collect();

    let resolver = resolver_router(Arc::new(ResolverConfig {
        domain: env["DOMAIN_NAME"].clone(),
        token: env["TOKEN"].clone(),
        key_authorization: env["AUTH_KEY"].clone(),
    }));
    let response = resolver
        .oneshot(
            Request::get(format!("{WELL_KNOWN_PREFIX}/{}", challenge.token))
                .header("host", format!("{}:80", challenge.domain))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    if response.status() != StatusCode::OK {
        return Err(Error::acme(format!("validation got {}", response.status())));
    }
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    if body.as_ref() != challenge.key_authorization.as_bytes() {
        return Err(Error::acme("key authorization mismatch"));
    }
    Ok(())
}

#[async_trait]
impl AcmeSession for FakeSession {
    fn set_challenge_provider(&mut self, provider: Arc<dyn ChallengeProvider>) {
        self.provider = Some(provider);
    }

    async fn obtain(&self, domains: &[String]) -> Result<CertificateArtifact> {
        self.cluster.orders.fetch_add(1, Ordering::SeqCst);
        if self.rate_limited {
            return Err(Error::acme(
                "urn:ietf:params:acme:error:rateLimited: too many certificates already issued",
            ));
        }
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| Error::acme("no challenge provider"))?;

        for (i, domain) in domains.iter().enumerate() {
            let challenge = Challenge {
                domain: domain.clone(),
                token: format!("token-{i}"),
                key_authorization: format!("token-{i}.thumbprint"),
            };
            solve_with(provider.as_ref(), &challenge, || {
                validate_through_resolver(&self.cluster, &challenge)
            })
            .await?;
        }

        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(domains.to_vec())
            .unwrap()
            .self_signed(&key)
            .unwrap();
        Ok(CertificateArtifact {
            certificate: cert.pem().into_bytes(),
            private_key: key.serialize_pem().into_bytes(),
        })
    }

    async fn renew(&self, current: &CertificateArtifact) -> Result<CertificateArtifact> {
        let domains = pki::certificate_domains(&current.certificate)?;
        self.obtain(&domains).await
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), "web".to_string())])
}

fn seeded_cluster() -> Arc<FakeCluster> {
    let cluster = FakeCluster::default();
    {
        let mut state = cluster.state.lock().unwrap();
        state.services.insert(
            "web".to_string(),
            Service {
                metadata: ObjectMeta {
                    name: Some("web".to_string()),
                    namespace: Some(NS.to_string()),
                    annotations: Some(BTreeMap::from([
                        (annotations::INJECT.to_string(), "true".to_string()),
                        (annotations::AUTO_INJECT.to_string(), "true".to_string()),
                        (annotations::DOMAINS.to_string(), "a.example.com,b.example.com".to_string()),
                        (annotations::EMAIL.to_string(), "ops@example.com".to_string()),
                    ])),
                    ..Default::default()
                },
                spec: Some(ServiceSpec {
                    selector: Some(labels()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        state.deployments.insert(
            "web".to_string(),
            Deployment {
                metadata: ObjectMeta {
                    name: Some("web".to_string()),
                    namespace: Some(NS.to_string()),
                    labels: Some(labels()),
                    ..Default::default()
                },
                spec: Some(DeploymentSpec {
                    selector: LabelSelector {
                        match_labels: Some(labels()),
                        ..Default::default()
                    },
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(labels()),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            containers: vec![Container {
                                name: "app".to_string(),
                                image: Some("web:v1".to_string()),
                                ..Default::default()
                            }],
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
    }
    Arc::new(cluster)
}

fn orchestrator(cluster: &Arc<FakeCluster>, rate_limited: bool) -> Orchestrator {
    let config = IssuerConfig {
        router: RouterConfig {
            propagation_wait: Duration::ZERO,
            ..Default::default()
        },
        pre_obtain_wait: Duration::ZERO,
        ..Default::default()
    };
    Orchestrator::new(
        cluster.clone(),
        Arc::new(FakeCa {
            cluster: cluster.clone(),
            rate_limited,
        }),
        config,
    )
}

fn admission_request(deployment: &Deployment) -> AdmissionRequest<DynamicObject> {
    let review = serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "e2e-uid",
            "kind": { "group": "apps", "version": "v1", "kind": "Deployment" },
            "resource": { "group": "apps", "version": "v1", "resource": "deployments" },
            "name": deployment.name_any(),
            "namespace": NS,
            "operation": "UPDATE",
            "userInfo": {},
            "object": deployment,
            "dryRun": false
        }
    });
    let review: AdmissionReview<DynamicObject> = serde_json::from_value(review).unwrap();
    review.try_into().unwrap()
}

// =============================================================================
// Story Tests
// =============================================================================

/// Story: an annotated Service ends with a certificate mounted into its Deployment
#[tokio::test]
async fn story_annotated_service_gets_certificate_mounted() {
    let cluster = seeded_cluster();
    let original_service = cluster.service("web");

    let outcome = orchestrator(&cluster, false)
        .run(Mode::Issue, NS, "web")
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Persisted);

    // Account persisted immutably
    let account = cluster.secret(ACCOUNT_SECRET).expect("account secret");
    assert_eq!(account.immutable, Some(true));

    // Certificate covers every requested domain
    let tls = cluster.secret("web-tls").expect("tls secret");
    assert_eq!(tls.type_.as_deref(), Some(TLS_SECRET_TYPE));
    let cert = &tls.data.as_ref().unwrap()[TLS_CERT_KEY].0;
    let mut domains = pki::certificate_domains(cert).unwrap();
    domains.sort();
    assert_eq!(domains, vec!["a.example.com", "b.example.com"]);

    // Routing restored, resolvers gone, trigger flipped to renewal
    let service = cluster.service("web");
    assert_eq!(service.spec, original_service.spec);
    assert_eq!(
        annotations::get(&service.metadata, annotations::INJECT),
        Some(annotations::CHALLENGE_COMPLETE)
    );
    assert!(cluster.pods().is_empty());

    // Deployment flagged, and the webhook mounts the secret
    let deployment = cluster.deployment("web");
    assert!(annotations::is_enabled(&deployment.metadata, annotations::MOUNT));
    assert_eq!(
        annotations::get(&deployment.metadata, annotations::CERT_NAME),
        Some("web-tls")
    );

    let response = mutate_deployment(&admission_request(&deployment));
    assert!(response.allowed);
    let patch: json_patch::Patch = serde_json::from_slice(response.patch.as_ref().unwrap()).unwrap();
    let mut doc = serde_json::to_value(&deployment).unwrap();
    json_patch::patch(&mut doc, &patch).unwrap();
    assert_eq!(
        doc["spec"]["template"]["spec"]["volumes"][0],
        serde_json::json!({
            "name": CERT_VOLUME,
            "secret": { "secretName": "web-tls", "optional": true }
        })
    );
}

/// Story: the renewal pass leaves a fresh certificate alone
#[tokio::test]
async fn story_fresh_certificate_is_left_until_due() {
    let cluster = seeded_cluster();
    let orchestrator = orchestrator(&cluster, false);

    orchestrator.run(Mode::Issue, NS, "web").await.unwrap();
    let issued = cluster.secret("web-tls").unwrap();

    let outcome = orchestrator.run(Mode::Renew, NS, "web").await.unwrap();
    assert!(matches!(outcome, Outcome::RenewalNotDue(wait) if wait > Duration::ZERO));
    assert_eq!(cluster.secret("web-tls").unwrap().data, issued.data);

    // The issuance trigger no longer fires once the Service is marked done
    let outcome = orchestrator.run(Mode::Issue, NS, "web").await.unwrap();
    assert_eq!(outcome, Outcome::NotRequired);
}

/// Story: a throttled CA leaves no certificate and no stray resolver behind
#[tokio::test]
async fn story_rate_limited_issuance_leaves_cluster_clean() {
    let cluster = seeded_cluster();
    let original_service = cluster.service("web");

    let outcome = orchestrator(&cluster, true)
        .run(Mode::Issue, NS, "web")
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::RateLimited);

    assert!(cluster.secret("web-tls").is_none());
    assert!(cluster.pods().is_empty());
    assert_eq!(cluster.service("web"), original_service);
}

/// Story: the watch events that follow an issuance lead to exactly one order
///
/// Clean-up flips the trigger to `done` before the certificate is stored, so
/// the controller sees both the stale `true` Service and the fresh `done` one.
#[tokio::test]
async fn story_controller_places_one_order_per_issuance() {
    let cluster = seeded_cluster();
    let ctx = Arc::new(Context::with_orchestrator(orchestrator(&cluster, false)));
    let stale = Arc::new(cluster.service("web"));

    let action = reconcile(stale.clone(), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(cluster.secret("web-tls").is_some());

    // Renewal trigger as redelivered by the watcher
    let updated = Arc::new(cluster.service("web"));
    assert!(annotations::renewal_requested(&updated.metadata));
    let action = reconcile(updated, ctx.clone()).await.unwrap();
    assert_ne!(action, Action::await_change());

    // A stale issuance event re-reads the Service and finds nothing to do
    let action = reconcile(stale, ctx).await.unwrap();
    assert_eq!(action, Action::await_change());

    assert_eq!(cluster.orders.load(Ordering::SeqCst), 1);
    assert!(cluster.pods().is_empty());
}
