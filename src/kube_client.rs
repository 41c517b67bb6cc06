//! Kubernetes API store boundary
//!
//! Every read and write the injector performs goes through [`KubeClient`], so
//! the orchestration logic can be exercised against mocks. The real
//! implementation classifies API errors into the crate taxonomy: a 404 becomes
//! [`Error::NotExist`] and a 409 `AlreadyExists` on create becomes
//! [`Error::AlreadyExists`]. Update conflicts (409 `Conflict`) stay
//! [`Error::Kube`] and abort the caller.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Trait abstracting the Kubernetes operations the injector needs
///
/// Replace operations send the object's `resourceVersion`, so a concurrent
/// writer makes them fail instead of being silently overwritten.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, Error>;

    /// Replace a Service (optimistic concurrency on `resourceVersion`)
    async fn replace_service(&self, service: &Service) -> Result<Service, Error>;

    /// Fetch a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error>;

    /// Create a Secret
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, Error>;

    /// Replace a Secret
    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, Error>;

    /// Fetch a Deployment
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, Error>;

    /// List Deployments matching a label selector
    async fn list_deployments(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Deployment>, Error>;

    /// Replace a Deployment
    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error>;

    /// Create a Pod
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// List Pods matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error>;

    /// Delete a Pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Render a selector map as a Kubernetes label selector (`k1=v1,k2=v2`)
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Map a kube error for the named object onto the crate taxonomy
pub fn classify(err: kube::Error, name: &str) -> Error {
    match err {
        kube::Error::Api(ref resp) if resp.code == 404 => Error::not_exist(name),
        kube::Error::Api(ref resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::already_exists(name)
        }
        other => Error::Kube(other),
    }
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn replace<K>(&self, obj: &K) -> Result<K, Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let name = obj.name_any();
        let namespace = obj
            .namespace()
            .ok_or_else(|| Error::validation(format!("{name} has no namespace")))?;
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &name))
    }

    async fn create<K>(&self, obj: &K) -> Result<K, Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let name = obj
            .meta()
            .name
            .clone()
            .or_else(|| obj.meta().generate_name.clone())
            .unwrap_or_default();
        let namespace = obj
            .namespace()
            .ok_or_else(|| Error::validation(format!("{name} has no namespace")))?;
        self.api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &name))
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, Error> {
        self.api::<Service>(namespace)
            .get(name)
            .await
            .map_err(|e| classify(e, name))
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, Error> {
        self.replace(service).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error> {
        self.api::<Secret>(namespace)
            .get(name)
            .await
            .map_err(|e| classify(e, name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        self.create(secret).await
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        self.replace(secret).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, Error> {
        self.api::<Deployment>(namespace)
            .get(name)
            .await
            .map_err(|e| classify(e, name))
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Deployment>, Error> {
        let list = self
            .api::<Deployment>(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        debug!(namespace, label_selector, count = list.items.len(), "listed deployments");
        Ok(list.items)
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        self.replace(deployment).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        self.create(pod).await
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        let list = self
            .api::<Pod>(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        debug!(namespace, label_selector, count = list.items.len(), "listed pods");
        Ok(list.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.api::<Pod>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify(e, name))?;
        Ok(())
    }
}
