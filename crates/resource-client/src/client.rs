//! Kubernetes-backed resource client
//!
//! Implements [`ResourceClientTrait`] on top of `kube::Api`. The API server
//! provides the create and update semantics the trait documents: duplicate
//! creates return 409 AlreadyExists and stale `resourceVersion`s return 409
//! Conflict.

use crate::error::ResourceError;
use crate::resource_trait::ResourceClientTrait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use std::path::Path;
use tracing::debug;

/// Resource client bound to a single cluster
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl std::fmt::Debug for KubeResourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeResourceClient").finish_non_exhaustive()
    }
}

impl KubeResourceClient {
    /// Wrap an existing kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from an admin kubeconfig file on disk
    ///
    /// # Arguments
    /// * `path` - Path to the kubeconfig written by the control plane
    pub async fn from_kubeconfig(path: &Path) -> Result<Self, ResourceError> {
        debug!(path = %path.display(), "Loading kubeconfig");

        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| ResourceError::Config(format!("{}: {}", path.display(), e)))?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ResourceError::Config(format!("{}: {}", path.display(), e)))?;
        let client = Client::try_from(config)?;

        Ok(Self::new(client))
    }

    /// Access the underlying kube client
    pub fn kube_client(&self) -> &Client {
        &self.client
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

/// Extract the namespace and name addressing a namespaced object
pub(crate) fn namespaced_ref<'a>(kind: &str, meta: &'a ObjectMeta) -> Result<(&'a str, &'a str), ResourceError> {
    let name = meta.name.as_deref()
        .ok_or_else(|| ResourceError::InvalidObject(format!("{} missing metadata.name", kind)))?;
    let namespace = meta.namespace.as_deref()
        .ok_or_else(|| ResourceError::InvalidObject(format!("{} {} missing metadata.namespace", kind, name)))?;
    Ok((namespace, name))
}

/// Extract the name addressing a cluster-scoped object
pub(crate) fn cluster_ref<'a>(kind: &str, meta: &'a ObjectMeta) -> Result<&'a str, ResourceError> {
    meta.name.as_deref()
        .ok_or_else(|| ResourceError::InvalidObject(format!("{} missing metadata.name", kind)))
}

#[async_trait::async_trait]
impl ResourceClientTrait for KubeResourceClient {
    async fn get_node(&self, name: &str) -> Result<Node, ResourceError> {
        Ok(self.nodes().get(name).await?)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ResourceError> {
        Ok(self.nodes().list(&ListParams::default()).await?.items)
    }

    async fn update_node(&self, node: &Node) -> Result<Node, ResourceError> {
        let name = cluster_ref("Node", &node.metadata)?;
        Ok(self.nodes().replace(name, &PostParams::default(), node).await?)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ResourceError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ResourceError> {
        let (namespace, _) = namespaced_ref("ConfigMap", &config_map.metadata)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), config_map).await?)
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ResourceError> {
        let (namespace, name) = namespaced_ref("ConfigMap", &config_map.metadata)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.replace(name, &PostParams::default(), config_map).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ResourceError> {
        let (namespace, _) = namespaced_ref("Secret", &secret.metadata)?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), secret).await?)
    }

    async fn list_services(&self) -> Result<Vec<Service>, ResourceError> {
        let api: Api<Service> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Endpoints, ResourceError> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, ResourceError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, ResourceError> {
        let (namespace, _) = namespaced_ref("Lease", &lease.metadata)?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), lease).await?)
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease, ResourceError> {
        let (namespace, name) = namespaced_ref("Lease", &lease.metadata)?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.replace(name, &PostParams::default(), lease).await?)
    }
}
