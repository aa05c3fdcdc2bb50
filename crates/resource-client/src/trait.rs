//! ResourceClient trait for mocking
//!
//! This trait abstracts the cluster object client so reconciliation tasks can
//! be unit tested against an in-memory store.

use crate::error::ResourceError;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Secret, Service};

/// Typed get/create/update operations on the objects the provisioner touches.
///
/// Namespaced objects are addressed by namespace and name; `Node` is
/// cluster-scoped. Creates and updates take the namespace and name from the
/// object metadata.
///
/// Contract expected from every implementation:
/// - `get_*` returns [`ResourceError::NotFound`] when the object is absent.
/// - `create_*` is atomic: of several concurrent creates for the same name at
///   most one succeeds, the rest fail with [`ResourceError::AlreadyExists`].
/// - `update_*` is optimistic: when `metadata.resourceVersion` no longer
///   matches the stored object the update fails with [`ResourceError::Conflict`].
///
/// All methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ResourceClientTrait: Send + Sync {
    // Nodes
    async fn get_node(&self, name: &str) -> Result<Node, ResourceError>;
    async fn list_nodes(&self) -> Result<Vec<Node>, ResourceError>;
    async fn update_node(&self, node: &Node) -> Result<Node, ResourceError>;

    // ConfigMaps
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ResourceError>;
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ResourceError>;
    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ResourceError>;

    // Secrets
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ResourceError>;

    // Services and Endpoints
    async fn list_services(&self) -> Result<Vec<Service>, ResourceError>;
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Endpoints, ResourceError>;

    // Leases
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, ResourceError>;
    async fn create_lease(&self, lease: &Lease) -> Result<Lease, ResourceError>;
    async fn update_lease(&self, lease: &Lease) -> Result<Lease, ResourceError>;
}
