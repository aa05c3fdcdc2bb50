//! Mock ResourceClient for unit testing
//!
//! This module provides an in-memory implementation of `ResourceClientTrait`
//! that honours the same create/update contract as the API server, plus
//! call counters and failure injection for exercising retry paths.

mod store;

use crate::error::ResourceError;
use crate::resource_trait::ResourceClientTrait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Secret, Service};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use store::{ObjectStore, VersionClock};

/// Number of calls made to each mock operation
#[derive(Debug, Default)]
pub struct CallCounts {
    pub get_node: AtomicUsize,
    pub update_node: AtomicUsize,
    pub get_config_map: AtomicUsize,
    pub create_config_map: AtomicUsize,
    pub update_config_map: AtomicUsize,
    pub create_secret: AtomicUsize,
    pub update_lease: AtomicUsize,
}

#[derive(Debug, Default)]
struct InjectedFailures {
    node_updates: AtomicUsize,
    config_map_creates: AtomicUsize,
    endpoints_gets: AtomicUsize,
    lease_holder: Mutex<Option<String>>,
}

/// Take one injected failure if any remain
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug)]
struct Inner {
    nodes: ObjectStore<Node>,
    config_maps: ObjectStore<ConfigMap>,
    secrets: ObjectStore<Secret>,
    services: ObjectStore<Service>,
    endpoints: ObjectStore<Endpoints>,
    leases: ObjectStore<Lease>,
    calls: CallCounts,
    failures: InjectedFailures,
}

/// Mock ResourceClient for testing
///
/// Clones share the same backing store, so one mock can stand in for the
/// cluster seen by several replicas.
#[derive(Debug, Clone)]
pub struct MockResourceClient {
    inner: Arc<Inner>,
}

impl Default for MockResourceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockResourceClient {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        let clock = VersionClock::default();
        Self {
            inner: Arc::new(Inner {
                nodes: ObjectStore::new("Node", clock.clone()),
                config_maps: ObjectStore::new("ConfigMap", clock.clone()),
                secrets: ObjectStore::new("Secret", clock.clone()),
                services: ObjectStore::new("Service", clock.clone()),
                endpoints: ObjectStore::new("Endpoints", clock.clone()),
                leases: ObjectStore::new("Lease", clock),
                calls: CallCounts::default(),
                failures: InjectedFailures::default(),
            }),
        }
    }

    /// Add a node (for test setup)
    pub fn add_node(&self, node: Node) {
        self.inner.nodes.put(node);
    }

    /// Add a config map (for test setup)
    pub fn add_config_map(&self, config_map: ConfigMap) {
        self.inner.config_maps.put(config_map);
    }

    /// Add a service (for test setup)
    pub fn add_service(&self, service: Service) {
        self.inner.services.put(service);
    }

    /// Add an endpoints object (for test setup)
    pub fn add_endpoints(&self, endpoints: Endpoints) {
        self.inner.endpoints.put(endpoints);
    }

    /// Add a lease (for test setup)
    pub fn add_lease(&self, lease: Lease) {
        self.inner.leases.put(lease);
    }

    /// Make the next `count` node updates fail with a conflict
    pub fn fail_node_updates(&self, count: usize) {
        self.inner.failures.node_updates.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` config map creates fail as if the store were not writable
    pub fn fail_config_map_creates(&self, count: usize) {
        self.inner.failures.config_map_creates.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` endpoints reads fail with a transport-style error
    pub fn fail_endpoints_gets(&self, count: usize) {
        self.inner.failures.endpoints_gets.store(count, Ordering::SeqCst);
    }

    /// Reject every lease update that names `holder` as holder, until cleared with `None`
    pub fn fail_lease_updates_by(&self, holder: Option<&str>) {
        *self.inner.failures.lease_holder.lock().unwrap_or_else(PoisonError::into_inner) =
            holder.map(str::to_string);
    }

    /// Call counters
    pub fn calls(&self) -> &CallCounts {
        &self.inner.calls
    }

    /// Number of config maps stored
    pub fn config_map_count(&self) -> usize {
        self.inner.config_maps.len()
    }

    /// All secrets stored
    pub fn secrets(&self) -> Vec<Secret> {
        self.inner.secrets.list()
    }

    /// Number of leases stored
    pub fn lease_count(&self) -> usize {
        self.inner.leases.len()
    }
}

#[async_trait::async_trait]
impl ResourceClientTrait for MockResourceClient {
    async fn get_node(&self, name: &str) -> Result<Node, ResourceError> {
        self.inner.calls.get_node.fetch_add(1, Ordering::SeqCst);
        self.inner.nodes.get("", name)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ResourceError> {
        Ok(self.inner.nodes.list())
    }

    async fn update_node(&self, node: &Node) -> Result<Node, ResourceError> {
        self.inner.calls.update_node.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.inner.failures.node_updates) {
            return Err(ResourceError::Conflict("injected node update conflict".to_string()));
        }
        self.inner.nodes.update(node)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ResourceError> {
        self.inner.calls.get_config_map.fetch_add(1, Ordering::SeqCst);
        self.inner.config_maps.get(namespace, name)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ResourceError> {
        self.inner.calls.create_config_map.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.inner.failures.config_map_creates) {
            return Err(ResourceError::Config("injected: storage not writable".to_string()));
        }
        self.inner.config_maps.create(config_map)
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ResourceError> {
        self.inner.calls.update_config_map.fetch_add(1, Ordering::SeqCst);
        self.inner.config_maps.update(config_map)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ResourceError> {
        self.inner.calls.create_secret.fetch_add(1, Ordering::SeqCst);
        self.inner.secrets.create(secret)
    }

    async fn list_services(&self) -> Result<Vec<Service>, ResourceError> {
        Ok(self.inner.services.list())
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Endpoints, ResourceError> {
        if take_failure(&self.inner.failures.endpoints_gets) {
            return Err(ResourceError::Config("injected: endpoints unavailable".to_string()));
        }
        self.inner.endpoints.get(namespace, name)
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, ResourceError> {
        self.inner.leases.get(namespace, name)
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, ResourceError> {
        self.inner.leases.create(lease)
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease, ResourceError> {
        self.inner.calls.update_lease.fetch_add(1, Ordering::SeqCst);
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        let failing = self.inner.failures.lease_holder.lock().unwrap_or_else(PoisonError::into_inner);
        if holder.is_some() && failing.as_deref() == holder {
            return Err(ResourceError::Config("injected: lease update rejected".to_string()));
        }
        drop(failing);
        self.inner.leases.update(lease)
    }
}
