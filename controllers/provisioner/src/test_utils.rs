//! Test utilities for unit testing the provisioner
//!
//! Fixtures for cluster objects plus fakes for the control plane runtime,
//! the client factory and the node identity.

use crate::config::{fill_server_config, ServerConfig, Settings};
use crate::error::{FatalReporter, ProvisionError};
use crate::orchestrator::ClientFactory;
use crate::readiness::{readiness_channel, ReadinessTrigger};
use crate::retry::RetryPolicy;
use crate::runtime::{ControlPlane, RuntimeHandle};
use crate::tasks::node_hosts::COREDNS_CONFIG_MAP;
use crate::tasks::{NodeIdentity, SYSTEM_NAMESPACE};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Node, NodeAddress,
    NodeStatus, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use resource_client::{MockResourceClient, ResourceClientTrait};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Short interval for paused-clock tests
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::fixed(Duration::from_millis(100))
}

/// Server configuration as `fill_server_config` produces it, rooted at `dir`
pub fn test_server_config(dir: &Path) -> ServerConfig {
    let settings = Settings {
        data_dir: dir.join("data").to_string_lossy().into_owned(),
        ..Default::default()
    };
    let mut config = ServerConfig::default();
    fill_server_config(&mut config, &settings).unwrap();
    config
}

/// Helper to create a test Node, optionally with an InternalIP
pub fn create_test_node(name: &str, labels: BTreeMap<String, String>, internal_ip: Option<&str>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: if labels.is_empty() { None } else { Some(labels) },
            ..Default::default()
        },
        status: internal_ip.map(|ip| NodeStatus {
            addresses: Some(vec![NodeAddress {
                address: ip.to_string(),
                type_: "InternalIP".to_string(),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Helper to create the packaged CoreDNS ConfigMap
pub fn create_coredns_config_map() -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(COREDNS_CONFIG_MAP.to_string()),
            namespace: Some(SYSTEM_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some([("Corefile".to_string(), ".:53 { hosts /etc/coredns/NodeHosts }".to_string())].into()),
        ..Default::default()
    }
}

/// Helper to create `default/kubernetes` Endpoints
pub fn create_test_endpoints(ips: &[&str], port: i32) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some("kubernetes".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: (*ip).to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                name: Some("https".to_string()),
                port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

/// Helper to create a Service of the given type
pub fn create_test_service(name: &str, type_: &str, ports: &[i32]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(SYSTEM_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            ports: Some(
                ports.iter()
                    .map(|port| ServicePort {
                        port: *port,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Node identity that tests can set and clear
#[derive(Debug, Clone, Default)]
pub struct SettableIdentity(Arc<Mutex<Option<String>>>);

impl SettableIdentity {
    pub fn new(name: Option<&str>) -> Self {
        Self(Arc::new(Mutex::new(name.map(str::to_string))))
    }

    pub fn set(&self, name: Option<&str>) {
        *self.0.lock().unwrap() = name.map(str::to_string);
    }
}

impl NodeIdentity for SettableIdentity {
    fn node_name(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Control plane that starts instantly and becomes ready on demand
pub struct FakeControlPlane {
    server_token: String,
    data_dir: PathBuf,
    fail_start: bool,
    trigger: Mutex<Option<ReadinessTrigger>>,
    pub starts: AtomicUsize,
}

impl FakeControlPlane {
    pub fn new(server_token: &str, data_dir: &Path) -> Self {
        Self {
            server_token: server_token.to_string(),
            data_dir: data_dir.to_path_buf(),
            fail_start: false,
            trigger: Mutex::new(None),
            starts: AtomicUsize::new(0),
        }
    }

    pub fn failing(data_dir: &Path) -> Self {
        Self {
            fail_start: true,
            ..Self::new("token", data_dir)
        }
    }

    /// Fire the readiness signal of the last start
    pub fn fire_ready(&self) {
        if let Some(trigger) = self.trigger.lock().unwrap().take() {
            trigger.fire();
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn start(
        &self,
        _config: &ServerConfig,
        _cancel: CancellationToken,
        _fatal: FatalReporter,
    ) -> Result<RuntimeHandle, ProvisionError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(ProvisionError::Runtime("starting kubernetes: injected failure".to_string()));
        }

        let (trigger, ready) = readiness_channel();
        *self.trigger.lock().unwrap() = Some(trigger);
        Ok(RuntimeHandle {
            ready,
            kubeconfig_admin: self.data_dir.join("admin.kubeconfig"),
            server_token: self.server_token.clone(),
            server_ca: self.data_dir.join("server-ca.crt"),
            node_passwd_file: self.data_dir.join("node-passwd"),
        })
    }
}

/// Client factory handing out a shared mock
#[derive(Debug, Default)]
pub struct MockClientFactory {
    pub client: MockResourceClient,
    pub builds: AtomicUsize,
}

impl MockClientFactory {
    pub fn new(client: MockResourceClient) -> Self {
        Self {
            client,
            builds: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn build(&self, _kubeconfig: &Path) -> Result<Arc<dyn ResourceClientTrait>, ProvisionError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.client.clone()))
    }
}
