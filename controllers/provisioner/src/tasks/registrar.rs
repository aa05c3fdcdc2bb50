//! Core registrations
//!
//! Runs once per process after the always-run controllers have started and
//! before leader election: node registration, API address registration and,
//! in rootless mode, service port registration. There is no retry here; the
//! first failure is returned wrapped with the step that failed.

use crate::config::ServerConfig;
use crate::error::ProvisionError;
use crate::tasks::{node_hosts, upsert_config_map_data, SYSTEM_NAMESPACE};
use k8s_openapi::api::core::v1::Endpoints;
use resource_client::{ResourceClientTrait, ResourceError};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

/// Namespace of the built-in API server Endpoints
const DEFAULT_NAMESPACE: &str = "default";
/// Name of the built-in API server Endpoints
const KUBERNETES_ENDPOINTS: &str = "kubernetes";

/// Key of the API address list
pub const API_ADDRESSES_KEY: &str = "addresses";
/// Key of the rootless port document
pub const ROOTLESS_PORTS_KEY: &str = "ports.json";

/// Inputs of the registrations, taken from the server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrarSettings {
    /// Prefix of the ConfigMap names
    pub program: String,
    /// Whether CoreDNS is deployed, which enables NodeHosts registration
    pub coredns_enabled: bool,
    /// Whether rootless port registration runs
    pub rootless: bool,
    /// Whether LoadBalancer service ports are forwarded
    pub service_lb_enabled: bool,
    /// Always forwarded in rootless mode
    pub https_port: u16,
}

impl RegistrarSettings {
    /// Settings for `program` derived from the server configuration
    pub fn from_server_config(config: &ServerConfig, program: &str) -> Self {
        Self {
            program: program.to_string(),
            coredns_enabled: !config.control.skips.contains("coredns"),
            rootless: config.rootless,
            service_lb_enabled: !config.disable_service_lb,
            https_port: config.control.https_port,
        }
    }

    /// `<program>-api-addresses`
    pub fn api_addresses_name(&self) -> String {
        format!("{}-api-addresses", self.program)
    }

    /// `<program>-rootless-ports`
    pub fn rootless_ports_name(&self) -> String {
        format!("{}-rootless-ports", self.program)
    }
}

/// Ports forwarded from the host network namespace in rootless mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootlessPorts {
    /// TCP ports, sorted
    pub tcp: BTreeSet<u16>,
}

/// `ip:port` for every address and port of the Endpoints, sorted and deduplicated.
pub fn endpoint_addresses(endpoints: &Endpoints) -> Vec<String> {
    let mut addresses = BTreeSet::new();
    for subset in endpoints.subsets.iter().flatten() {
        let ports: Vec<i32> = subset.ports.iter().flatten().map(|p| p.port).collect();
        for address in subset.addresses.iter().flatten() {
            for port in &ports {
                let rendered = match (address.ip.parse::<IpAddr>(), u16::try_from(*port)) {
                    (Ok(ip), Ok(port)) => SocketAddr::new(ip, port).to_string(),
                    _ => format!("{}:{}", address.ip, port),
                };
                addresses.insert(rendered);
            }
        }
    }
    addresses.into_iter().collect()
}

/// Runs the core registrations.
pub struct CoreRegistrar {
    client: Arc<dyn ResourceClientTrait>,
    settings: RegistrarSettings,
}

impl CoreRegistrar {
    /// Registrar writing through `client`
    pub fn new(client: Arc<dyn ResourceClientTrait>, settings: RegistrarSettings) -> Self {
        Self { client, settings }
    }

    /// Run every registration in order, stopping at the first failure.
    pub async fn register(&self) -> Result<(), ProvisionError> {
        self.register_node()
            .await
            .map_err(|source| ProvisionError::Registration { step: "node", source })?;

        self.register_api_addresses()
            .await
            .map_err(|source| ProvisionError::Registration { step: "api address", source })?;

        if self.settings.rootless {
            self.register_rootless_ports()
                .await
                .map_err(|source| ProvisionError::Registration { step: "rootless ports", source })?;
        }

        info!("Core registrations complete");
        Ok(())
    }

    async fn register_node(&self) -> Result<(), ResourceError> {
        if !self.settings.coredns_enabled {
            debug!("CoreDNS skipped, no NodeHosts registration");
            return Ok(());
        }
        node_hosts::sync_node_hosts(self.client.as_ref()).await?;
        Ok(())
    }

    async fn register_api_addresses(&self) -> Result<(), ResourceError> {
        let addresses = match self.client.get_endpoints(DEFAULT_NAMESPACE, KUBERNETES_ENDPOINTS).await {
            Ok(endpoints) => endpoint_addresses(&endpoints),
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };

        let data = BTreeMap::from([(API_ADDRESSES_KEY.to_string(), addresses.join(","))]);
        let name = self.settings.api_addresses_name();
        if upsert_config_map_data(self.client.as_ref(), SYSTEM_NAMESPACE, &name, data).await? {
            info!(name = %name, addresses = ?addresses, "Registered API addresses");
        }
        Ok(())
    }

    async fn register_rootless_ports(&self) -> Result<(), ResourceError> {
        let mut tcp = BTreeSet::from([self.settings.https_port]);

        if self.settings.service_lb_enabled {
            for service in self.client.list_services().await? {
                let Some(spec) = service.spec else { continue };
                if spec.type_.as_deref() != Some("LoadBalancer") {
                    continue;
                }
                tcp.extend(
                    spec.ports
                        .iter()
                        .flatten()
                        .filter(|p| p.protocol.as_deref().unwrap_or("TCP") == "TCP")
                        .filter_map(|p| u16::try_from(p.port).ok()),
                );
            }
        }

        let document = serde_json::to_string(&RootlessPorts { tcp })
            .map_err(|e| ResourceError::InvalidObject(format!("rootless ports: {}", e)))?;
        let data = BTreeMap::from([(ROOTLESS_PORTS_KEY.to_string(), document)]);
        let name = self.settings.rootless_ports_name();
        if upsert_config_map_data(self.client.as_ref(), SYSTEM_NAMESPACE, &name, data).await? {
            info!(name = %name, "Registered rootless ports");
        }
        Ok(())
    }
}
