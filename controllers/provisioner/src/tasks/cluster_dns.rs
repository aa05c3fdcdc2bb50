//! Cluster DNS configuration
//!
//! Publishes the cluster DNS service address and domain in
//! `kube-system/cluster-dns` so in-cluster components can discover them.
//! The object is created once and never updated; an existing object, whatever
//! its content, is left alone.

use crate::error::ProvisionError;
use crate::retry::{RetryPolicy, Step};
use crate::tasks::{TaskOutcome, SYSTEM_NAMESPACE};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use resource_client::ResourceClientTrait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the cluster DNS ConfigMap
pub const CLUSTER_DNS_CONFIG_MAP: &str = "cluster-dns";
/// Key holding the DNS service address
pub const CLUSTER_DNS_KEY: &str = "clusterDNS";
/// Key holding the cluster domain
pub const CLUSTER_DOMAIN_KEY: &str = "clusterDomain";

/// How the configurer finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsConfigState {
    /// Object was already there on the first read
    Existing,
    /// This process created the object
    Created,
    /// Another writer created it between our read and our create
    LostRace,
}

/// Build the cluster DNS ConfigMap.
pub fn build_cluster_dns_config_map(cluster_dns: Option<Ipv4Addr>, cluster_domain: &str) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(
        CLUSTER_DNS_KEY.to_string(),
        cluster_dns.map(|ip| ip.to_string()).unwrap_or_default(),
    );
    data.insert(CLUSTER_DOMAIN_KEY.to_string(), cluster_domain.to_string());

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(CLUSTER_DNS_CONFIG_MAP.to_string()),
            namespace: Some(SYSTEM_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Creates `kube-system/cluster-dns` once.
pub struct ClusterDnsConfigurer {
    client: Arc<dyn ResourceClientTrait>,
    cluster_dns: Option<Ipv4Addr>,
    cluster_domain: String,
    policy: RetryPolicy,
}

impl ClusterDnsConfigurer {
    /// Configurer for the given DNS address and domain
    pub fn new(
        client: Arc<dyn ResourceClientTrait>,
        cluster_dns: Option<Ipv4Addr>,
        cluster_domain: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            cluster_dns,
            cluster_domain: cluster_domain.into(),
            policy,
        }
    }

    async fn create_once(&self, config_map: &ConfigMap) -> Result<Step<DnsConfigState>, ProvisionError> {
        match self.client.create_config_map(config_map).await {
            Ok(_) => {
                info!(
                    namespace = SYSTEM_NAMESPACE,
                    name = CLUSTER_DNS_CONFIG_MAP,
                    "Created cluster DNS ConfigMap"
                );
                Ok(Step::Ready(DnsConfigState::Created))
            }
            Err(e) if e.is_already_exists() => {
                debug!("Cluster DNS ConfigMap created concurrently by another writer");
                Ok(Step::Ready(DnsConfigState::LostRace))
            }
            Err(e) => Ok(Step::Retry(format!("Failed to create cluster DNS ConfigMap: {}", e))),
        }
    }

    /// Run until the object exists or `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> TaskOutcome {
        if cancel.is_cancelled() {
            info!("Cluster DNS configuration cancelled");
            return TaskOutcome::Cancelled;
        }

        // any read failure falls through to create; the store rejects duplicates
        match self.client.get_config_map(SYSTEM_NAMESPACE, CLUSTER_DNS_CONFIG_MAP).await {
            Ok(_) => {
                debug!("Cluster DNS ConfigMap already exists");
                return TaskOutcome::Done;
            }
            Err(e) if !e.is_not_found() => {
                warn!(error = %e, "Failed to read cluster DNS ConfigMap, creating it");
            }
            Err(_) => {}
        }

        let config_map = build_cluster_dns_config_map(self.cluster_dns, &self.cluster_domain);
        let result = self.policy
            .run(&cancel, "cluster DNS ConfigMap", || self.create_once(&config_map))
            .await;

        match result {
            Ok(state) => {
                debug!(state = ?state, "Cluster DNS configuration finished");
                TaskOutcome::Done
            }
            Err(ProvisionError::Cancelled) => {
                info!("Cluster DNS configuration cancelled");
                TaskOutcome::Cancelled
            }
            Err(e) => {
                warn!(error = %e, "Cluster DNS configuration stopped");
                TaskOutcome::GaveUp
            }
        }
    }
}
