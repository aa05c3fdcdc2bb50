//! Post-readiness reconciliation tasks.
//!
//! - `migration`: moves the legacy node-password file into Secrets
//! - `role_labeler`: marks the local node as control-plane
//! - `cluster_dns`: creates the cluster DNS ConfigMap once
//! - `registrar`: node, API address and rootless port registration
//! - `node_hosts`: keeps the CoreDNS `NodeHosts` entry in sync (leader only)

pub mod cluster_dns;
pub mod migration;
pub mod node_hosts;
pub mod registrar;
pub mod role_labeler;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use resource_client::{ResourceClientTrait, ResourceError};
use std::collections::BTreeMap;
use std::env;

/// Namespace holding every object the provisioner writes
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// How a detached reconciliation task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Desired state reached (or already present)
    Done,
    /// Shutdown requested before the desired state was reached
    Cancelled,
    /// A bounded retry policy ran out of attempts
    GaveUp,
}

/// Source of the local node name.
pub trait NodeIdentity: Send + Sync {
    /// Current node name, `None` while it is not known yet
    fn node_name(&self) -> Option<String>;
}

/// Reads `NODE_NAME` on every call; the agent may export it late.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvNodeIdentity;

impl NodeIdentity for EnvNodeIdentity {
    fn node_name(&self) -> Option<String> {
        env::var("NODE_NAME").ok().filter(|name| !name.is_empty())
    }
}

/// Create the ConfigMap or replace its data if it differs.
///
/// Returns `true` when something was written. Updates carry the
/// resourceVersion that was read, so a concurrent writer causes a conflict
/// instead of a lost update.
pub(crate) async fn upsert_config_map_data(
    client: &dyn ResourceClientTrait,
    namespace: &str,
    name: &str,
    data: BTreeMap<String, String>,
) -> Result<bool, ResourceError> {
    match client.get_config_map(namespace, name).await {
        Ok(mut existing) => {
            if existing.data.as_ref() == Some(&data) {
                return Ok(false);
            }
            existing.data = Some(data);
            client.update_config_map(&existing).await?;
            Ok(true)
        }
        Err(e) if e.is_not_found() => {
            let config_map = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            };
            client.create_config_map(&config_map).await?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resource_client::MockResourceClient;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_upsert_creates_then_skips_unchanged() {
        let mock = MockResourceClient::new();
        let data: BTreeMap<String, String> = [("k".to_string(), "v".to_string())].into();

        assert!(upsert_config_map_data(&mock, SYSTEM_NAMESPACE, "cm", data.clone()).await.unwrap());
        assert!(!upsert_config_map_data(&mock, SYSTEM_NAMESPACE, "cm", data).await.unwrap());
        assert_eq!(mock.calls().update_config_map.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_upsert_updates_changed_data() {
        let mock = MockResourceClient::new();
        let first: BTreeMap<String, String> = [("k".to_string(), "1".to_string())].into();
        let second: BTreeMap<String, String> = [("k".to_string(), "2".to_string())].into();

        upsert_config_map_data(&mock, SYSTEM_NAMESPACE, "cm", first).await.unwrap();
        assert!(upsert_config_map_data(&mock, SYSTEM_NAMESPACE, "cm", second.clone()).await.unwrap());

        let stored = mock.get_config_map(SYSTEM_NAMESPACE, "cm").await.unwrap();
        assert_eq!(stored.data, Some(second));
    }
}
