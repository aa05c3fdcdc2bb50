//! CoreDNS `NodeHosts` entry.
//!
//! CoreDNS resolves node names through a hosts block fed from the `NodeHosts`
//! key of the `kube-system/coredns` ConfigMap. The registrar writes it once on
//! every replica; the leader keeps it in sync as nodes come and go.

use crate::error::ProvisionError;
use crate::registry::{Controller, ControllerContext};
use crate::tasks::SYSTEM_NAMESPACE;
use k8s_openapi::api::core::v1::Node;
use resource_client::{ResourceClientTrait, ResourceError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// CoreDNS ConfigMap name
pub const COREDNS_CONFIG_MAP: &str = "coredns";
/// Key holding the hosts entries
pub const NODE_HOSTS_KEY: &str = "NodeHosts";
/// Leader controller resync period
pub const NODE_HOSTS_RESYNC: Duration = Duration::from_secs(30);

fn internal_ip(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|addr| addr.type_ == "InternalIP")
        .map(|addr| addr.address.as_str())
}

/// Render `<internal-ip> <node-name>` lines, sorted by node name.
///
/// Nodes without a name or an InternalIP are left out.
pub fn render_node_hosts(nodes: &[Node]) -> String {
    let mut entries: Vec<(&str, &str)> = nodes
        .iter()
        .filter_map(|node| Some((node.metadata.name.as_deref()?, internal_ip(node)?)))
        .collect();
    entries.sort_unstable();

    let mut hosts = String::new();
    for (name, ip) in entries {
        hosts.push_str(ip);
        hosts.push(' ');
        hosts.push_str(name);
        hosts.push('\n');
    }
    hosts
}

/// Write the current node list into the CoreDNS ConfigMap.
///
/// Returns `Ok(false)` when nothing changed or CoreDNS is not deployed yet.
pub async fn sync_node_hosts(client: &dyn ResourceClientTrait) -> Result<bool, ResourceError> {
    let mut config_map = match client.get_config_map(SYSTEM_NAMESPACE, COREDNS_CONFIG_MAP).await {
        Ok(cm) => cm,
        Err(e) if e.is_not_found() => {
            debug!("CoreDNS ConfigMap not found, skipping NodeHosts");
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    let nodes = client.list_nodes().await?;
    let hosts = render_node_hosts(&nodes);

    let data = config_map.data.get_or_insert_with(Default::default);
    if data.get(NODE_HOSTS_KEY) == Some(&hosts) {
        return Ok(false);
    }
    data.insert(NODE_HOSTS_KEY.to_string(), hosts);

    client.update_config_map(&config_map).await?;
    info!(nodes = nodes.len(), "Updated CoreDNS NodeHosts");
    Ok(true)
}

/// Leader controller that resyncs `NodeHosts` every `resync` until cancelled.
pub fn node_hosts_controller(resync: Duration) -> Controller {
    Controller::new("node-hosts", move |ctx: ControllerContext| async move {
        loop {
            if let Err(e) = sync_node_hosts(ctx.client.as_ref()).await {
                // conflicts and transient errors are retried on the next resync
                warn!(error = %e, "NodeHosts sync failed");
            }

            tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => {
                    debug!("NodeHosts controller stopped");
                    return Ok::<(), ProvisionError>(());
                }
                () = tokio::time::sleep(resync) => {}
            }
        }
    })
}
