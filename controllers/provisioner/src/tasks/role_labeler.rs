//! Control-plane role labels on the local node.
//!
//! Polls until the agent has registered the node named by `NODE_NAME`, then
//! sets both role labels to `"true"`. A node that already carries both labels
//! is left untouched.

use crate::error::ProvisionError;
use crate::retry::{RetryPolicy, Step};
use crate::tasks::{NodeIdentity, TaskOutcome};
use k8s_openapi::api::core::v1::Node;
use resource_client::ResourceClientTrait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Control-plane role label
pub const CONTROL_PLANE_ROLE_LABEL_KEY: &str = "node-role.kubernetes.io/control-plane";
/// Legacy master role label
pub const MASTER_ROLE_LABEL_KEY: &str = "node-role.kubernetes.io/master";

const ROLE_LABEL_KEYS: [&str; 2] = [CONTROL_PLANE_ROLE_LABEL_KEY, MASTER_ROLE_LABEL_KEY];

/// Terminal label state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelState {
    /// Labels were already present, nothing written
    AlreadyLabeled,
    /// Labels were written by this task
    Labeled,
}

/// Whether both role labels are set to `"true"`
pub fn has_role_labels(node: &Node) -> bool {
    let labels = node.metadata.labels.as_ref();
    ROLE_LABEL_KEYS.iter().all(|key| {
        labels.and_then(|l| l.get(*key)).is_some_and(|v| v == "true")
    })
}

fn apply_role_labels(node: &mut Node) {
    let labels = node.metadata.labels.get_or_insert_with(Default::default);
    for key in ROLE_LABEL_KEYS {
        labels.insert(key.to_string(), "true".to_string());
    }
}

/// Node role labeling task.
pub struct RoleLabeler {
    client: Arc<dyn ResourceClientTrait>,
    identity: Arc<dyn NodeIdentity>,
    policy: RetryPolicy,
}

impl RoleLabeler {
    /// Creates a new labeler.
    pub fn new(
        client: Arc<dyn ResourceClientTrait>,
        identity: Arc<dyn NodeIdentity>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            identity,
            policy,
        }
    }

    /// One polling attempt.
    async fn attempt(&self) -> Result<Step<LabelState>, ProvisionError> {
        let Some(node_name) = self.identity.node_name() else {
            return Ok(Step::Retry("Waiting for control-plane node agent startup".to_string()));
        };

        let mut node = match self.client.get_node(&node_name).await {
            Ok(node) => node,
            Err(e) => {
                return Ok(Step::Retry(format!(
                    "Waiting for control-plane node {} startup: {}",
                    node_name, e
                )));
            }
        };

        if has_role_labels(&node) {
            return Ok(Step::Ready(LabelState::AlreadyLabeled));
        }

        apply_role_labels(&mut node);
        match self.client.update_node(&node).await {
            Ok(_) => {
                info!(node = %node_name, "Control-plane role label has been set successfully on node");
                Ok(Step::Ready(LabelState::Labeled))
            }
            Err(e) => Ok(Step::Retry(format!(
                "Failed to set control-plane role labels on node {}: {}",
                node_name, e
            ))),
        }
    }

    /// Run until the node is labeled or `cancel` fires. Never fails.
    pub async fn run(self, cancel: CancellationToken) -> TaskOutcome {
        let result = self.policy
            .run(&cancel, "control-plane role label", || self.attempt())
            .await;

        match result {
            Ok(state) => {
                info!(state = ?state, "Control-plane role labels in place");
                TaskOutcome::Done
            }
            Err(ProvisionError::Cancelled) => {
                info!("Set control-plane role label cancelled");
                TaskOutcome::Cancelled
            }
            Err(e) => {
                warn!(error = %e, "Set control-plane role label stopped");
                TaskOutcome::GaveUp
            }
        }
    }
}
