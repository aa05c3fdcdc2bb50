//! Node-password file migration
//!
//! Older servers kept agent node passwords in a flat `<password>,<node>` file
//! under the data directory. On startup the entries of registered nodes are
//! moved into hashed Secrets in `kube-system` and the file is removed.

use crate::error::ProvisionError;
use crate::tasks::SYSTEM_NAMESPACE;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use resource_client::ResourceClientTrait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info, warn};

/// Secret type for migrated node passwords
pub const NODE_PASSWORD_SECRET_TYPE: &str = "kubeseed.io/node-password";

/// `<node>.node-password.<program>`
pub fn node_password_secret_name(node: &str, program: &str) -> String {
    format!("{}.node-password.{}", node, program)
}

/// Hex-encoded SHA-256 of a node password
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Parse the password file into a node → password map.
///
/// Malformed lines are logged and skipped. A later entry for the same node
/// replaces an earlier one.
pub fn parse_password_file(contents: &str) -> BTreeMap<String, String> {
    let mut passwords = BTreeMap::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(',') {
            Some((password, node)) if !password.is_empty() && !node.trim().is_empty() => {
                passwords.insert(node.trim().to_string(), password.to_string());
            }
            _ => warn!(line = index + 1, "Skipping malformed node-password entry"),
        }
    }
    passwords
}

fn node_password_secret(node: &str, password: &str, program: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(node_password_secret_name(node, program)),
            namespace: Some(SYSTEM_NAMESPACE.to_string()),
            ..Default::default()
        },
        string_data: Some([("hash".to_string(), hash_password(password))].into()),
        type_: Some(NODE_PASSWORD_SECRET_TYPE.to_string()),
        ..Default::default()
    }
}

/// Move node passwords from `path` into Secrets, then delete the file.
///
/// A missing file means there is nothing to migrate. Secrets that already
/// exist are kept as they are.
///
/// # Returns
/// Number of Secrets created.
pub async fn migrate_node_passwords(
    client: &dyn ResourceClientTrait,
    path: &Path,
    program: &str,
) -> Result<usize, ProvisionError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "No node-password file to migrate");
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let passwords = parse_password_file(&contents);
    let nodes = client.list_nodes().await?;

    let mut created = 0;
    for node in &nodes {
        let Some(name) = node.metadata.name.as_deref() else {
            continue;
        };
        let Some(password) = passwords.get(name) else {
            continue;
        };

        match client.create_secret(&node_password_secret(name, password, program)).await {
            Ok(_) => created += 1,
            Err(e) if e.is_already_exists() => {
                debug!(node = %name, "Node-password secret already exists");
            }
            Err(e) => return Err(e.into()),
        }
    }

    tokio::fs::remove_file(path).await?;
    info!(
        path = %path.display(),
        entries = passwords.len(),
        migrated = created,
        "Migrated node-password file"
    );
    Ok(created)
}
