//! Integration tests for the Kubernetes resource client
//!
//! These tests require a running cluster.
//! Set KUBECONFIG to an admin kubeconfig to run.

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use resource_client::{KubeResourceClient, ResourceClientTrait};
use std::path::PathBuf;

fn kubeconfig_path() -> PathBuf {
    let path = std::env::var("KUBECONFIG")
        .expect("KUBECONFIG environment variable must be set");
    PathBuf::from(path)
}

#[tokio::test]
#[ignore] // Requires running cluster
async fn test_missing_config_map_is_not_found() {
    let client = KubeResourceClient::from_kubeconfig(&kubeconfig_path()).await
        .expect("Failed to create client");

    let err = client.get_config_map("kube-system", "kubeseed-does-not-exist").await
        .expect_err("config map should not exist");
    assert!(err.is_not_found(), "unexpected error: {}", err);
}

#[tokio::test]
#[ignore]
async fn test_duplicate_create_reports_already_exists() {
    let client = KubeResourceClient::from_kubeconfig(&kubeconfig_path()).await
        .expect("Failed to create client");

    let name = format!("kubeseed-it-{}", std::process::id());
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    client.create_config_map(&config_map).await
        .expect("first create should succeed");
    let err = client.create_config_map(&config_map).await
        .expect_err("second create should fail");
    assert!(err.is_already_exists(), "unexpected error: {}", err);
}

#[tokio::test]
#[ignore]
async fn test_list_nodes() {
    let client = KubeResourceClient::from_kubeconfig(&kubeconfig_path()).await
        .expect("Failed to create client");

    let nodes = client.list_nodes().await
        .expect("Failed to list nodes");

    println!("Found {} nodes", nodes.len());
}
