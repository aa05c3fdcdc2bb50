//! Cluster Resource Client
//!
//! Typed access to the handful of Kubernetes objects the kubeseed
//! provisioner reads and writes: Nodes, ConfigMaps, Secrets, Services,
//! Endpoints and Leases.
//!
//! # Example
//!
//! ```no_run
//! use resource_client::{KubeResourceClient, ResourceClientTrait};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeResourceClient::from_kubeconfig(Path::new("/var/lib/kubeseed/server/cred/admin.kubeconfig")).await?;
//!
//! match client.get_config_map("kube-system", "cluster-dns").await {
//!     Ok(_) => println!("already configured"),
//!     Err(e) if e.is_not_found() => println!("needs creating"),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `test-util`: exposes [`MockResourceClient`], an in-memory cluster with
//!   atomic create and optimistic update semantics.

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod resource_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeResourceClient;
pub use error::ResourceError;
pub use resource_trait::ResourceClientTrait;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{CallCounts, MockResourceClient};
