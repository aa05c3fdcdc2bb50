//! Controller registry.
//!
//! Controllers are grouped in two buckets: always-run controllers start on
//! every replica right after the resource client is built, leader controllers
//! only run on the replica that holds the leadership lease.

use crate::error::ProvisionError;
use futures::future::{try_join_all, BoxFuture};
use resource_client::ResourceClientTrait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// What a controller gets when it starts.
#[derive(Clone)]
pub struct ControllerContext {
    /// Cancelled on shutdown or leadership loss
    pub cancel: CancellationToken,
    /// Shared cluster client
    pub client: Arc<dyn ResourceClientTrait>,
}

type StartFn = Arc<dyn Fn(ControllerContext) -> BoxFuture<'static, Result<(), ProvisionError>> + Send + Sync>;

/// A named controller start callback.
#[derive(Clone)]
pub struct Controller {
    name: String,
    start: StartFn,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Controller {
    /// Wrap an async start function.
    pub fn new<F, Fut>(name: impl Into<String>, start: F) -> Self
    where
        F: Fn(ControllerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProvisionError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            start: Arc::new(move |ctx| -> BoxFuture<'static, Result<(), ProvisionError>> {
                Box::pin(start(ctx))
            }),
        }
    }

    /// Controller name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the controller.
    pub async fn start(&self, ctx: ControllerContext) -> Result<(), ProvisionError> {
        (self.start)(ctx).await
    }
}

/// Ordered always-run and leader-only controllers.
#[derive(Debug, Clone, Default)]
pub struct ControllerRegistry {
    cluster_start: Option<Controller>,
    controllers: Vec<Controller>,
    leader_controllers: Vec<Controller>,
}

impl ControllerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook that runs before every other controller
    #[must_use]
    pub fn with_cluster_start(mut self, controller: Controller) -> Self {
        self.cluster_start = Some(controller);
        self
    }

    /// Add an always-run controller
    #[must_use]
    pub fn with_controller(mut self, controller: Controller) -> Self {
        self.controllers.push(controller);
        self
    }

    /// Add a leader-only controller
    #[must_use]
    pub fn with_leader_controller(mut self, controller: Controller) -> Self {
        self.leader_controllers.push(controller);
        self
    }

    /// Start the cluster hook and then every always-run controller, in order.
    ///
    /// Stops at the first failure.
    pub async fn start_controllers(&self, ctx: &ControllerContext) -> Result<(), ProvisionError> {
        for controller in self.cluster_start.iter().chain(&self.controllers) {
            info!(controller = %controller.name(), "Starting controller");
            controller.start(ctx.clone()).await.map_err(|e| ProvisionError::Controller {
                name: controller.name().to_string(),
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    /// The leader-only bucket
    pub fn leader_set(&self) -> LeaderSet {
        LeaderSet {
            controllers: self.leader_controllers.clone(),
        }
    }
}

/// Controllers that run together on the elected leader.
#[derive(Debug, Clone, Default)]
pub struct LeaderSet {
    controllers: Vec<Controller>,
}

impl LeaderSet {
    /// Number of controllers in the set
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Run every controller concurrently.
    ///
    /// Returns when all of them have returned, or as soon as one fails; a
    /// single failure aborts the whole set.
    pub async fn run(&self, ctx: ControllerContext) -> Result<(), ProvisionError> {
        let runs = self.controllers.iter().map(|controller| {
            let ctx = ctx.clone();
            async move {
                info!(controller = %controller.name(), "Starting leader controller");
                controller.start(ctx).await.map_err(|e| ProvisionError::LeaderController {
                    name: controller.name().to_string(),
                    source: Box::new(e),
                })
            }
        });
        try_join_all(runs).await.map(|_| ())
    }
}
