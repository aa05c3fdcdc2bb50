//! Startup orchestration
//!
//! [`Orchestrator::start_server`] is a single pass: start the control plane,
//! put the post-readiness pipeline behind the readiness gate in the
//! background, then pick the advertise address and print the join command.
//! Everything after readiness runs in spawned tasks; fatal failures there are
//! handed to the [`FatalReporter`].

use crate::config::{ServerConfig, PROGRAM};
use crate::error::{FatalReporter, ProvisionError};
use crate::leader::{run_leader_gated, ElectionTiming, LeaderElector};
use crate::net;
use crate::readiness::run_when_ready;
use crate::registry::{ControllerContext, ControllerRegistry};
use crate::retry::RetryPolicy;
use crate::runtime::ControlPlane;
use crate::tasks::cluster_dns::ClusterDnsConfigurer;
use crate::tasks::migration::migrate_node_passwords;
use crate::tasks::registrar::{CoreRegistrar, RegistrarSettings};
use crate::tasks::role_labeler::RoleLabeler;
use crate::tasks::{EnvNodeIdentity, NodeIdentity, TaskOutcome};
use crate::token;
use async_trait::async_trait;
use resource_client::{KubeResourceClient, ResourceClientTrait};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Builds the cluster client once the API server is ready.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Client bound to the admin credentials in `kubeconfig`
    async fn build(&self, kubeconfig: &Path) -> Result<Arc<dyn ResourceClientTrait>, ProvisionError>;
}

/// Real client factory
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeClientFactory;

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn build(&self, kubeconfig: &Path) -> Result<Arc<dyn ResourceClientTrait>, ProvisionError> {
        let client = KubeResourceClient::from_kubeconfig(kubeconfig).await?;
        Ok(Arc::new(client))
    }
}

/// Handles of the tasks the pipeline spawned.
#[derive(Debug)]
pub struct PipelineHandles {
    /// `None` when the agent or the API server is disabled
    pub role_labels: Option<JoinHandle<TaskOutcome>>,
    /// Cluster DNS ConfigMap creation
    pub cluster_dns: JoinHandle<TaskOutcome>,
    /// Leader-gated runner; fatal errors are reported, not returned
    pub leader: JoinHandle<()>,
}

/// Result of a successful start.
#[derive(Debug)]
pub struct Provisioned {
    /// Address other nodes join on
    pub advertise_ip: IpAddr,
    /// Command printed for joining agents
    pub join_command: String,
    /// Readiness gate and pipeline; `None` if cancelled or failed before the pipeline finished
    pub pipeline: JoinHandle<Option<PipelineHandles>>,
}

/// Everything that runs after readiness.
struct Pipeline {
    config: ServerConfig,
    kubeconfig: PathBuf,
    node_passwd_file: PathBuf,
    factory: Arc<dyn ClientFactory>,
    registry: ControllerRegistry,
    identity: Arc<dyn NodeIdentity>,
    policy: RetryPolicy,
    election: ElectionTiming,
    fatal: FatalReporter,
}

impl Pipeline {
    async fn run(self, cancel: CancellationToken) -> Result<PipelineHandles, ProvisionError> {
        let client = self.factory.build(&self.kubeconfig).await?;

        // before any controller touches node passwords
        match migrate_node_passwords(client.as_ref(), &self.node_passwd_file, PROGRAM).await {
            Ok(0) => {}
            Ok(migrated) => info!(migrated, "Node-password file migrated"),
            Err(e) => error!(error = %e, "Error migrating node-password file"),
        }

        let ctx = ControllerContext {
            cancel: cancel.clone(),
            client: client.clone(),
        };
        self.registry.start_controllers(&ctx).await?;

        let role_labels = if self.config.disable_agent || self.config.control.disable_api_server {
            debug!("Agent or API server disabled, not labeling the node");
            None
        } else {
            let labeler = RoleLabeler::new(client.clone(), self.identity.clone(), self.policy);
            Some(tokio::spawn(labeler.run(cancel.clone())))
        };

        let configurer = ClusterDnsConfigurer::new(
            client.clone(),
            self.config.control.cluster_dns,
            self.config.control.cluster_domain.clone(),
            self.policy,
        );
        let cluster_dns = tokio::spawn(configurer.run(cancel.clone()));

        CoreRegistrar::new(
            client.clone(),
            RegistrarSettings::from_server_config(&self.config, PROGRAM),
        )
        .register()
        .await?;

        let elector = LeaderElector::for_program(client).with_timing(self.election);
        let set = self.registry.leader_set();
        let no_leader_elect = self.config.control.no_leader_elect;
        let fatal = self.fatal;
        let leader = tokio::spawn(async move {
            if let Err(e) = run_leader_gated(no_leader_elect, &elector, &set, ctx).await {
                fatal.report(e);
            }
        });

        Ok(PipelineHandles {
            role_labels,
            cluster_dns,
            leader,
        })
    }
}

/// Startup orchestrator.
pub struct Orchestrator {
    runtime: Arc<dyn ControlPlane>,
    factory: Arc<dyn ClientFactory>,
    registry: ControllerRegistry,
    identity: Arc<dyn NodeIdentity>,
    policy: RetryPolicy,
    election: ElectionTiming,
    choose_host: fn() -> Option<IpAddr>,
    fatal: FatalReporter,
}

impl Orchestrator {
    /// Orchestrator with the real client factory, no controllers and default timings
    pub fn new(runtime: Arc<dyn ControlPlane>, fatal: FatalReporter) -> Self {
        Self {
            runtime,
            factory: Arc::new(KubeClientFactory),
            registry: ControllerRegistry::new(),
            identity: Arc::new(EnvNodeIdentity),
            policy: RetryPolicy::default(),
            election: ElectionTiming::default(),
            choose_host: net::host_interface_ip,
            fatal,
        }
    }

    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = factory;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: ControllerRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_identity(mut self, identity: Arc<dyn NodeIdentity>) -> Self {
        self.identity = identity;
        self
    }

    /// Retry policy of the reconciliation tasks
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_election_timing(mut self, election: ElectionTiming) -> Self {
        self.election = election;
        self
    }

    /// Source of the host address when no bind address is configured
    #[must_use]
    pub fn with_host_chooser(mut self, choose_host: fn() -> Option<IpAddr>) -> Self {
        self.choose_host = choose_host;
        self
    }

    /// Start the control plane and schedule everything that follows readiness.
    pub async fn start_server(
        &self,
        config: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Provisioned, ProvisionError> {
        let handle = self.runtime
            .start(config, cancel.clone(), self.fatal.clone())
            .await?;

        let pipeline = Pipeline {
            config: config.clone(),
            kubeconfig: handle.kubeconfig_admin,
            node_passwd_file: handle.node_passwd_file,
            factory: self.factory.clone(),
            registry: self.registry.clone(),
            identity: self.identity.clone(),
            policy: self.policy,
            election: self.election,
            fatal: self.fatal.clone(),
        };
        let fatal = self.fatal.clone();
        let gate_cancel = cancel.clone();
        let ready = handle.ready;
        let gate = tokio::spawn(async move {
            let token = gate_cancel.clone();
            match run_when_ready(gate_cancel, ready, move || pipeline.run(token)).await {
                Ok(handles) => handles,
                Err(e) => {
                    fatal.report(e);
                    None
                }
            }
        });

        let advertise_ip = net::advertise_ip(&config.control.bind_address, self.choose_host);
        let join_command = print_tokens(
            advertise_ip,
            config.control.supervisor_port,
            &handle.server_token,
            &handle.server_ca,
        )?;

        Ok(Provisioned {
            advertise_ip,
            join_command,
            pipeline: gate,
        })
    }
}

/// Log the join command. An empty server token is fatal.
fn print_tokens(
    advertise_ip: IpAddr,
    supervisor_port: u16,
    server_token: &str,
    server_ca: &Path,
) -> Result<String, ProvisionError> {
    if server_token.is_empty() {
        return Err(ProvisionError::MissingServerToken);
    }

    let agent_token = match token::format_token(server_token, server_ca) {
        Ok(formatted) => {
            info!("Node token is available");
            formatted
        }
        Err(e) => {
            warn!(error = %e, "Could not pin the server CA, printing the raw token");
            server_token.to_string()
        }
    };

    let command = token::join_command(PROGRAM, advertise_ip, supervisor_port, &agent_token);
    info!("To join node to cluster: {}", command);
    Ok(command)
}
