//! Control plane runtime.
//!
//! The orchestrator only sees the [`ControlPlane`] trait: start with a fully
//! populated configuration, get back a readiness signal and the paths of the
//! credentials the runtime produced. [`K3sControlPlane`] backs it with a
//! supervised `k3s server` child process.

use crate::config::ServerConfig;
use crate::error::{FatalReporter, ProvisionError};
use crate::readiness::{readiness_channel, ReadinessSignal, ReadinessTrigger};
use crate::retry::{RetryPolicy, Step};
use async_trait::async_trait;
use resource_client::KubeResourceClient;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attempts (one per second) to wait for the server token file
const TOKEN_WAIT_ATTEMPTS: u32 = 120;

/// What a started control plane hands back.
#[derive(Debug)]
pub struct RuntimeHandle {
    /// Fires once the API server accepts admin requests
    pub ready: ReadinessSignal,
    /// Admin kubeconfig
    pub kubeconfig_admin: PathBuf,
    /// Raw server token
    pub server_token: String,
    /// Server CA bundle used to pin agent tokens
    pub server_ca: PathBuf,
    /// Legacy node-password file
    pub node_passwd_file: PathBuf,
}

/// Credential locations inside the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Server token written by the control plane
    pub token: PathBuf,
    /// Admin kubeconfig
    pub kubeconfig_admin: PathBuf,
    /// Server CA bundle
    pub server_ca: PathBuf,
    /// Legacy node-password file
    pub node_passwd_file: PathBuf,
}

impl RuntimePaths {
    /// Paths under `data_dir`
    pub fn new(data_dir: &Path) -> Self {
        let server = data_dir.join("server");
        Self {
            token: server.join("token"),
            kubeconfig_admin: server.join("cred").join("admin.kubeconfig"),
            server_ca: server.join("tls").join("server-ca.crt"),
            node_passwd_file: server.join("cred").join("node-passwd"),
        }
    }
}

/// A control plane that can be started once.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Start the control plane.
    ///
    /// Failure to start is returned; failures after a successful start (the
    /// process dying, readiness never reachable) go to `fatal`.
    async fn start(
        &self,
        config: &ServerConfig,
        cancel: CancellationToken,
        fatal: FatalReporter,
    ) -> Result<RuntimeHandle, ProvisionError>;
}

/// Command line for `k3s server`.
pub fn k3s_args(config: &ServerConfig, token: Option<&str>) -> Vec<String> {
    let control = &config.control;
    let join = |items: Vec<String>| items.join(",");
    let mut args = vec![
        "server".to_string(),
        "--data-dir".to_string(),
        control.data_dir.display().to_string(),
        "--https-listen-port".to_string(),
        control.https_port.to_string(),
    ];

    if !control.cluster_ip_ranges.is_empty() {
        args.push("--cluster-cidr".to_string());
        args.push(join(control.cluster_ip_ranges.iter().map(ToString::to_string).collect()));
    }
    if !control.service_ip_ranges.is_empty() {
        args.push("--service-cidr".to_string());
        args.push(join(control.service_ip_ranges.iter().map(ToString::to_string).collect()));
    }
    if let Some(dns) = control.cluster_dns {
        args.push("--cluster-dns".to_string());
        args.push(dns.to_string());
    }
    if !control.cluster_domain.is_empty() {
        args.push("--cluster-domain".to_string());
        args.push(control.cluster_domain.clone());
    }
    if let Some(range) = control.service_node_port_range {
        args.push("--service-node-port-range".to_string());
        args.push(range.to_string());
    }
    if !control.bind_address.is_empty() {
        args.push("--bind-address".to_string());
        args.push(control.bind_address.clone());
    }
    if !control.api_server_bind_address.is_empty() {
        args.push(format!("--kube-apiserver-arg=bind-address={}", control.api_server_bind_address));
    }

    let flags = [
        (control.disable_api_server, "--disable-apiserver"),
        (control.disable_ccm, "--disable-cloud-controller"),
        (control.disable_etcd, "--disable-etcd"),
        (control.disable_kube_proxy, "--disable-kube-proxy"),
        (control.disable_npc, "--disable-network-policy"),
        (control.cluster_reset, "--cluster-reset"),
        (config.rootless, "--rootless"),
        (config.disable_agent, "--disable-agent"),
    ];
    args.extend(flags.iter().filter(|(on, _)| *on).map(|(_, flag)| (*flag).to_string()));

    if config.disable_service_lb {
        args.push("--disable=servicelb".to_string());
    }
    for skip in &control.skips {
        args.push(format!("--disable={}", skip));
    }
    if control.no_leader_elect {
        args.push("--kube-controller-manager-arg=leader-elect=false".to_string());
        args.push("--kube-scheduler-arg=leader-elect=false".to_string());
    }
    if let Some(token) = token {
        args.push("--token".to_string());
        args.push(token.to_string());
    }

    args
}

/// Read a trimmed, non-empty token file.
async fn read_server_token(path: &Path) -> Result<Step<String>, ProvisionError> {
    match tokio::fs::read_to_string(path).await {
        Ok(token) if !token.trim().is_empty() => Ok(Step::Ready(token.trim().to_string())),
        Ok(_) => Ok(Step::Retry(format!("Server token file {} is empty", path.display()))),
        Err(e) => Ok(Step::Retry(format!(
            "Waiting for server token {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Whether the API server behind `kubeconfig` answers.
async fn probe_api_server(kubeconfig: &Path) -> Result<Step<()>, ProvisionError> {
    if !kubeconfig.exists() {
        return Ok(Step::Retry(format!(
            "Waiting for admin kubeconfig {}",
            kubeconfig.display()
        )));
    }

    let client = match KubeResourceClient::from_kubeconfig(kubeconfig).await {
        Ok(client) => client,
        Err(e) => return Ok(Step::Retry(format!("Admin kubeconfig not usable yet: {}", e))),
    };

    match client.kube_client().apiserver_version().await {
        Ok(version) => {
            info!(version = %version.git_version, "API server is answering");
            Ok(Step::Ready(()))
        }
        Err(e) => Ok(Step::Retry(format!("Waiting for API server: {}", e))),
    }
}

/// `k3s server` as a child process.
#[derive(Debug, Clone)]
pub struct K3sControlPlane {
    bin: String,
    server_token: Option<String>,
}

impl K3sControlPlane {
    /// Launch `bin`; with `server_token` unset the token is read back from the data dir
    pub fn new(bin: impl Into<String>, server_token: Option<String>) -> Self {
        Self {
            bin: bin.into(),
            server_token,
        }
    }

    fn spawn(&self, args: &[String]) -> Result<Child, ProvisionError> {
        debug!(bin = %self.bin, args = ?args, "Launching control plane");
        Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProvisionError::Runtime(format!("starting kubernetes: {}: {}", self.bin, e)))
    }

    /// Watch the child; its exit before shutdown is fatal.
    fn supervise(&self, mut child: Child, cancel: CancellationToken, fatal: FatalReporter) {
        let bin = self.bin.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(bin = %bin, error = %e, "Failed to stop control plane");
                    }
                    info!(bin = %bin, "Control plane stopped");
                }
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!("{} exited: {}", bin, status),
                        Err(e) => format!("{} wait failed: {}", bin, e),
                    };
                    fatal.report(ProvisionError::Runtime(reason));
                }
            }
        });
    }

    /// Fire `trigger` once the API server answers.
    fn watch_readiness(
        &self,
        kubeconfig: PathBuf,
        trigger: ReadinessTrigger,
        cancel: CancellationToken,
        fatal: FatalReporter,
    ) {
        let policy = RetryPolicy::default();
        tokio::spawn(async move {
            let result = policy
                .run(&cancel, "API server readiness", || probe_api_server(&kubeconfig))
                .await;
            match result {
                Ok(()) => trigger.fire(),
                Err(ProvisionError::Cancelled) => debug!("Readiness watch cancelled"),
                Err(e) => fatal.report(e),
            }
        });
    }
}

#[async_trait]
impl ControlPlane for K3sControlPlane {
    async fn start(
        &self,
        config: &ServerConfig,
        cancel: CancellationToken,
        fatal: FatalReporter,
    ) -> Result<RuntimeHandle, ProvisionError> {
        let paths = RuntimePaths::new(&config.control.data_dir);
        let args = k3s_args(config, self.server_token.as_deref());

        let child = self.spawn(&args)?;
        info!(bin = %self.bin, pid = ?child.id(), "Control plane launched");
        self.supervise(child, cancel.clone(), fatal.clone());

        let server_token = match &self.server_token {
            Some(token) => token.clone(),
            None => {
                let token_policy = RetryPolicy::fixed(Duration::from_secs(1))
                    .with_max_attempts(TOKEN_WAIT_ATTEMPTS);
                token_policy
                    .run(&cancel, "server token", || read_server_token(&paths.token))
                    .await?
            }
        };

        let (trigger, ready) = readiness_channel();
        self.watch_readiness(paths.kubeconfig_admin.clone(), trigger, cancel, fatal);

        Ok(RuntimeHandle {
            ready,
            kubeconfig_admin: paths.kubeconfig_admin,
            server_token,
            server_ca: paths.server_ca,
            node_passwd_file: paths.node_passwd_file,
        })
    }
}
