//! Server configuration.
//!
//! Defaults live in constants; a few of them can be overridden from the
//! environment through [`Settings::from_env`]. [`fill_server_config`] turns the
//! settings into the fully populated [`ServerConfig`] handed to the control
//! plane runtime.

use crate::error::ProvisionError;
use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Program name used in the join command and as the leader lock name
pub const PROGRAM: &str = "kubeseed";

/// Pod network
pub const DEFAULT_CIDR: &str = "10.42.0.0/16";
/// Service network
pub const DEFAULT_SERVICE_CIDR: &str = "10.43.0.0/16";
/// Data directory, `${HOME}` is expanded at startup
pub const DEFAULT_DATA_DIR: &str = "${HOME}/.kubeseed/";
/// NodePort service range
pub const DEFAULT_NODE_PORT_RANGE: &str = "30000-32767";
/// HTTPS (and supervisor) port
pub const DEFAULT_HTTPS_PORT: u16 = 6443;
/// Cluster DNS domain
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
/// Default control plane binary
pub const DEFAULT_K3S_BIN: &str = "k3s";

/// Offset of the cluster DNS service address inside the service network
const CLUSTER_DNS_OFFSET: u32 = 10;

/// An IP network in CIDR notation, stored with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Prefix length
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The `n`th address of an IPv4 network, if it falls inside the network
    pub fn nth_ipv4(&self, n: u32) -> Option<Ipv4Addr> {
        let IpAddr::V4(network) = self.network else {
            return None;
        };
        let host_bits = 32 - u32::from(self.prefix_len);
        if host_bits < 32 && u64::from(n) >= (1u64 << host_bits) {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(network) + n))
    }
}

impl FromStr for Cidr {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProvisionError::InvalidConfig(format!("invalid CIDR address: {}", s));

        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;

        let network = match addr {
            IpAddr::V4(v4) => {
                if prefix_len > 32 {
                    return Err(invalid());
                }
                let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                if prefix_len > 128 {
                    return Err(invalid());
                }
                let mask = u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        };

        Ok(Self { network, prefix_len })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// A contiguous port range, `base` through `base + size - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// First port
    pub base: u16,
    /// Number of ports
    pub size: u32,
}

impl PortRange {
    /// Last port in the range
    pub fn last(&self) -> u16 {
        let last = u32::from(self.base) + self.size.saturating_sub(1);
        u16::try_from(last).unwrap_or(u16::MAX)
    }
}

impl FromStr for PortRange {
    type Err = ProvisionError;

    /// Accepts `low-high` or a single port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| ProvisionError::InvalidConfig(format!("invalid port range {:?}: {}", s, why));
        let parse_port = |p: &str| -> Result<u16, ProvisionError> {
            match p.trim().parse::<u16>() {
                Ok(0) | Err(_) => Err(invalid("ports must be between 1 and 65535")),
                Ok(port) => Ok(port),
            }
        };

        let (low, high) = match s.split_once('-') {
            Some((low, high)) => (parse_port(low)?, parse_port(high)?),
            None => {
                let port = parse_port(s)?;
                (port, port)
            }
        };

        if high < low {
            return Err(invalid("end port is lower than start port"));
        }

        Ok(Self {
            base: low,
            size: u32::from(high) - u32::from(low) + 1,
        })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.last())
    }
}

/// Control plane configuration.
#[derive(Debug, Clone, Default)]
pub struct ControlConfig {
    /// Pod networks
    pub cluster_ip_ranges: Vec<Cidr>,
    /// Service networks
    pub service_ip_ranges: Vec<Cidr>,
    /// Cluster DNS service address
    pub cluster_dns: Option<Ipv4Addr>,
    /// Cluster DNS domain
    pub cluster_domain: String,
    /// Absolute data directory
    pub data_dir: PathBuf,
    /// NodePort range
    pub service_node_port_range: Option<PortRange>,
    /// Public HTTPS port
    pub https_port: u16,
    /// Port agents join on
    pub supervisor_port: u16,
    /// Internal API server port
    pub api_server_port: u16,
    /// Address the API server listens on
    pub api_server_bind_address: String,
    /// Explicit advertise/bind address, empty when unset
    pub bind_address: String,
    /// Run without an API server
    pub disable_api_server: bool,
    /// Cloud controller manager
    pub disable_ccm: bool,
    /// Run without the embedded etcd
    pub disable_etcd: bool,
    /// Run without kube-proxy
    pub disable_kube_proxy: bool,
    /// Network policy controller
    pub disable_npc: bool,
    /// Run controller manager and scheduler without their own election
    pub no_leader_elect: bool,
    /// Reset the cluster to a single member on start
    pub cluster_reset: bool,
    /// Packaged components that are not deployed (e.g. `coredns`)
    pub skips: BTreeSet<String>,
}

/// Server configuration handed to the control plane runtime.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Control plane settings
    pub control: ControlConfig,
    /// Run without host privileges
    pub rootless: bool,
    /// Do not deploy the service load balancer
    pub disable_service_lb: bool,
    /// Run the server without a local agent
    pub disable_agent: bool,
}

/// Settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `KUBESEED_DATA_DIR`, may contain `${HOME}`
    pub data_dir: String,
    /// `HOME`, used to expand the data dir
    pub home: Option<String>,
    /// `KUBESEED_BIND_ADDRESS`
    pub bind_address: Option<String>,
    /// `KUBESEED_NO_LEADER_ELECT`
    pub no_leader_elect: bool,
    /// `KUBESEED_K3S_BIN`
    pub k3s_bin: String,
    /// `KUBESEED_SERVER_TOKEN`, generated by the control plane when unset
    pub server_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: DEFAULT_DATA_DIR.to_string(),
            home: None,
            bind_address: None,
            no_leader_elect: false,
            k3s_bin: DEFAULT_K3S_BIN.to_string(),
            server_token: None,
        }
    }
}

impl Settings {
    /// Load settings from `KUBESEED_*` environment variables.
    pub fn from_env() -> Result<Self, ProvisionError> {
        let no_leader_elect = match env::var("KUBESEED_NO_LEADER_ELECT") {
            Ok(value) => parse_bool("KUBESEED_NO_LEADER_ELECT", &value)?,
            Err(_) => false,
        };

        Ok(Self {
            data_dir: env::var("KUBESEED_DATA_DIR")
                .unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string()),
            home: env::var("HOME").ok(),
            bind_address: env::var("KUBESEED_BIND_ADDRESS").ok().filter(|s| !s.is_empty()),
            no_leader_elect,
            k3s_bin: env::var("KUBESEED_K3S_BIN")
                .unwrap_or_else(|_| DEFAULT_K3S_BIN.to_string()),
            server_token: env::var("KUBESEED_SERVER_TOKEN").ok().filter(|s| !s.is_empty()),
        })
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ProvisionError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => Err(ProvisionError::InvalidConfig(format!(
            "{} must be a boolean, got {:?}",
            name, other
        ))),
    }
}

/// Resolve the data directory: expand `${HOME}`/`$HOME`/`~`, make it
/// absolute and create it.
pub fn resolve_data_dir(raw: &str, home: Option<&str>) -> Result<PathBuf, ProvisionError> {
    let invalid = |why: String| ProvisionError::InvalidConfig(format!("invalid data dir {}: {}", raw, why));

    let needs_home = raw.contains("${HOME}") || raw.contains("$HOME") || raw.starts_with('~');
    let expanded = if needs_home {
        let home = home
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("HOME is not set".to_string()))?;
        let replaced = raw.replace("${HOME}", home).replace("$HOME", home);
        match replaced.strip_prefix('~') {
            Some(rest) => format!("{}{}", home, rest),
            None => replaced,
        }
    } else {
        raw.to_string()
    };

    if expanded.trim().is_empty() {
        return Err(invalid("path is empty".to_string()));
    }

    let path = Path::new(&expanded);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_err(|e| invalid(e.to_string()))?.join(path)
    };

    std::fs::create_dir_all(&absolute).map_err(|e| invalid(e.to_string()))?;
    debug!(data_dir = %absolute.display(), "Resolved data directory");
    Ok(absolute)
}

/// Populate a server configuration for a single-node rootless control plane.
pub fn fill_server_config(cfg: &mut ServerConfig, settings: &Settings) -> Result<(), ProvisionError> {
    cfg.rootless = true;
    cfg.disable_service_lb = true;
    cfg.disable_agent = false;

    let control = &mut cfg.control;

    let cluster_cidr: Cidr = DEFAULT_CIDR.parse()
        .map_err(|e| ProvisionError::InvalidConfig(format!("invalid cluster-cidr {}: {}", DEFAULT_CIDR, e)))?;
    control.cluster_ip_ranges.push(cluster_cidr);

    let service_cidr: Cidr = DEFAULT_SERVICE_CIDR.parse()
        .map_err(|e| ProvisionError::InvalidConfig(format!("invalid service-cidr {}: {}", DEFAULT_SERVICE_CIDR, e)))?;
    control.service_ip_ranges.push(service_cidr);
    control.cluster_dns = service_cidr.nth_ipv4(CLUSTER_DNS_OFFSET);
    control.cluster_domain = DEFAULT_CLUSTER_DOMAIN.to_string();

    control.data_dir = resolve_data_dir(&settings.data_dir, settings.home.as_deref())?;

    let node_ports: PortRange = DEFAULT_NODE_PORT_RANGE.parse()
        .map_err(|e| ProvisionError::InvalidConfig(format!(
            "parse node port range failed: {}: {}",
            DEFAULT_NODE_PORT_RANGE, e
        )))?;
    control.service_node_port_range = Some(node_ports);

    control.https_port = DEFAULT_HTTPS_PORT;
    control.supervisor_port = DEFAULT_HTTPS_PORT;
    control.api_server_port = DEFAULT_HTTPS_PORT + 1;
    control.api_server_bind_address = "0.0.0.0".to_string();
    control.bind_address = settings.bind_address.clone().unwrap_or_default();

    control.disable_ccm = true;
    control.disable_etcd = false;
    control.disable_kube_proxy = true;
    control.disable_npc = true;
    control.no_leader_elect = settings.no_leader_elect;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(dir: &Path) -> Settings {
        Settings {
            data_dir: dir.join("data").to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fill_server_config_ports() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = ServerConfig::default();
        fill_server_config(&mut cfg, &test_settings(tmp.path())).unwrap();

        assert_eq!(cfg.control.https_port, 6443);
        assert_eq!(cfg.control.supervisor_port, 6443);
        assert_eq!(cfg.control.api_server_port, 6444);
        assert_eq!(cfg.control.api_server_port, cfg.control.https_port + 1);
        assert_eq!(cfg.control.supervisor_port, cfg.control.https_port);
    }

    #[test]
    fn test_fill_server_config_cidr_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = ServerConfig::default();
        fill_server_config(&mut cfg, &test_settings(tmp.path())).unwrap();

        assert_eq!(cfg.control.cluster_ip_ranges.len(), 1);
        let rendered = cfg.control.cluster_ip_ranges[0].to_string();
        assert_eq!(rendered, DEFAULT_CIDR);
        assert_eq!(rendered.parse::<Cidr>().unwrap(), cfg.control.cluster_ip_ranges[0]);
    }

    #[test]
    fn test_fill_server_config_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = ServerConfig::default();
        fill_server_config(&mut cfg, &test_settings(tmp.path())).unwrap();

        assert!(cfg.rootless);
        assert!(cfg.disable_service_lb);
        assert!(!cfg.disable_agent);
        assert!(cfg.control.disable_ccm);
        assert!(!cfg.control.disable_etcd);
        assert!(cfg.control.disable_kube_proxy);
        assert!(cfg.control.disable_npc);
        assert_eq!(cfg.control.api_server_bind_address, "0.0.0.0");
        assert_eq!(
            cfg.control.service_node_port_range,
            Some(PortRange { base: 30000, size: 2768 })
        );
        assert_eq!(cfg.control.cluster_dns, Some(Ipv4Addr::new(10, 43, 0, 10)));
        assert_eq!(cfg.control.cluster_domain, "cluster.local");
        assert!(cfg.control.data_dir.is_dir());
    }

    #[test]
    fn test_cidr_clears_host_bits() {
        let cidr: Cidr = "10.42.3.7/16".parse().unwrap();
        assert_eq!(cidr.to_string(), "10.42.0.0/16");
        assert_eq!(cidr.prefix_len(), 16);
    }

    #[test]
    fn test_cidr_rejects_garbage() {
        assert!("10.42.0.0".parse::<Cidr>().is_err());
        assert!("10.42.0.0/33".parse::<Cidr>().is_err());
        assert!("not-an-ip/8".parse::<Cidr>().is_err());
        assert!("fd00::/129".parse::<Cidr>().is_err());
        assert!("fd00::/64".parse::<Cidr>().is_ok());
    }

    #[test]
    fn test_cidr_nth_ipv4_stays_in_network() {
        let cidr: Cidr = "10.43.0.0/30".parse().unwrap();
        assert_eq!(cidr.nth_ipv4(3), Some(Ipv4Addr::new(10, 43, 0, 3)));
        assert_eq!(cidr.nth_ipv4(4), None);
    }

    #[test]
    fn test_port_range_parsing() {
        let range: PortRange = "30000-32767".parse().unwrap();
        assert_eq!(range.base, 30000);
        assert_eq!(range.last(), 32767);
        assert_eq!(range.to_string(), "30000-32767");

        let single: PortRange = "8080".parse().unwrap();
        assert_eq!(single.size, 1);

        assert!("32767-30000".parse::<PortRange>().is_err());
        assert!("0-10".parse::<PortRange>().is_err());
        assert!("a-b".parse::<PortRange>().is_err());
        assert!("30000-70000".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_resolve_data_dir_expands_home() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().to_string_lossy().into_owned();

        let resolved = resolve_data_dir(DEFAULT_DATA_DIR, Some(&home)).unwrap();
        assert_eq!(resolved, tmp.path().join(".kubeseed/"));
        assert!(resolved.is_dir());
    }

    #[test]
    fn test_resolve_data_dir_requires_home() {
        let err = resolve_data_dir(DEFAULT_DATA_DIR, None).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidConfig(_)));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(parse_bool("X", "1").unwrap());
        assert!(!parse_bool("X", "false").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
