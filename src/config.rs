//! Host configuration loaded from YAML, with builder pattern

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::control::actions::qm::MAX_SHUTDOWN_SECS;
use crate::orchestrator::MAX_EXPIRY_DAYS;
use crate::pool::{Ipv4Pool, Ipv6Pool, VmidRange};
use crate::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmhost/vmhost.yaml";
pub const DEFAULT_SOCKET_PATH: &str = "/run/vmhost/rootd.sock";

/// Longest grace period between suspension and destruction
pub const MAX_GRACE_DAYS: u32 = 3650;

/// Built-in action modules the daemon knows how to load
pub const BUILTIN_MODULES: &[&str] = &["qm", "network", "identity"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// SQLite lifecycle store
    pub db_file: PathBuf,
    /// Per-VM realizer artifacts (`<name>.tf.json`) live here
    pub terraform_dir: PathBuf,
    /// Rendered boot configuration snippets are copied here
    pub snippets_dir: PathBuf,
    pub bridge: String,
    pub storage: String,
    pub node_name: String,
    /// Template cloned by the realizer for every new VM
    pub template_vmid: u32,
    pub default_username: String,
    pub default_expiry_days: u32,
    pub vmid_range: VmidRange,
    pub ip_pool: Ipv4Pool,
    pub ipv6_pool: Option<Ipv6Pool>,
    pub tokens: TokenConfig,
    pub gc: GcConfig,
    pub daemon: DaemonConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub first_id: u64,
    /// No minter means tokens stay reserved but unminted
    pub minter: Option<MinterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinterConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// HTML page embedded (base64) into the token metadata
    #[serde(default)]
    pub signing_page: Option<PathBuf>,
    #[serde(default = "default_mint_timeout")]
    pub timeout_secs: u64,
}

fn default_mint_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub grace_days: u32,
    /// Bound passed to the graceful hypervisor shutdown
    pub shutdown_timeout_secs: u64,
    /// Escalate to a forced stop when the graceful shutdown fails
    pub force_on_failed_shutdown: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Octal file mode for the socket, e.g. "0660"
    pub socket_mode: String,
    /// Group owning the socket; its members may connect
    pub socket_gid: Option<u32>,
    /// The one unprivileged service account allowed besides root
    pub allowed_uid: Option<u32>,
    /// Accept uid 0 regardless of `allowed_uid`
    pub allow_root: bool,
    pub modules: Vec<String>,
    /// Path arguments must resolve inside one of these
    pub allowed_dirs: Vec<PathBuf>,
    pub identity_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            db_file: PathBuf::from("/var/lib/vmhost/vms.db"),
            terraform_dir: PathBuf::from("/var/lib/vmhost/terraform"),
            snippets_dir: PathBuf::from("/var/lib/vz/snippets"),
            bridge: "vmbr0".into(),
            storage: "local-lvm".into(),
            node_name: "pve".into(),
            template_vmid: 9000,
            default_username: "admin".into(),
            default_expiry_days: 30,
            vmid_range: VmidRange::default(),
            ip_pool: Ipv4Pool::new(
                "192.168.122.0/24",
                Ipv4Addr::new(192, 168, 122, 200),
                Ipv4Addr::new(192, 168, 122, 250),
            )
            .with_gateway(Ipv4Addr::new(192, 168, 122, 1)),
            ipv6_pool: None,
            tokens: TokenConfig::default(),
            gc: GcConfig::default(),
            daemon: DaemonConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            first_id: 1,
            minter: None,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_days: 7,
            shutdown_timeout_secs: 120,
            force_on_failed_shutdown: true,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_mode: "0660".into(),
            socket_gid: None,
            allowed_uid: None,
            allow_root: true,
            modules: BUILTIN_MODULES.iter().map(|m| m.to_string()).collect(),
            allowed_dirs: vec![PathBuf::from("/var/lib/vmhost"), PathBuf::from("/tmp")],
            identity_dir: PathBuf::from("/var/lib/vmhost/identity"),
            request_timeout_secs: 600,
            max_connections: 16,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { timeout_secs: 330 }
    }
}

impl DaemonConfig {
    pub fn socket_mode_bits(&self) -> Result<u32> {
        u32::from_str_radix(self.socket_mode.trim_start_matches("0o"), 8)
            .ok()
            .filter(|m| *m <= 0o777)
            .ok_or_else(|| Error::Config(format!("invalid socket_mode: {}", self.socket_mode)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl HostConfig {
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::default()
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_yaml(&raw)?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: HostConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.vmid_range.validate()?;
        self.ip_pool.validate()?;
        if let Some(v6) = &self.ipv6_pool {
            v6.validate()?;
        }
        if self.bridge.is_empty() {
            return Err(Error::Config("bridge cannot be empty".into()));
        }
        if self.default_username.is_empty() {
            return Err(Error::Config("default_username cannot be empty".into()));
        }
        if !(1..=MAX_EXPIRY_DAYS).contains(&self.default_expiry_days) {
            return Err(Error::Config(format!(
                "default_expiry_days must be between 1 and {}",
                MAX_EXPIRY_DAYS
            )));
        }
        if self.gc.grace_days > MAX_GRACE_DAYS {
            return Err(Error::Config(format!("gc.grace_days must be at most {}", MAX_GRACE_DAYS)));
        }
        // The daemon rejects longer shutdowns, and the client must outwait them
        let shutdown = self.gc.shutdown_timeout_secs;
        if !(1..=MAX_SHUTDOWN_SECS).contains(&shutdown) {
            return Err(Error::Config(format!(
                "gc.shutdown_timeout_secs must be between 1 and {}",
                MAX_SHUTDOWN_SECS
            )));
        }
        if shutdown >= self.client.timeout_secs || shutdown >= self.daemon.request_timeout_secs {
            return Err(Error::Config(format!(
                "gc.shutdown_timeout_secs ({}) must be below client.timeout_secs ({}) and daemon.request_timeout_secs ({})",
                shutdown, self.client.timeout_secs, self.daemon.request_timeout_secs
            )));
        }
        if self.tokens.first_id == 0 {
            return Err(Error::Config("tokens.first_id must be at least 1".into()));
        }
        if self.client.timeout_secs == 0 {
            return Err(Error::Config("client.timeout_secs must be positive".into()));
        }
        self.daemon.socket_mode_bits()?;
        if self.daemon.max_connections == 0 {
            return Err(Error::Config("daemon.max_connections must be positive".into()));
        }
        for dir in &self.daemon.allowed_dirs {
            if !dir.is_absolute() {
                return Err(Error::Config(format!(
                    "allowed_dirs entry must be absolute: {}",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    pub fn db_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_file = path.into();
        self
    }

    pub fn terraform_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.terraform_dir = path.into();
        self
    }

    pub fn snippets_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.snippets_dir = path.into();
        self
    }

    pub fn ip_pool(mut self, pool: Ipv4Pool) -> Self {
        self.config.ip_pool = pool;
        self
    }

    pub fn ipv6_pool(mut self, pool: Ipv6Pool) -> Self {
        self.config.ipv6_pool = Some(pool);
        self
    }

    pub fn vmid_range(mut self, start: u32, end: u32) -> Self {
        self.config.vmid_range = VmidRange::new(start, end);
        self
    }

    pub fn grace_days(mut self, days: u32) -> Self {
        self.config.gc.grace_days = days;
        self
    }

    pub fn first_token_id(mut self, id: u64) -> Self {
        self.config.tokens.first_id = id;
        self
    }

    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.daemon.socket_path = path.into();
        self
    }

    pub fn allowed_uid(mut self, uid: u32) -> Self {
        self.config.daemon.allowed_uid = Some(uid);
        self
    }

    pub fn allow_root(mut self, allow: bool) -> Self {
        self.config.daemon.allow_root = allow;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.daemon.request_timeout_secs = secs;
        self
    }

    pub fn allowed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.daemon.allowed_dirs.push(dir.into());
        self
    }

    pub fn identity_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.daemon.identity_dir = dir.into();
        self
    }

    pub fn modules(mut self, modules: &[&str]) -> Self {
        self.config.daemon.modules = modules.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn client_timeout_secs(mut self, secs: u64) -> Self {
        self.config.client.timeout_secs = secs;
        self
    }

    pub fn build(self) -> HostConfig {
        self.config
    }

    pub fn build_validated(self) -> Result<HostConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}
