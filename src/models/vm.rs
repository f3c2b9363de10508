//! VM record model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Persisted lifecycle status of a VM record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Allocated, realize step not yet confirmed
    Provisioning,
    Active,
    Suspended,
    /// Tombstone; allocations released
    Destroyed,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmStatus::Provisioning => write!(f, "provisioning"),
            VmStatus::Active => write!(f, "active"),
            VmStatus::Suspended => write!(f, "suspended"),
            VmStatus::Destroyed => write!(f, "destroyed"),
        }
    }
}

impl std::str::FromStr for VmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(VmStatus::Provisioning),
            "active" => Ok(VmStatus::Active),
            "suspended" => Ok(VmStatus::Suspended),
            "destroyed" => Ok(VmStatus::Destroyed),
            other => Err(format!("unknown vm status '{}'", other)),
        }
    }
}

impl VmStatus {
    /// Whether the record still holds its address and identifier
    pub fn is_live(&self) -> bool {
        !matches!(self, VmStatus::Destroyed)
    }
}

/// Answer to a status query. Never an error: `Unknown` covers both a missing
/// record and a hypervisor that disagrees with the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Active,
    Suspended,
    Destroyed,
    Unknown,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Active => write!(f, "active"),
            VmState::Suspended => write!(f, "suspended"),
            VmState::Destroyed => write!(f, "destroyed"),
            VmState::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<VmStatus> for VmState {
    fn from(status: VmStatus) -> Self {
        match status {
            VmStatus::Active => VmState::Active,
            VmStatus::Suspended => VmState::Suspended,
            VmStatus::Destroyed => VmState::Destroyed,
            VmStatus::Provisioning => VmState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MintStatus {
    Unminted,
    Minted,
    /// The id is burned and will never be handed out again
    Failed,
}

impl std::fmt::Display for MintStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MintStatus::Unminted => write!(f, "unminted"),
            MintStatus::Minted => write!(f, "minted"),
            MintStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for MintStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unminted" => Ok(MintStatus::Unminted),
            "minted" => Ok(MintStatus::Minted),
            "failed" => Ok(MintStatus::Failed),
            other => Err(format!("unknown mint status '{}'", other)),
        }
    }
}

/// One provisioned machine. The name is the only external identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    /// Proxmox VMID
    pub vmid: u32,
    pub ip: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
    pub status: VmStatus,
    pub owner: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token_id: Option<u64>,
    pub mint_status: MintStatus,
    pub updated_at: DateTime<Utc>,
}

impl VmRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Expired for longer than the grace period. A grace period reaching
    /// past the representable calendar never ends.
    pub fn is_past_grace(&self, now: DateTime<Utc>, grace_days: u32) -> bool {
        add_days(self.expires_at, grace_days).is_some_and(|end| end < now)
    }
}

/// `t` plus whole days, or `None` when that leaves the representable range
pub fn add_days(t: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    t.checked_add_signed(Duration::days(days as i64))
}

/// Everything the orchestrator needs to create a VM
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: String,
    pub owner: String,
    pub username: Option<String>,
    pub cpu: u32,
    pub memory_mb: u64,
    pub disk_gb: u32,
    pub expiry_days: Option<u32>,
    /// Rendered boot configuration (cloud-init user data) produced upstream
    pub rendered_config: Option<std::path::PathBuf>,
    /// When false only a plan is produced and nothing is allocated
    pub apply: bool,
}

impl CreateRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cpu: 1,
            memory_mb: 2048,
            disk_gb: 10,
            ..Default::default()
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = mb;
        self
    }

    pub fn disk_gb(mut self, gb: u32) -> Self {
        self.disk_gb = gb;
        self
    }

    pub fn expiry_days(mut self, days: u32) -> Self {
        self.expiry_days = Some(days);
        self
    }

    pub fn rendered_config(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.rendered_config = Some(path.into());
        self
    }

    pub fn apply(mut self, apply: bool) -> Self {
        self.apply = apply;
        self
    }
}

/// Resolved machine description handed to the realizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub vmid: u32,
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub cpu: u32,
    pub memory_mb: u64,
    pub disk_gb: u32,
    pub username: String,
    pub rendered_config: Option<std::path::PathBuf>,
}

/// Machine-readable result of a create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub status: String,
    pub vm_name: String,
    pub ip: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
    pub vmid: u32,
    pub token_id: Option<u64>,
    pub username: String,
    /// True when nothing was applied and nothing was allocated
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
    /// Realizer plan text for a dry run; not part of the JSON output
    #[serde(skip)]
    pub plan: Option<String>,
}

/// One row of `list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSummary {
    pub name: String,
    pub status: VmStatus,
    pub address: Ipv4Addr,
    pub created: DateTime<Utc>,
}

impl From<&VmRecord> for VmSummary {
    fn from(r: &VmRecord) -> Self {
        Self {
            name: r.name.clone(),
            status: r.status,
            address: r.ip,
            created: r.created_at,
        }
    }
}
