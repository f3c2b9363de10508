//! Lifecycle orchestrator: create, destroy, start, stop, kill, status, resume
//!
//! Composes the lifecycle store, the allocation pools, the control client
//! and the realizer. All privileged work goes through [`ControlPlane`]; all
//! state goes through [`Database`].

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::{Arc, LazyLock};

use crate::config::HostConfig;
use crate::control::{Action, ControlError, ControlPlane};
use crate::db::{Database, NewVm};
use crate::mint::TokenMinter;
use crate::models::*;
use crate::pool::AllocationPools;
use crate::realizer::Realizer;
use crate::{Error, Result};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("name regex is valid")
});
static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("username regex is valid"));
static WALLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("wallet regex is valid"));

pub const MAX_CPU: u32 = 64;
pub const MIN_MEMORY_MB: u64 = 512;
pub const MAX_MEMORY_MB: u64 = 256 * 1024;
pub const MAX_DISK_GB: u32 = 4096;
pub const MAX_EXPIRY_DAYS: u32 = 3650;

pub fn validate_name(name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid VM name '{}': use letters, digits and inner hyphens, at most 63 characters",
            name.escape_debug()
        )))
    }
}

fn validate_request(req: &CreateRequest) -> Result<()> {
    validate_name(&req.name)?;
    if !req.owner.is_empty() && !WALLET_RE.is_match(&req.owner) {
        return Err(Error::Validation(format!(
            "owner must be a 0x-prefixed wallet address, got '{}'",
            req.owner.escape_debug()
        )));
    }
    if let Some(user) = &req.username {
        if !USERNAME_RE.is_match(user) {
            return Err(Error::Validation(format!("invalid username '{}'", user.escape_debug())));
        }
    }
    if !(1..=MAX_CPU).contains(&req.cpu) {
        return Err(Error::Validation(format!("cpu must be between 1 and {}", MAX_CPU)));
    }
    if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&req.memory_mb) {
        return Err(Error::Validation(format!(
            "memory must be between {} and {} MiB",
            MIN_MEMORY_MB, MAX_MEMORY_MB
        )));
    }
    if !(1..=MAX_DISK_GB).contains(&req.disk_gb) {
        return Err(Error::Validation(format!("disk must be between 1 and {} GiB", MAX_DISK_GB)));
    }
    if let Some(days) = req.expiry_days {
        if !(1..=MAX_EXPIRY_DAYS).contains(&days) {
            return Err(Error::Validation(format!(
                "expiry must be between 1 and {} days",
                MAX_EXPIRY_DAYS
            )));
        }
    }
    if let Some(path) = &req.rendered_config {
        if !path.is_file() {
            return Err(Error::Validation(format!(
                "rendered config {} is not a readable file",
                path.display()
            )));
        }
    }
    Ok(())
}

fn expiry_after(from: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>> {
    if !(1..=MAX_EXPIRY_DAYS).contains(&days) {
        return Err(Error::Validation(format!(
            "expiry must be between 1 and {} days",
            MAX_EXPIRY_DAYS
        )));
    }
    add_days(from, days).ok_or_else(|| Error::Validation(format!("expiry of {} days is out of range", days)))
}

/// Manages the lifecycle of every VM on this host
pub struct Orchestrator {
    db: Database,
    pools: AllocationPools,
    control: Arc<dyn ControlPlane>,
    realizer: Arc<dyn Realizer>,
    minter: Option<Arc<dyn TokenMinter>>,
    config: HostConfig,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        control: Arc<dyn ControlPlane>,
        realizer: Arc<dyn Realizer>,
        config: HostConfig,
    ) -> Self {
        Self {
            db,
            pools: AllocationPools::from_config(&config),
            control,
            realizer,
            minter: None,
            config,
        }
    }

    pub fn with_minter(mut self, minter: Arc<dyn TokenMinter>) -> Self {
        self.minter = Some(minter);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    fn call(&self, action: Action) -> Result<String> {
        Ok(self.control.call(&action)?)
    }

    fn record(&self, name: &str) -> Result<VmRecord> {
        self.db
            .get_vm_by_name(name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn spec_for(&self, record: &VmRecord, req: &CreateRequest) -> Result<VmSpec> {
        Ok(VmSpec {
            name: record.name.clone(),
            vmid: record.vmid,
            ip: record.ip,
            prefix_len: self.pools.ip.prefix_len()?,
            gateway: self.pools.ip.gateway,
            ipv6: record.ipv6,
            cpu: req.cpu,
            memory_mb: req.memory_mb,
            disk_gb: req.disk_gb,
            username: record.username.clone(),
            rendered_config: req.rendered_config.clone(),
        })
    }

    /// Create a VM. Without `apply` only a plan is produced and nothing is
    /// reserved.
    pub fn create(&self, req: &CreateRequest) -> Result<CreateOutcome> {
        validate_request(req)?;
        let now = Utc::now();
        let username = req
            .username
            .clone()
            .unwrap_or_else(|| self.config.default_username.clone());
        let expiry_days = req.expiry_days.unwrap_or(self.config.default_expiry_days);
        let expires_at = expiry_after(now, expiry_days)?;

        if !req.apply {
            return self.plan_create(req, username, expires_at);
        }

        // Reserve before realizing so a crash leaves an inspectable record
        let record = self.db.reserve_vm(
            &NewVm {
                name: req.name.clone(),
                owner: req.owner.clone(),
                username: username.clone(),
                created_at: now,
                expires_at,
            },
            &self.pools,
        )?;
        tracing::info!(vm = %record.name, vmid = record.vmid, ip = %record.ip, "VM reserved");

        let token_id = if record.owner.is_empty() {
            None
        } else {
            Some(self.db.reserve_token_id(&record.name, self.config.tokens.first_id)?)
        };

        let spec = self.spec_for(&record, req)?;
        if let Err(e) = self.realizer.apply(&spec) {
            tracing::error!(vm = %record.name, error = %e, "Realize step failed, record left provisioning");
            return Err(e);
        }
        let record = self
            .db
            .transition(&record.name, &[VmStatus::Provisioning], VmStatus::Active)?;

        self.ensure_route(&record);
        if let Some(id) = token_id {
            self.set_identity(&record, id);
            self.mint(&record, id);
        }

        tracing::info!(vm = %record.name, vmid = record.vmid, "VM created");
        Ok(CreateOutcome {
            status: "ok".into(),
            vm_name: record.name,
            ip: record.ip,
            ipv6: record.ipv6,
            vmid: record.vmid,
            token_id,
            username,
            dry_run: false,
            plan: None,
        })
    }

    fn plan_create(&self, req: &CreateRequest, username: String, expires_at: DateTime<Utc>) -> Result<CreateOutcome> {
        let alloc = self.db.preview_allocation(&req.name, &self.pools)?;
        let now = Utc::now();
        let preview = VmRecord {
            name: req.name.clone(),
            vmid: alloc.vmid,
            ip: alloc.ip,
            ipv6: alloc.ipv6,
            status: VmStatus::Provisioning,
            owner: req.owner.clone(),
            username: username.clone(),
            created_at: now,
            expires_at,
            token_id: None,
            mint_status: MintStatus::Unminted,
            updated_at: now,
        };
        let plan = self.realizer.plan(&self.spec_for(&preview, req)?)?;
        Ok(CreateOutcome {
            status: "ok".into(),
            vm_name: preview.name,
            ip: alloc.ip,
            ipv6: alloc.ipv6,
            vmid: alloc.vmid,
            token_id: None,
            username,
            dry_run: true,
            plan: Some(plan),
        })
    }

    /// Host route for the VM's IPv6 address. Adding an existing route succeeds.
    fn ensure_route(&self, record: &VmRecord) {
        let Some(address) = record.ipv6 else { return };
        let action = Action::Ip6RouteAdd {
            address,
            dev: self.config.bridge.clone(),
        };
        if let Err(e) = self.call(action) {
            tracing::warn!(vm = %record.name, %address, error = %e, "Failed to add IPv6 route");
        }
    }

    fn set_identity(&self, record: &VmRecord, token_id: u64) {
        let action = Action::IdentitySet {
            vmid: record.vmid,
            token_id,
            owner: record.owner.clone(),
        };
        if let Err(e) = self.call(action) {
            tracing::warn!(vm = %record.name, token_id, error = %e, "Failed to write VM identity");
        }
    }

    /// Mint the reserved token. A failure burns the id.
    fn mint(&self, record: &VmRecord, token_id: u64) -> MintStatus {
        let Some(minter) = &self.minter else {
            tracing::debug!(vm = %record.name, token_id, "No minter configured, token left unminted");
            return MintStatus::Unminted;
        };
        let (status, result) = match minter.mint(&record.owner, &record.name, token_id) {
            Ok(confirmation) => {
                tracing::info!(vm = %record.name, token_id, %confirmation, "Token minted");
                (MintStatus::Minted, self.db.mark_token_minted(&record.name, token_id))
            }
            Err(e) => {
                tracing::warn!(vm = %record.name, token_id, error = %e, "Mint failed, token id burned");
                (MintStatus::Failed, self.db.mark_token_failed(&record.name, token_id))
            }
        };
        if let Err(e) = result {
            tracing::error!(vm = %record.name, token_id, error = %e, "Cannot record mint outcome");
        }
        status
    }

    /// Retry a mint with a freshly reserved token id. The previous id, if
    /// any, stays burned.
    pub fn retry_mint(&self, name: &str) -> Result<u64> {
        if self.minter.is_none() {
            return Err(Error::Config("no token minter configured".into()));
        }
        let record = self.record(name)?;
        if !record.status.is_live() {
            return Err(Error::Conflict(format!("VM '{}' is {}", name, record.status)));
        }
        if record.owner.is_empty() {
            return Err(Error::Validation(format!("VM '{}' has no owner", name)));
        }
        if record.mint_status == MintStatus::Minted {
            return Err(Error::Conflict(format!("token for '{}' is already minted", name)));
        }
        if let Some(old) = record.token_id {
            self.db.mark_token_failed(name, old)?;
        }

        let token_id = self.db.reserve_token_id(name, self.config.tokens.first_id)?;
        match self.mint(&record, token_id) {
            MintStatus::Minted => {
                self.set_identity(&record, token_id);
                Ok(token_id)
            }
            _ => Err(Error::ExternalTool(format!("mint of token {} for '{}' failed", token_id, name))),
        }
    }

    /// Destroy a VM. Destroying an already destroyed VM is a successful
    /// no-op; returns whether anything was done.
    pub fn destroy(&self, name: &str) -> Result<bool> {
        let record = self.record(name)?;
        if record.status == VmStatus::Destroyed {
            tracing::info!(vm = %name, "VM already destroyed");
            return Ok(false);
        }

        if record.status == VmStatus::Active {
            match self.call(Action::QmStop { vmid: record.vmid }) {
                Ok(_) => {}
                // The VM may already be off or gone
                Err(Error::Control(ControlError::Remote { message, .. })) => {
                    tracing::warn!(vm = %name, error = %message, "Force stop before destroy failed");
                }
                Err(e) => return Err(e),
            }
        }

        if !self.realizer.destroy(name)? {
            self.purge(&record)?;
        }

        if let Some(address) = record.ipv6 {
            let action = Action::Ip6RouteDel {
                address,
                dev: self.config.bridge.clone(),
            };
            if let Err(e) = self.call(action) {
                tracing::warn!(vm = %name, %address, error = %e, "Failed to remove IPv6 route");
            }
        }
        if record.token_id.is_some() {
            if let Err(e) = self.call(Action::IdentityClear { vmid: record.vmid }) {
                tracing::warn!(vm = %name, error = %e, "Failed to clear VM identity");
            }
        }

        self.realizer.remove_artifacts(name)?;
        self.db.mark_destroyed(name)?;
        tracing::info!(vm = %name, vmid = record.vmid, ip = %record.ip, "VM destroyed, allocation released");
        Ok(true)
    }

    /// Remove the machine and its disks directly on the hypervisor, for VMs
    /// the realizer no longer tracks (e.g. brought back by `resume`). A VM
    /// that is already gone counts as removed.
    fn purge(&self, record: &VmRecord) -> Result<()> {
        match self.call(Action::QmDestroy { vmid: record.vmid }) {
            Ok(_) => {
                tracing::info!(vm = %record.name, vmid = record.vmid, "VM purged on hypervisor");
                Ok(())
            }
            Err(Error::Control(ControlError::Remote { message, .. })) if message.contains("does not exist") => {
                tracing::debug!(vm = %record.name, vmid = record.vmid, "VM already gone from hypervisor");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn start(&self, name: &str) -> Result<()> {
        let record = self.record(name)?;
        match record.status {
            VmStatus::Active => {
                tracing::info!(vm = %name, "VM already active");
                Ok(())
            }
            VmStatus::Suspended => self.power_on(&record),
            other => Err(Error::Conflict(format!("VM '{}' is {}, cannot start", name, other))),
        }
    }

    fn power_on(&self, record: &VmRecord) -> Result<()> {
        self.call(Action::QmStart { vmid: record.vmid })?;
        self.ensure_route(record);
        self.db
            .transition(&record.name, &[VmStatus::Suspended], VmStatus::Active)?;
        tracing::info!(vm = %record.name, vmid = record.vmid, "VM started");
        Ok(())
    }

    /// Orderly guest shutdown, bounded by the configured shutdown timeout
    pub fn stop(&self, name: &str) -> Result<()> {
        self.power_off(name, true)
    }

    /// Immediate power-off
    pub fn kill(&self, name: &str) -> Result<()> {
        self.power_off(name, false)
    }

    fn power_off(&self, name: &str, graceful: bool) -> Result<()> {
        let record = self.record(name)?;
        match record.status {
            VmStatus::Active => {}
            VmStatus::Suspended => {
                tracing::info!(vm = %name, "VM already suspended");
                return Ok(());
            }
            other => {
                return Err(Error::Conflict(format!("VM '{}' is {}, cannot stop", name, other)));
            }
        }
        self.halt(&record, graceful)?;
        self.mark_suspended(name)
    }

    /// Send the hypervisor stop request without touching the store
    pub(crate) fn halt(&self, record: &VmRecord, graceful: bool) -> Result<()> {
        let action = if graceful {
            Action::QmShutdown {
                vmid: record.vmid,
                timeout_secs: Some(self.config.gc.shutdown_timeout_secs),
            }
        } else {
            Action::QmStop { vmid: record.vmid }
        };
        tracing::info!(vm = %record.name, vmid = record.vmid, graceful, "Stopping VM");
        self.call(action)?;
        Ok(())
    }

    pub(crate) fn mark_suspended(&self, name: &str) -> Result<()> {
        self.db
            .transition(name, &[VmStatus::Active], VmStatus::Suspended)?;
        Ok(())
    }

    /// Current state. Never fails: anything that cannot be determined, or
    /// where the hypervisor disagrees with the record, is `Unknown`.
    pub fn status(&self, name: &str) -> VmState {
        let record = match self.db.get_vm_by_name(name) {
            Ok(Some(r)) => r,
            Ok(None) => return VmState::Unknown,
            Err(e) => {
                tracing::warn!(vm = %name, error = %e, "Cannot read lifecycle store");
                return VmState::Unknown;
            }
        };
        let recorded = VmState::from(record.status);
        if !matches!(record.status, VmStatus::Active | VmStatus::Suspended) {
            return recorded;
        }

        match self.control.call(&Action::QmStatus { vmid: record.vmid }) {
            Ok(out) => {
                let running = out.split_whitespace().last() == Some("running");
                match (record.status, running) {
                    (VmStatus::Active, true) | (VmStatus::Suspended, false) => recorded,
                    _ => {
                        tracing::warn!(vm = %name, recorded = %record.status, hypervisor = %out.trim(), "Hypervisor disagrees with record");
                        VmState::Unknown
                    }
                }
            }
            Err(ControlError::Remote { message, .. }) => {
                tracing::warn!(vm = %name, error = %message, "Hypervisor does not know this VM");
                VmState::Unknown
            }
            Err(e) => {
                tracing::debug!(vm = %name, error = %e, "Cannot reach control daemon, reporting recorded state");
                recorded
            }
        }
    }

    pub fn list(&self) -> Result<Vec<VmSummary>> {
        Ok(self.db.list_vms()?.iter().map(VmSummary::from).collect())
    }

    /// Extend expiry and bring the VM back to active. From destroyed this
    /// only works while the hypervisor still has the machine and its
    /// address and identifier are still free.
    pub fn resume(&self, name: &str, extend_days: u32, dry_run: bool) -> Result<VmRecord> {
        if extend_days == 0 || extend_days > MAX_EXPIRY_DAYS {
            return Err(Error::Validation(format!(
                "extend days must be between 1 and {}",
                MAX_EXPIRY_DAYS
            )));
        }
        let record = self.record(name)?;
        let base = record.expires_at.max(Utc::now());
        let expires_at = expiry_after(base, extend_days)?;

        match record.status {
            VmStatus::Provisioning => {
                return Err(Error::Conflict(format!("VM '{}' is still provisioning", name)));
            }
            VmStatus::Destroyed => {
                if let Err(e) = self.call(Action::QmStatus { vmid: record.vmid }) {
                    return Err(match e {
                        Error::Control(ControlError::Remote { .. }) => Error::Conflict(format!(
                            "disk of '{}' no longer exists, create a new VM instead",
                            name
                        )),
                        other => other,
                    });
                }
            }
            VmStatus::Active | VmStatus::Suspended => {}
        }

        if dry_run {
            tracing::info!(vm = %name, status = %record.status, %expires_at, "Resume dry run");
            return Ok(VmRecord {
                status: VmStatus::Active,
                expires_at,
                ..record
            });
        }

        match record.status {
            VmStatus::Destroyed => {
                let reclaimed = self.db.reactivate(name, expires_at)?;
                if let Some(id) = reclaimed.token_id {
                    self.set_identity(&reclaimed, id);
                }
                self.power_on(&reclaimed)?;
            }
            VmStatus::Suspended => {
                self.db.extend_expiry(name, expires_at)?;
                self.power_on(&record)?;
            }
            _ => self.db.extend_expiry(name, expires_at)?,
        }
        tracing::info!(vm = %name, %expires_at, "VM resumed");
        self.record(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::client::MockControlPlane;
    use crate::control::ErrorKind;
    use crate::mint::MockTokenMinter;
    use crate::pool::Ipv4Pool;
    use crate::realizer::MockRealizer;
    use std::net::Ipv4Addr;

    const WALLET: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    fn config() -> HostConfig {
        HostConfig::builder()
            .ip_pool(Ipv4Pool::new(
                "10.0.0.0/24",
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
            ))
            .build()
    }

    fn permissive_control() -> MockControlPlane {
        let mut control = MockControlPlane::new();
        control.expect_call().returning(|_| Ok(String::new()));
        control
    }

    fn applying_realizer() -> MockRealizer {
        let mut realizer = MockRealizer::new();
        realizer.expect_apply().returning(|_| Ok(()));
        realizer.expect_destroy().returning(|_| Ok(true));
        realizer.expect_remove_artifacts().returning(|_| Ok(()));
        realizer
    }

    fn orchestrator(control: MockControlPlane, realizer: MockRealizer) -> Orchestrator {
        Orchestrator::new(
            Database::in_memory().unwrap(),
            Arc::new(control),
            Arc::new(realizer),
            config(),
        )
    }

    #[test]
    fn test_validation_rejects_before_reserving() {
        let mut realizer = MockRealizer::new();
        realizer.expect_apply().never();
        let orch = orchestrator(MockControlPlane::new(), realizer);

        for req in [
            CreateRequest::new("bad name").apply(true),
            CreateRequest::new("-lead").apply(true),
            CreateRequest::new("vm-a").owner("bob").apply(true),
            CreateRequest::new("vm-a").cpu(0).apply(true),
            CreateRequest::new("vm-a").memory_mb(128).apply(true),
            CreateRequest::new("vm-a").username("Root;").apply(true),
            CreateRequest::new("vm-a").rendered_config("/nonexistent/user-data").apply(true),
        ] {
            assert!(matches!(orch.create(&req), Err(Error::Validation(_))), "{:?}", req);
        }
        assert!(orch.db().list_vms().unwrap().is_empty());
    }

    #[test]
    fn test_out_of_range_default_expiry_is_rejected() {
        let mut config = config();
        config.default_expiry_days = u32::MAX;
        let mut realizer = MockRealizer::new();
        realizer.expect_apply().never();
        let orch = Orchestrator::new(
            Database::in_memory().unwrap(),
            Arc::new(MockControlPlane::new()),
            Arc::new(realizer),
            config,
        );

        let err = orch.create(&CreateRequest::new("vm-a").apply(true)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{:?}", err);
        assert!(orch.db().list_vms().unwrap().is_empty());
    }

    #[test]
    fn test_dry_run_allocates_nothing() {
        let mut realizer = MockRealizer::new();
        realizer.expect_plan().times(1).returning(|_| Ok("Plan: 1 to add".into()));
        realizer.expect_apply().never();
        let orch = orchestrator(MockControlPlane::new(), realizer);

        let out = orch.create(&CreateRequest::new("vm-a")).unwrap();
        assert!(out.dry_run);
        assert_eq!(out.ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(out.plan.as_deref(), Some("Plan: 1 to add"));
        assert!(orch.db().list_vms().unwrap().is_empty());
    }

    #[test]
    fn test_apply_failure_leaves_provisioning_record() {
        let mut realizer = MockRealizer::new();
        realizer
            .expect_apply()
            .returning(|_| Err(Error::ExternalTool("Error: template 9000 not found".into())));
        let orch = orchestrator(MockControlPlane::new(), realizer);

        let err = orch.create(&CreateRequest::new("vm-a").apply(true)).unwrap_err();
        assert_eq!(err.to_string(), "Error: template 9000 not found");
        let rec = orch.db().get_vm_by_name("vm-a").unwrap().unwrap();
        assert_eq!(rec.status, VmStatus::Provisioning);
        assert_eq!(orch.status("vm-a"), VmState::Unknown);
    }

    #[test]
    fn test_create_mints_and_sets_identity() {
        let mut control = MockControlPlane::new();
        control
            .expect_call()
            .withf(|a| matches!(a, Action::IdentitySet { token_id: 1, .. }))
            .times(1)
            .returning(|_| Ok(String::new()));
        let mut minter = MockTokenMinter::new();
        minter
            .expect_mint()
            .withf(|owner, machine, id| owner == WALLET && machine == "vm-a" && *id == 1)
            .returning(|_, _, _| Ok("0xabc".into()));

        let orch = orchestrator(control, applying_realizer()).with_minter(Arc::new(minter));
        let out = orch
            .create(&CreateRequest::new("vm-a").owner(WALLET).apply(true))
            .unwrap();
        assert_eq!(out.token_id, Some(1));
        let rec = orch.db().get_vm_by_name("vm-a").unwrap().unwrap();
        assert_eq!(rec.status, VmStatus::Active);
        assert_eq!(rec.mint_status, MintStatus::Minted);
    }

    #[test]
    fn test_failed_mint_burns_id_and_retry_uses_fresh_one() {
        let mut minter = MockTokenMinter::new();
        let mut seq = mockall::Sequence::new();
        minter
            .expect_mint()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(Error::ExternalTool("rpc down".into())));
        minter
            .expect_mint()
            .withf(|_, _, id| *id == 2)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok("0xabc".into()));

        let orch = orchestrator(permissive_control(), applying_realizer()).with_minter(Arc::new(minter));
        orch.create(&CreateRequest::new("vm-a").owner(WALLET).apply(true))
            .unwrap();
        assert_eq!(
            orch.db().get_vm_by_name("vm-a").unwrap().unwrap().mint_status,
            MintStatus::Failed
        );

        assert_eq!(orch.retry_mint("vm-a").unwrap(), 2);
        let ledger = orch.db().list_tokens().unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].status, MintStatus::Failed);
        assert_eq!(ledger[1].status, MintStatus::Minted);
        assert!(matches!(orch.retry_mint("vm-a"), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_destroy_active_kills_first_and_is_idempotent() {
        let mut control = MockControlPlane::new();
        let mut seq = mockall::Sequence::new();
        control
            .expect_call()
            .withf(|a| matches!(a, Action::QmStop { .. }))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(String::new()));
        let orch = orchestrator(control, applying_realizer());
        orch.create(&CreateRequest::new("vm-a").apply(true)).unwrap();

        assert!(orch.destroy("vm-a").unwrap());
        assert!(!orch.destroy("vm-a").unwrap());
        assert_eq!(orch.status("vm-a"), VmState::Destroyed);
        assert!(matches!(orch.destroy("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_destroy_tolerates_cleanup_failures() {
        let mut control = MockControlPlane::new();
        control.expect_call().returning(|a| match a {
            Action::Ip6RouteDel { .. } | Action::IdentityClear { .. } => Err(ControlError::Remote {
                kind: ErrorKind::ExternalTool,
                message: "No such process".into(),
            }),
            _ => Ok(String::new()),
        });
        let orch = orchestrator(control, applying_realizer());
        orch.create(&CreateRequest::new("vm-a").owner(WALLET).apply(true))
            .unwrap();
        orch.kill("vm-a").unwrap();
        assert!(orch.destroy("vm-a").unwrap());
    }

    fn untracked_realizer() -> MockRealizer {
        let mut realizer = MockRealizer::new();
        realizer.expect_apply().returning(|_| Ok(()));
        realizer.expect_destroy().returning(|_| Ok(false));
        realizer.expect_remove_artifacts().returning(|_| Ok(()));
        realizer
    }

    #[test]
    fn test_destroy_purges_untracked_vm() {
        let mut control = MockControlPlane::new();
        control
            .expect_call()
            .withf(|a| matches!(a, Action::QmDestroy { .. }))
            .times(1)
            .returning(|_| {
                Err(ControlError::Remote {
                    kind: ErrorKind::ExternalTool,
                    message: "Configuration file 'nodes/pve/qemu-server/100.conf' does not exist".into(),
                })
            });
        control.expect_call().returning(|_| Ok(String::new()));
        let orch = orchestrator(control, untracked_realizer());
        orch.create(&CreateRequest::new("vm-a").apply(true)).unwrap();

        assert!(orch.destroy("vm-a").unwrap());
        assert_eq!(orch.status("vm-a"), VmState::Destroyed);
    }

    #[test]
    fn test_failed_purge_keeps_allocation() {
        let mut control = MockControlPlane::new();
        control.expect_call().returning(|a| match a {
            Action::QmDestroy { .. } => Err(ControlError::Remote {
                kind: ErrorKind::ExternalTool,
                message: "VM is locked (backup)".into(),
            }),
            _ => Ok(String::new()),
        });
        let orch = orchestrator(control, untracked_realizer());
        let out = orch.create(&CreateRequest::new("vm-a").apply(true)).unwrap();

        assert!(orch.destroy("vm-a").is_err());
        let rec = orch.db().get_vm_by_name("vm-a").unwrap().unwrap();
        assert_eq!(rec.status, VmStatus::Active);
        assert_eq!(rec.vmid, out.vmid);
    }

    #[test]
    fn test_destroy_propagates_unknown_outcome() {
        let mut control = MockControlPlane::new();
        control
            .expect_call()
            .returning(|_| Err(ControlError::Timeout(std::time::Duration::from_secs(1))));
        let orch = orchestrator(control, applying_realizer());
        orch.create(&CreateRequest::new("vm-a").apply(true)).unwrap();

        let err = orch.destroy("vm-a").unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(
            orch.db().get_vm_by_name("vm-a").unwrap().unwrap().status,
            VmStatus::Active
        );
    }

    #[test]
    fn test_stop_start_cycle() {
        let orch = orchestrator(permissive_control(), applying_realizer());
        orch.create(&CreateRequest::new("vm-a").apply(true)).unwrap();

        orch.stop("vm-a").unwrap();
        assert_eq!(orch.db().get_vm_by_name("vm-a").unwrap().unwrap().status, VmStatus::Suspended);
        orch.stop("vm-a").unwrap();
        orch.start("vm-a").unwrap();
        assert_eq!(orch.db().get_vm_by_name("vm-a").unwrap().unwrap().status, VmStatus::Active);
    }

    #[test]
    fn test_status_reconciles_with_hypervisor() {
        let mut control = MockControlPlane::new();
        control.expect_call().returning(|a| match a {
            Action::QmStatus { .. } => Ok("status: stopped".into()),
            _ => Ok(String::new()),
        });
        let orch = orchestrator(control, applying_realizer());
        orch.create(&CreateRequest::new("vm-a").apply(true)).unwrap();
        // Record says active, hypervisor says stopped
        assert_eq!(orch.status("vm-a"), VmState::Unknown);
        orch.kill("vm-a").unwrap();
        assert_eq!(orch.status("vm-a"), VmState::Suspended);
        assert_eq!(orch.status("missing"), VmState::Unknown);
    }

    #[test]
    fn test_resume_destroyed_requires_disk() {
        let mut control = MockControlPlane::new();
        control.expect_call().returning(|a| match a {
            Action::QmStatus { .. } => Err(ControlError::Remote {
                kind: ErrorKind::ExternalTool,
                message: "Configuration file 'nodes/pve/qemu-server/100.conf' does not exist".into(),
            }),
            _ => Ok(String::new()),
        });
        let orch = orchestrator(control, applying_realizer());
        orch.create(&CreateRequest::new("vm-a").apply(true)).unwrap();
        orch.destroy("vm-a").unwrap();

        assert!(matches!(orch.resume("vm-a", 7, false), Err(Error::Conflict(_))));
        assert_eq!(orch.status("vm-a"), VmState::Destroyed);
    }

    #[test]
    fn test_resume_destroyed_with_disk_present() {
        let orch = orchestrator(permissive_control(), applying_realizer());
        orch.create(&CreateRequest::new("vm-a").expiry_days(1).apply(true))
            .unwrap();
        let before = orch.db().get_vm_by_name("vm-a").unwrap().unwrap();
        orch.destroy("vm-a").unwrap();

        let preview = orch.resume("vm-a", 10, true).unwrap();
        assert_eq!(preview.status, VmStatus::Active);
        assert_eq!(
            orch.db().get_vm_by_name("vm-a").unwrap().unwrap().status,
            VmStatus::Destroyed
        );

        let resumed = orch.resume("vm-a", 10, false).unwrap();
        assert_eq!(resumed.status, VmStatus::Active);
        assert_eq!(resumed.ip, before.ip);
        assert_eq!(resumed.vmid, before.vmid);
        assert!(resumed.expires_at > before.expires_at);
    }
}
