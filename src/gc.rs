//! Two-phase garbage collector
//!
//! Suspend phase: active records past expiry are shut down. Destroy phase:
//! suspended records past expiry plus the grace period are destroyed. Each
//! phase is selectable on its own and nothing changes unless `execute` is
//! set. A failing candidate is logged and counted; the sweep moves on.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MAX_GRACE_DAYS;
use crate::models::{VmRecord, VmStatus};
use crate::orchestrator::Orchestrator;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct GcOptions {
    /// Without this the sweep only reports candidates
    pub execute: bool,
    pub suspend: bool,
    pub destroy: bool,
    pub grace_days: u32,
    pub now: DateTime<Utc>,
}

impl GcOptions {
    /// Dry run of both phases with the given grace period
    pub fn new(grace_days: u32) -> Self {
        Self {
            execute: false,
            suspend: true,
            destroy: true,
            grace_days,
            now: Utc::now(),
        }
    }

    pub fn execute(mut self, execute: bool) -> Self {
        self.execute = execute;
        self
    }

    pub fn suspend_only(mut self) -> Self {
        self.destroy = false;
        self
    }

    pub fn destroy_only(mut self) -> Self {
        self.suspend = false;
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub ran: bool,
    pub candidates: Vec<String>,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub executed: bool,
    pub suspend: PhaseReport,
    pub destroy: PhaseReport,
}

impl std::fmt::Display for GcReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = if self.executed { "" } else { " (dry run)" };
        for (phase, report) in [("suspend", &self.suspend), ("destroy", &self.destroy)] {
            if !report.ran {
                writeln!(f, "{}: skipped", phase)?;
                continue;
            }
            writeln!(
                f,
                "{}{}: candidates={} succeeded={} failed={}",
                phase,
                mode,
                report.candidates.len(),
                report.succeeded,
                report.failed
            )?;
            for name in &report.candidates {
                writeln!(f, "  {}", name)?;
            }
        }
        Ok(())
    }
}

/// Run one sweep. Errors only on a bad grace period or when the store
/// itself cannot be read.
pub fn sweep(orch: &Orchestrator, opts: &GcOptions) -> Result<GcReport> {
    if opts.grace_days > MAX_GRACE_DAYS {
        return Err(Error::Validation(format!(
            "grace period must be at most {} days",
            MAX_GRACE_DAYS
        )));
    }
    let mut report = GcReport {
        executed: opts.execute,
        ..Default::default()
    };
    tracing::info!(execute = opts.execute, grace_days = opts.grace_days, now = %opts.now, "GC sweep starting");

    if opts.suspend {
        let expired: Vec<VmRecord> = orch
            .db()
            .list_by_status(VmStatus::Active)?
            .into_iter()
            .filter(|r| r.is_expired(opts.now))
            .collect();
        report.suspend = run_phase(expired, opts.execute, |r| suspend_expired(orch, r));
    }

    // Candidates are read after the suspend phase, so a record suspended just
    // now is judged by its own expiry and grace, never by this run
    if opts.destroy {
        let stale: Vec<VmRecord> = orch
            .db()
            .list_by_status(VmStatus::Suspended)?
            .into_iter()
            .filter(|r| r.is_past_grace(opts.now, opts.grace_days))
            .collect();
        report.destroy = run_phase(stale, opts.execute, |r| orch.destroy(&r.name).map(|_| ()));
    }

    tracing::info!(
        suspended = report.suspend.succeeded,
        suspend_failed = report.suspend.failed,
        destroyed = report.destroy.succeeded,
        destroy_failed = report.destroy.failed,
        "GC sweep finished"
    );
    Ok(report)
}

fn run_phase<F>(candidates: Vec<VmRecord>, execute: bool, mut act: F) -> PhaseReport
where
    F: FnMut(&VmRecord) -> Result<()>,
{
    let mut report = PhaseReport {
        ran: true,
        ..Default::default()
    };
    for record in candidates {
        report.candidates.push(record.name.clone());
        if !execute {
            continue;
        }
        match act(&record) {
            Ok(()) => report.succeeded += 1,
            Err(e) => {
                tracing::warn!(vm = %record.name, error = %e, "GC candidate failed");
                report.failed += 1;
            }
        }
    }
    report
}

/// Graceful shutdown, escalating to a forced stop when configured
fn suspend_expired(orch: &Orchestrator, record: &VmRecord) -> Result<()> {
    if let Err(e) = orch.halt(record, true) {
        if !orch.config().gc.force_on_failed_shutdown {
            return Err(e);
        }
        tracing::warn!(vm = %record.name, error = %e, "Graceful shutdown failed, forcing stop");
        orch.halt(record, false)?;
    }
    orch.mark_suspended(&record.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::control::client::MockControlPlane;
    use crate::control::{Action, ControlError, ErrorKind};
    use crate::db::Database;
    use crate::models::CreateRequest;
    use crate::realizer::MockRealizer;
    use chrono::Duration;
    use std::sync::Arc;

    fn realizer() -> MockRealizer {
        let mut realizer = MockRealizer::new();
        realizer.expect_apply().returning(|_| Ok(()));
        realizer.expect_destroy().returning(|_| Ok(true));
        realizer.expect_remove_artifacts().returning(|_| Ok(()));
        realizer
    }

    fn orchestrator(control: MockControlPlane, force: bool) -> Orchestrator {
        let mut config = HostConfig::default();
        config.gc.force_on_failed_shutdown = force;
        Orchestrator::new(
            Database::in_memory().unwrap(),
            Arc::new(control),
            Arc::new(realizer()),
            config,
        )
    }

    fn uncooperative_guest() -> MockControlPlane {
        let mut control = MockControlPlane::new();
        control.expect_call().returning(|a| match a {
            Action::QmShutdown { .. } => Err(ControlError::Remote {
                kind: ErrorKind::ExternalTool,
                message: "VM quit/powerdown failed - got timeout".into(),
            }),
            _ => Ok(String::new()),
        });
        control
    }

    #[test]
    fn test_shutdown_falls_back_to_force() {
        let orch = orchestrator(uncooperative_guest(), true);
        orch.create(&CreateRequest::new("vm-a").expiry_days(1).apply(true))
            .unwrap();

        let later = Utc::now() + Duration::days(2);
        let report = sweep(&orch, &GcOptions::new(7).execute(true).at(later)).unwrap();
        assert_eq!(report.suspend.succeeded, 1);
        assert_eq!(
            orch.db().get_vm_by_name("vm-a").unwrap().unwrap().status,
            VmStatus::Suspended
        );
    }

    #[test]
    fn test_shutdown_failure_without_force_is_counted() {
        let orch = orchestrator(uncooperative_guest(), false);
        for name in ["vm-a", "vm-b"] {
            orch.create(&CreateRequest::new(name).expiry_days(1).apply(true))
                .unwrap();
        }

        let later = Utc::now() + Duration::days(2);
        let report = sweep(&orch, &GcOptions::new(7).execute(true).at(later)).unwrap();
        assert_eq!(report.suspend.candidates.len(), 2);
        assert_eq!(report.suspend.failed, 2);
        assert_eq!(report.suspend.succeeded, 0);
        assert_eq!(
            orch.db().get_vm_by_name("vm-b").unwrap().unwrap().status,
            VmStatus::Active
        );
    }

    #[test]
    fn test_oversized_grace_is_rejected() {
        let mut control = MockControlPlane::new();
        control.expect_call().returning(|_| Ok(String::new()));
        let orch = orchestrator(control, true);
        orch.create(&CreateRequest::new("vm-a").expiry_days(1).apply(true))
            .unwrap();

        let later = Utc::now() + Duration::days(2);
        let err = sweep(&orch, &GcOptions::new(u32::MAX).execute(true).at(later)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(
            orch.db().get_vm_by_name("vm-a").unwrap().unwrap().status,
            VmStatus::Active
        );
    }

    #[test]
    fn test_phase_selection() {
        let mut control = MockControlPlane::new();
        control.expect_call().returning(|_| Ok(String::new()));
        let orch = orchestrator(control, true);
        orch.create(&CreateRequest::new("vm-a").expiry_days(1).apply(true))
            .unwrap();
        let later = Utc::now() + Duration::days(30);

        let report = sweep(&orch, &GcOptions::new(3).execute(true).destroy_only().at(later)).unwrap();
        assert!(!report.suspend.ran);
        assert!(report.destroy.candidates.is_empty());
        assert_eq!(
            orch.db().get_vm_by_name("vm-a").unwrap().unwrap().status,
            VmStatus::Active
        );

        let report = sweep(&orch, &GcOptions::new(3).execute(true).suspend_only().at(later)).unwrap();
        assert_eq!(report.suspend.succeeded, 1);
        assert!(!report.destroy.ran);
        assert!(report.to_string().contains("destroy: skipped"));
    }
}
