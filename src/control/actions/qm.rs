//! Proxmox `qm` actions
//!
//! Each handler validates its parameters into an argv before the runner is
//! touched. Option keys for `qm create` and `qm set` come from fixed
//! allow-lists and every value must match [`OPTION_VALUE_RE`].

use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use super::execute;
use crate::control::protocol::Params;
use crate::control::registry::{ActionError, ActionModule, Handler};
use crate::control::validate;
use crate::runner::{CommandRunner, CommandSpec};

const QM: &str = "qm";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(300);
const IMPORTDISK_TIMEOUT: Duration = Duration::from_secs(600);

/// Upper bound for the guest shutdown grace a caller may request
pub const MAX_SHUTDOWN_SECS: u64 = 3600;

pub const CREATE_ALLOWED_KEYS: &[&str] = &[
    "name", "memory", "cores", "sockets", "cpu", "net0", "scsihw", "scsi0", "ide2", "boot",
    "agent", "ostype", "serial0", "vga", "bios", "machine", "tags",
];

pub const SET_ALLOWED_KEYS: &[&str] = &[
    "memory", "cores", "sockets", "cpu", "net0", "ipconfig0", "ipconfig1", "ciuser", "cicustom",
    "sshkeys", "nameserver", "searchdomain", "boot", "scsi0", "ide2", "agent", "onboot", "tags",
    "serial0", "vga", "description",
];

/// Values for `--key value` pairs: no whitespace, quotes or shell syntax
pub static OPTION_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.,:=/+@%-]{1,256}$").expect("option value regex is valid")
});

pub static STORAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]{0,63}$").expect("storage regex is valid")
});

pub struct QmModule {
    runner: Arc<dyn CommandRunner>,
    allowed_dirs: Vec<PathBuf>,
}

impl QmModule {
    pub fn new(runner: Arc<dyn CommandRunner>, allowed_dirs: Vec<PathBuf>) -> Self {
        Self {
            runner,
            allowed_dirs,
        }
    }

    fn simple(&self, subcommand: &'static str, extra: &'static [&'static str], timeout: Duration) -> Handler {
        let runner = self.runner.clone();
        Arc::new(move |params: &Params| {
            validate::only_keys(params, &["vmid"])?;
            let vmid = validate::vmid(params)?;
            let cmd = CommandSpec::new(QM)
                .arg(subcommand)
                .arg(vmid.to_string())
                .args(extra.iter().copied())
                .timeout(timeout);
            execute(runner.as_ref(), &cmd)
        })
    }
}

impl ActionModule for QmModule {
    fn name(&self) -> &str {
        "qm"
    }

    fn handlers(&self) -> Vec<(&'static str, Handler)> {
        let runner = self.runner.clone();
        let shutdown: Handler = Arc::new(move |p: &Params| qm_shutdown(runner.as_ref(), p));

        let runner = self.runner.clone();
        let create: Handler = Arc::new(move |p: &Params| {
            qm_with_options(runner.as_ref(), "create", CREATE_ALLOWED_KEYS, p)
        });

        let runner = self.runner.clone();
        let set: Handler = Arc::new(move |p: &Params| {
            qm_with_options(runner.as_ref(), "set", SET_ALLOWED_KEYS, p)
        });

        let runner = self.runner.clone();
        let dirs = self.allowed_dirs.clone();
        let importdisk: Handler = Arc::new(move |p: &Params| qm_importdisk(runner.as_ref(), &dirs, p));

        vec![
            ("qm-start", self.simple("start", &[], DEFAULT_TIMEOUT)),
            ("qm-stop", self.simple("stop", &[], DEFAULT_TIMEOUT)),
            ("qm-shutdown", shutdown),
            ("qm-destroy", self.simple("destroy", &["--purge"], DEFAULT_TIMEOUT)),
            ("qm-status", self.simple("status", &[], Duration::from_secs(30))),
            ("qm-template", self.simple("template", &[], DEFAULT_TIMEOUT)),
            ("qm-create", create),
            ("qm-set", set),
            ("qm-importdisk", importdisk),
        ]
    }
}

/// Graceful shutdown. With `timeout` the hypervisor gives up after that many
/// seconds and the call fails instead of hanging.
fn qm_shutdown(runner: &dyn CommandRunner, params: &Params) -> Result<String, ActionError> {
    validate::only_keys(params, &["vmid", "timeout"])?;
    let vmid = validate::vmid(params)?;
    let grace = match validate::optional_int(params, "timeout")? {
        Some(_) => Some(validate::int_in_range(params, "timeout", 1, MAX_SHUTDOWN_SECS as i64)?),
        None => None,
    };

    let mut cmd = CommandSpec::new(QM).arg("shutdown").arg(vmid.to_string());
    cmd = match grace {
        Some(secs) => cmd
            .arg("--timeout")
            .arg(secs.to_string())
            .timeout(Duration::from_secs(secs as u64 + 30)),
        None => cmd.timeout(SHUTDOWN_TIMEOUT),
    };
    execute(runner, &cmd)
}

/// `qm create|set <vmid> --key value ...` from allow-listed flat keys
fn qm_with_options(
    runner: &dyn CommandRunner,
    subcommand: &str,
    allowed: &[&str],
    params: &Params,
) -> Result<String, ActionError> {
    let vmid = validate::vmid(params)?;
    let mut cmd = CommandSpec::new(QM)
        .arg(subcommand)
        .arg(vmid.to_string())
        .timeout(DEFAULT_TIMEOUT);

    let mut count = 0;
    for key in params.keys().filter(|k| k.as_str() != "vmid") {
        if !allowed.contains(&key.as_str()) {
            return Err(ActionError::Validation(format!(
                "disallowed qm {} option: {}",
                subcommand,
                key.chars().take(64).collect::<String>()
            )));
        }
        let value = validate::scalar_string(params, key)?;
        if !OPTION_VALUE_RE.is_match(&value) {
            return Err(ActionError::Validation(format!("invalid value for {}", key)));
        }
        cmd = cmd.arg(format!("--{}", key)).arg(value);
        count += 1;
    }

    // `qm set` with nothing to set is a caller bug; `qm create` may rely on defaults
    if subcommand == "set" && count == 0 {
        return Err(ActionError::Validation("qm set needs at least one option".into()));
    }
    execute(runner, &cmd)
}

fn qm_importdisk(
    runner: &dyn CommandRunner,
    allowed_dirs: &[PathBuf],
    params: &Params,
) -> Result<String, ActionError> {
    validate::only_keys(params, &["vmid", "image_path", "storage"])?;
    let vmid = validate::vmid(params)?;
    let storage = validate::matching(params, "storage", &STORAGE_RE)?;
    let image = validate::contained_path(params, "image_path", allowed_dirs)?;
    if !image.is_file() {
        return Err(ActionError::Validation(format!(
            "image not found: {}",
            image.display()
        )));
    }

    let cmd = CommandSpec::new(QM)
        .arg("importdisk")
        .arg(vmid.to_string())
        .arg(image.to_string_lossy().into_owned())
        .arg(storage)
        .timeout(IMPORTDISK_TIMEOUT);
    execute(runner, &cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::protocol::ParamValue;
    use crate::control::registry::ActionRegistry;
    use crate::runner::{CommandOutput, MockCommandRunner};

    fn ok_output(stdout: &str) -> crate::Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        })
    }

    fn registry(runner: MockCommandRunner, dirs: Vec<PathBuf>) -> ActionRegistry {
        let mut reg = ActionRegistry::new();
        reg.register(&QmModule::new(Arc::new(runner), dirs)).unwrap();
        reg
    }

    fn params(pairs: &[(&str, ParamValue)]) -> Params {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_start_builds_argv() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| cmd.program == "qm" && cmd.args == ["start", "105"])
            .times(1)
            .returning(|_| ok_output(""));
        let reg = registry(runner, vec![]);
        reg.dispatch("qm-start", &params(&[("vmid", ParamValue::Int(105))]))
            .unwrap();
    }

    #[test]
    fn test_destroy_purges() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| cmd.args == ["destroy", "105", "--purge"])
            .times(1)
            .returning(|_| ok_output(""));
        let reg = registry(runner, vec![]);
        reg.dispatch("qm-destroy", &params(&[("vmid", ParamValue::Int(105))]))
            .unwrap();
    }

    #[test]
    fn test_shutdown_with_bounded_timeout() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| {
                cmd.args == ["shutdown", "105", "--timeout", "60"]
                    && cmd.timeout == Duration::from_secs(90)
            })
            .times(1)
            .returning(|_| ok_output(""));
        let reg = registry(runner, vec![]);
        reg.dispatch(
            "qm-shutdown",
            &params(&[("vmid", ParamValue::Int(105)), ("timeout", ParamValue::Int(60))]),
        )
        .unwrap();
    }

    #[test]
    fn test_hostile_input_never_reaches_runner() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();
        let dir = tempfile::TempDir::new().unwrap();
        let reg = registry(runner, vec![dir.path().to_path_buf()]);

        let hostile: Vec<(&str, Params)> = vec![
            ("qm-start", params(&[("vmid", "100; rm -rf /".into())])),
            ("qm-start", params(&[("vmid", "$(reboot)".into())])),
            ("qm-start", params(&[("vmid", ParamValue::Int(42))])),
            ("qm-start", params(&[("vmid", "9".repeat(5000).into())])),
            ("qm-start", params(&[("vmid", ParamValue::Int(100)), ("force", "1".into())])),
            ("qm-stop", params(&[])),
            ("qm-shutdown", params(&[("vmid", ParamValue::Int(100)), ("timeout", ParamValue::Int(0))])),
            ("qm-shutdown", params(&[("vmid", ParamValue::Int(100)), ("timeout", "60 && halt".into())])),
            ("qm-set", params(&[("vmid", ParamValue::Int(100)), ("hookscript", "local:snippets/x.sh".into())])),
            ("qm-set", params(&[("vmid", ParamValue::Int(100)), ("memory", "2048 --delete scsi0".into())])),
            ("qm-set", params(&[("vmid", ParamValue::Int(100)), ("cicustom", "user=`id`".into())])),
            ("qm-set", params(&[("vmid", ParamValue::Int(100)), ("tags", "a".repeat(300).into())])),
            ("qm-set", params(&[("vmid", ParamValue::Int(100))])),
            ("qm-create", params(&[("vmid", ParamValue::Int(100)), ("args", "-monitor stdio".into())])),
            ("qm-create", params(&[("vmid", ParamValue::Int(100)), ("name", "a|b".into())])),
            ("qm-importdisk", params(&[
                ("vmid", ParamValue::Int(100)),
                ("image_path", "/etc/shadow".into()),
                ("storage", "local-lvm".into()),
            ])),
            ("qm-importdisk", params(&[
                ("vmid", ParamValue::Int(100)),
                ("image_path", ParamValue::Str(format!("{}/../../etc/passwd", dir.path().display()))),
                ("storage", "local-lvm".into()),
            ])),
            ("qm-importdisk", params(&[
                ("vmid", ParamValue::Int(100)),
                ("image_path", ParamValue::Str(format!("{}/missing.qcow2", dir.path().display()))),
                ("storage", "local-lvm".into()),
            ])),
        ];

        for (action, p) in hostile {
            let err = reg.dispatch(action, &p).unwrap_err();
            assert_eq!(
                err.kind(),
                crate::control::ErrorKind::Validation,
                "{} {:?} -> {}",
                action,
                p,
                err
            );
        }
    }

    #[test]
    fn test_importdisk_inside_allowed_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let image = dir.path().join("base.qcow2");
        std::fs::write(&image, b"qcow").unwrap();
        let expected = image.canonicalize().unwrap().to_string_lossy().into_owned();

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(move |cmd| {
                cmd.args == ["importdisk", "100", expected.as_str(), "local-lvm"]
                    && cmd.timeout == IMPORTDISK_TIMEOUT
            })
            .times(1)
            .returning(|_| ok_output("imported"));
        let reg = registry(runner, vec![dir.path().to_path_buf()]);

        let out = reg
            .dispatch(
                "qm-importdisk",
                &params(&[
                    ("vmid", ParamValue::Int(100)),
                    ("image_path", ParamValue::Str(image.display().to_string())),
                    ("storage", "local-lvm".into()),
                ]),
            )
            .unwrap();
        assert_eq!(out, "imported");
    }

    #[test]
    fn test_set_options_in_key_order() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| {
                cmd.args
                    == [
                        "set", "100", "--cores", "2", "--ipconfig0", "ip=10.0.0.2/24,gw=10.0.0.1", "--memory", "4096",
                    ]
            })
            .times(1)
            .returning(|_| ok_output(""));
        let reg = registry(runner, vec![]);
        reg.dispatch(
            "qm-set",
            &params(&[
                ("vmid", ParamValue::Int(100)),
                ("memory", ParamValue::Int(4096)),
                ("cores", "2".into()),
                ("ipconfig0", "ip=10.0.0.2/24,gw=10.0.0.1".into()),
            ]),
        )
        .unwrap();
    }

    #[test]
    fn test_command_failure_is_external_tool() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput {
                code: Some(2),
                stdout: String::new(),
                stderr: "VM 105 not running".into(),
            })
        });
        let reg = registry(runner, vec![]);
        let err = reg
            .dispatch("qm-stop", &params(&[("vmid", ParamValue::Int(105))]))
            .unwrap_err();
        assert_eq!(err.kind(), crate::control::ErrorKind::ExternalTool);
        assert_eq!(err.to_string(), "VM 105 not running");
    }
}
