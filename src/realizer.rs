//! Realizer: turns a resolved [`VmSpec`] into a running machine
//!
//! The orchestrator only depends on the [`Realizer`] trait. The Terraform
//! implementation keeps one `<name>.tf.json` per VM in a shared working
//! directory and always targets that VM's resource, so a plan or apply
//! for one machine never touches another.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::HostConfig;
use crate::models::VmSpec;
use crate::runner::{CommandRunner, CommandSpec};
use crate::{Error, Result};

const RESOURCE_TYPE: &str = "proxmox_virtual_environment_vm";
/// Datastore that serves `snippets` content
const SNIPPET_STORE: &str = "local";
const PLAN_TIMEOUT: Duration = Duration::from_secs(300);
const APPLY_TIMEOUT: Duration = Duration::from_secs(1800);

#[cfg_attr(test, mockall::automock)]
pub trait Realizer: Send + Sync {
    /// Show what `apply` would do without changing anything
    fn plan(&self, spec: &VmSpec) -> Result<String>;

    fn apply(&self, spec: &VmSpec) -> Result<()>;

    /// Tear down the machine. Returns false when this realizer holds no
    /// state for it, leaving teardown to the caller.
    fn destroy(&self, name: &str) -> Result<bool>;

    /// Delete generated files (plan file, boot configuration snippet)
    fn remove_artifacts(&self, name: &str) -> Result<()>;
}

/// Terraform identifiers only allow `[A-Za-z0-9_]`
pub fn resource_name(vm_name: &str) -> String {
    vm_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

pub struct TerraformRealizer {
    terraform_dir: PathBuf,
    snippets_dir: PathBuf,
    node_name: String,
    storage: String,
    bridge: String,
    template_vmid: u32,
    runner: Arc<dyn CommandRunner>,
}

impl TerraformRealizer {
    pub fn from_config(config: &HostConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            terraform_dir: config.terraform_dir.clone(),
            snippets_dir: config.snippets_dir.clone(),
            node_name: config.node_name.clone(),
            storage: config.storage.clone(),
            bridge: config.bridge.clone(),
            template_vmid: config.template_vmid,
            runner,
        }
    }

    fn tf_path(&self, name: &str) -> PathBuf {
        self.terraform_dir.join(format!("{}.tf.json", resource_name(name)))
    }

    fn snippet_file(name: &str) -> String {
        format!("{}-cloud-config.yaml", resource_name(name))
    }

    fn target(name: &str) -> String {
        format!("-target={}.{}", RESOURCE_TYPE, resource_name(name))
    }

    /// The resource document for one VM
    pub fn render(&self, spec: &VmSpec) -> serde_json::Value {
        let mut ip_config = json!({
            "ipv4": { "address": format!("{}/{}", spec.ip, spec.prefix_len) }
        });
        if let Some(gw) = spec.gateway {
            ip_config["ipv4"]["gateway"] = json!(gw.to_string());
        }
        if let Some(v6) = spec.ipv6 {
            ip_config["ipv6"] = json!({ "address": format!("{}/128", v6) });
        }

        let mut initialization = json!({
            "ip_config": [ip_config],
            "user_account": { "username": spec.username },
        });
        if spec.rendered_config.is_some() {
            initialization["user_data_file_id"] =
                json!(format!("{}:snippets/{}", SNIPPET_STORE, Self::snippet_file(&spec.name)));
        }

        json!({
            "resource": {
                RESOURCE_TYPE: {
                    resource_name(&spec.name): {
                        "name": spec.name,
                        "node_name": self.node_name,
                        "vm_id": spec.vmid,
                        "started": true,
                        "clone": { "vm_id": self.template_vmid, "full": true },
                        "cpu": { "cores": spec.cpu },
                        "memory": { "dedicated": spec.memory_mb },
                        "disk": [{
                            "datastore_id": self.storage,
                            "interface": "scsi0",
                            "size": spec.disk_gb,
                        }],
                        "network_device": [{ "bridge": self.bridge }],
                        "initialization": initialization,
                    }
                }
            }
        })
    }

    fn write_artifacts(&self, spec: &VmSpec) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.terraform_dir)?;
        let path = self.tf_path(&spec.name);
        let body = serde_json::to_string_pretty(&self.render(spec))?;
        std::fs::write(&path, body)?;

        if let Some(src) = &spec.rendered_config {
            std::fs::create_dir_all(&self.snippets_dir)?;
            let dest = self.snippets_dir.join(Self::snippet_file(&spec.name));
            std::fs::copy(src, &dest).map_err(|e| {
                Error::Validation(format!("cannot use rendered config {}: {}", src.display(), e))
            })?;
        }
        tracing::debug!(vm = %spec.name, path = %path.display(), "Realizer artifacts written");
        Ok(path)
    }

    fn terraform(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let cmd = CommandSpec::new("terraform")
            .args(args.iter().copied())
            .cwd(&self.terraform_dir)
            .timeout(timeout);
        self.runner.run(&cmd)?.into_result()
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl Realizer for TerraformRealizer {
    fn plan(&self, spec: &VmSpec) -> Result<String> {
        let existed = self.tf_path(&spec.name).exists();
        let path = self.write_artifacts(spec)?;
        let target = Self::target(&spec.name);
        let result = self.terraform(&["plan", "-input=false", "-no-color", &target], PLAN_TIMEOUT);
        // A dry run leaves no trace behind
        if !existed {
            remove_if_present(&path)?;
            remove_if_present(&self.snippets_dir.join(Self::snippet_file(&spec.name)))?;
        }
        result
    }

    fn apply(&self, spec: &VmSpec) -> Result<()> {
        self.write_artifacts(spec)?;
        let target = Self::target(&spec.name);
        tracing::info!(vm = %spec.name, vmid = spec.vmid, "Applying terraform");
        self.terraform(
            &["apply", "-auto-approve", "-input=false", "-no-color", &target],
            APPLY_TIMEOUT,
        )?;
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<bool> {
        if !self.tf_path(name).exists() {
            tracing::debug!(vm = %name, "No terraform file for this VM");
            return Ok(false);
        }
        let target = Self::target(name);
        tracing::info!(vm = %name, "Destroying via terraform");
        self.terraform(
            &["destroy", "-auto-approve", "-input=false", "-no-color", &target],
            APPLY_TIMEOUT,
        )?;
        Ok(true)
    }

    fn remove_artifacts(&self, name: &str) -> Result<()> {
        remove_if_present(&self.tf_path(name))?;
        remove_if_present(&self.snippets_dir.join(Self::snippet_file(name)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, MockCommandRunner};
    use tempfile::TempDir;

    fn spec(name: &str) -> VmSpec {
        VmSpec {
            name: name.into(),
            vmid: 105,
            ip: "10.0.0.2".parse().unwrap(),
            prefix_len: 24,
            gateway: Some("10.0.0.1".parse().unwrap()),
            ipv6: Some("2001:db8::5".parse().unwrap()),
            cpu: 2,
            memory_mb: 4096,
            disk_gb: 20,
            username: "admin".into(),
            rendered_config: None,
        }
    }

    fn realizer(dir: &TempDir, runner: MockCommandRunner) -> TerraformRealizer {
        let config = HostConfig::builder()
            .terraform_dir(dir.path().join("tf"))
            .snippets_dir(dir.path().join("snippets"))
            .build();
        TerraformRealizer::from_config(&config, Arc::new(runner))
    }

    fn ok() -> CommandOutput {
        CommandOutput {
            code: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_resource_name() {
        assert_eq!(resource_name("web-01.prod"), "web_01_prod");
        assert_eq!(resource_name("vm_a"), "vm_a");
    }

    #[test]
    fn test_render_document() {
        let dir = TempDir::new().unwrap();
        let r = realizer(&dir, MockCommandRunner::new());
        let doc = r.render(&spec("web-1"));
        let vm = &doc["resource"][RESOURCE_TYPE]["web_1"];
        assert_eq!(vm["vm_id"], 105);
        assert_eq!(vm["clone"]["vm_id"], 9000);
        assert_eq!(vm["initialization"]["ip_config"][0]["ipv4"]["address"], "10.0.0.2/24");
        assert_eq!(vm["initialization"]["ip_config"][0]["ipv6"]["address"], "2001:db8::5/128");
        assert!(vm["initialization"].get("user_data_file_id").is_none());
    }

    #[test]
    fn test_apply_targets_one_resource_and_keeps_artifacts() {
        let dir = TempDir::new().unwrap();
        let config_src = dir.path().join("user-data.yaml");
        std::fs::write(&config_src, "#cloud-config\n").unwrap();

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| {
                cmd.program == "terraform"
                    && cmd.args[0] == "apply"
                    && cmd.args.contains(&"-target=proxmox_virtual_environment_vm.web_1".to_string())
            })
            .times(1)
            .returning(|_| Ok(ok()));
        let r = realizer(&dir, runner);

        let mut s = spec("web-1");
        s.rendered_config = Some(config_src);
        r.apply(&s).unwrap();
        assert!(dir.path().join("tf/web_1.tf.json").exists());
        assert!(dir.path().join("snippets/web_1-cloud-config.yaml").exists());

        r.remove_artifacts("web-1").unwrap();
        assert!(!dir.path().join("tf/web_1.tf.json").exists());
        // Second removal is a no-op
        r.remove_artifacts("web-1").unwrap();
    }

    #[test]
    fn test_plan_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| cmd.args[0] == "plan")
            .returning(|_| {
                Ok(CommandOutput {
                    code: Some(0),
                    stdout: "Plan: 1 to add".into(),
                    stderr: String::new(),
                })
            });
        let r = realizer(&dir, runner);
        assert_eq!(r.plan(&spec("web-1")).unwrap(), "Plan: 1 to add");
        assert!(!dir.path().join("tf/web_1.tf.json").exists());
    }

    #[test]
    fn test_apply_failure_is_verbatim() {
        let dir = TempDir::new().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "Error: 500 storage full".into(),
            })
        });
        let r = realizer(&dir, runner);
        match r.apply(&spec("web-1")).unwrap_err() {
            Error::ExternalTool(msg) => assert_eq!(msg, "Error: 500 storage full"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_destroy_without_file_reports_nothing_done() {
        let dir = TempDir::new().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();
        assert!(!realizer(&dir, runner).destroy("gone").unwrap());
    }

    #[test]
    fn test_destroy_with_file_runs_terraform() {
        let dir = TempDir::new().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| cmd.args[0] == "apply" || cmd.args[0] == "destroy")
            .times(2)
            .returning(|_| Ok(ok()));
        let r = realizer(&dir, runner);
        r.apply(&spec("web-1")).unwrap();
        assert!(r.destroy("web-1").unwrap());
    }
}
