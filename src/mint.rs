//! Ownership token minting

use base64::Engine;
use std::sync::Arc;
use std::time::Duration;

use crate::config::MinterConfig;
use crate::runner::{CommandRunner, CommandSpec};
use crate::{Error, Result};

#[cfg_attr(test, mockall::automock)]
pub trait TokenMinter: Send + Sync {
    /// Mint `token_id` to `owner` for the machine. Returns the tool's
    /// confirmation (usually a transaction hash).
    fn mint(&self, owner: &str, machine_id: &str, token_id: u64) -> Result<String>;
}

/// Delegates to an external mint executable; exit 0 is the confirmation
pub struct CommandMinter {
    config: MinterConfig,
    runner: Arc<dyn CommandRunner>,
}

impl CommandMinter {
    pub fn new(config: MinterConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn signing_page(&self) -> Result<Option<String>> {
        let Some(path) = &self.config.signing_page else {
            return Ok(None);
        };
        let html = std::fs::read(path)
            .map_err(|e| Error::Config(format!("cannot read signing page {}: {}", path.display(), e)))?;
        Ok(Some(base64::engine::general_purpose::STANDARD.encode(html)))
    }
}

impl TokenMinter for CommandMinter {
    fn mint(&self, owner: &str, machine_id: &str, token_id: u64) -> Result<String> {
        let mut cmd = CommandSpec::new(self.config.program.to_string_lossy())
            .args(self.config.args.iter().cloned())
            .args(["--owner-wallet", owner, "--machine-id", machine_id])
            .arg("--token-id")
            .arg(token_id.to_string())
            .timeout(Duration::from_secs(self.config.timeout_secs));
        if let Some(page) = self.signing_page()? {
            cmd = cmd.arg("--animation-url-base64").arg(page);
        }

        tracing::info!(machine = %machine_id, token_id, "Minting ownership token");
        let out = self.runner.run(&cmd)?.into_result()?;
        Ok(out.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, MockCommandRunner};
    use std::path::PathBuf;

    fn config(signing_page: Option<PathBuf>) -> MinterConfig {
        MinterConfig {
            program: PathBuf::from("/usr/bin/vmhost-mint"),
            args: vec!["--chain".into(), "sepolia".into()],
            signing_page,
            timeout_secs: 60,
        }
    }

    #[test]
    fn test_mint_argv() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| {
                cmd.program == "/usr/bin/vmhost-mint"
                    && cmd.args
                        == [
                            "--chain",
                            "sepolia",
                            "--owner-wallet",
                            "0xabc",
                            "--machine-id",
                            "web-1",
                            "--token-id",
                            "7",
                        ]
            })
            .returning(|_| {
                Ok(CommandOutput {
                    code: Some(0),
                    stdout: "0xdeadbeef\n".into(),
                    stderr: String::new(),
                })
            });
        let minter = CommandMinter::new(config(None), Arc::new(runner));
        assert_eq!(minter.mint("0xabc", "web-1", 7).unwrap(), "0xdeadbeef");
    }

    #[test]
    fn test_signing_page_is_base64() {
        let dir = tempfile::TempDir::new().unwrap();
        let page = dir.path().join("index.html");
        std::fs::write(&page, "<html></html>").unwrap();

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| cmd.args.ends_with(&["--animation-url-base64".into(), "PGh0bWw+PC9odG1sPg==".into()]))
            .returning(|_| Ok(CommandOutput { code: Some(0), ..Default::default() }));
        let minter = CommandMinter::new(config(Some(page)), Arc::new(runner));
        minter.mint("0xabc", "web-1", 1).unwrap();
    }

    #[test]
    fn test_mint_failure() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "insufficient funds".into(),
            })
        });
        let minter = CommandMinter::new(config(None), Arc::new(runner));
        assert!(matches!(
            minter.mint("0xabc", "web-1", 1),
            Err(Error::ExternalTool(msg)) if msg == "insufficient funds"
        ));
    }
}
