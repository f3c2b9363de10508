//! Subprocess execution with a bounded wait
//!
//! Commands are always an argv vector handed straight to the OS; nothing is
//! ever passed through a shell.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A fully-resolved command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// What a failed command had to say: stderr, else stdout
    pub fn error_text(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }

    /// Turn a non-zero exit into `ExternalTool` carrying the tool's own text
    pub fn into_result(self) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            let text = self.error_text();
            Err(Error::ExternalTool(if text.is_empty() {
                format!("exit code {:?}", self.code)
            } else {
                text
            }))
        }
    }
}

/// Capability to run external programs
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands on the local host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }

        tracing::debug!(program = %cmd.program, args = ?cmd.args, "Spawning command");
        let mut child = command.spawn().map_err(|e| {
            Error::ExternalTool(format!("failed to spawn {}: {}", cmd.program, e))
        })?;

        // Drain pipes on their own threads so a chatty child cannot block on a full pipe
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + cmd.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(program = %cmd.program, timeout = ?cmd.timeout, "Command timed out");
                return Err(Error::ExternalTool(format!(
                    "{} timed out after {}s",
                    cmd.program,
                    cmd.timeout.as_secs()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let collect = |h: Option<std::thread::JoinHandle<String>>| {
            h.and_then(|h| h.join().ok()).unwrap_or_default()
        };
        Ok(CommandOutput {
            code: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_display() {
        let cmd = CommandSpec::new("qm").arg("start").arg("100");
        assert_eq!(cmd.to_string(), "qm start 100");
    }

    #[test]
    fn test_error_text_prefers_stderr() {
        let out = CommandOutput {
            code: Some(2),
            stdout: "partial".into(),
            stderr: "  boom\n".into(),
        };
        assert_eq!(out.error_text(), "boom");
        assert!(matches!(out.into_result(), Err(Error::ExternalTool(m)) if m == "boom"));
    }

    #[test]
    fn test_system_runner_captures_output() {
        let out = SystemRunner
            .run(&CommandSpec::new("sh").args(["-c", "echo hi; echo oops >&2; exit 3"]))
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn test_system_runner_timeout() {
        let start = Instant::now();
        let err = SystemRunner
            .run(&CommandSpec::new("sleep").arg("5").timeout(Duration::from_millis(200)))
            .unwrap_err();
        assert!(matches!(err, Error::ExternalTool(m) if m.contains("timed out")));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_program() {
        let err = SystemRunner
            .run(&CommandSpec::new("/nonexistent/definitely-not-here"))
            .unwrap_err();
        assert!(matches!(err, Error::ExternalTool(_)));
    }
}
