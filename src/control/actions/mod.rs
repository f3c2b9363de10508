//! Built-in action modules

pub mod identity;
pub mod network;
pub mod qm;

use super::registry::ActionError;
use crate::runner::{CommandRunner, CommandSpec};

/// Run an already-validated command and fold the outcome into an action result
pub(crate) fn execute(runner: &dyn CommandRunner, cmd: &CommandSpec) -> Result<String, ActionError> {
    tracing::info!(command = %cmd, "Executing privileged command");
    let output = runner
        .run(cmd)
        .map_err(|e| ActionError::Execution(e.to_string()))?;
    if output.success() {
        Ok(output.stdout.trim_end().to_string())
    } else {
        let text = output.error_text();
        Err(ActionError::Execution(if text.is_empty() {
            format!("{} exited with {:?}", cmd.program, output.code)
        } else {
            text
        }))
    }
}
