//! Error types for vmhost

use thiserror::Error;

use crate::control::ControlError;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad or unsafe input, rejected before anything privileged runs
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("VM not found: {0}")]
    NotFound(String),

    /// Name already live, or a pool is exhausted
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The realizer or a hypervisor command failed; message is passed through verbatim
    #[error("{0}")]
    ExternalTool(String),

    #[error(transparent)]
    Control(#[from] ControlError),

    /// A store invariant is violated. Never repaired automatically.
    #[error("State corruption: {0}")]
    StateCorruption(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the outcome of the privileged call is unknown and a retry is sane
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Control(e) if e.is_retryable())
    }

    /// Timeouts are reported distinctly: the operation may still complete server-side
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Control(ControlError::Timeout(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Control(ControlError::Unavailable("refused".into())).is_retryable());
        assert!(Error::Control(ControlError::Timeout(std::time::Duration::from_secs(5))).is_retryable());
        assert!(!Error::Control(ControlError::Remote {
            kind: crate::control::ErrorKind::ExternalTool,
            message: "qm failed".into(),
        })
        .is_retryable());
        assert!(!Error::Conflict("vm-a".into()).is_retryable());
    }

    #[test]
    fn test_external_tool_message_verbatim() {
        let err = Error::ExternalTool("Error: resource already exists".into());
        assert_eq!(err.to_string(), "Error: resource already exists");
    }
}
