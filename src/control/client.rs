//! Unprivileged side of the control socket

use std::io;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use super::protocol::{read_frame, write_frame, Action, ActionResponse, ErrorKind, FrameError};
use super::ControlError;
use crate::config::HostConfig;

/// Anything that can carry out a privileged action. The orchestrator and GC
/// only ever see this trait.
#[cfg_attr(test, mockall::automock)]
pub trait ControlPlane: Send + Sync {
    /// Returns the action's stdout on success
    fn call(&self, action: &Action) -> Result<String, ControlError>;
}

/// Blocking client: one connection per call
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(config.daemon.socket_path.clone(), config.client.timeout())
    }

    fn connect(&self) -> Result<UnixStream, ControlError> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            ControlError::Unavailable(format!("{}: {}", self.socket_path.display(), e))
        })?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| ControlError::Unavailable(e.to_string()))?;
        Ok(stream)
    }

    fn frame_error(&self, err: FrameError) -> ControlError {
        match err {
            FrameError::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                ControlError::Timeout(self.timeout)
            }
            FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                ControlError::Protocol("daemon closed the connection without answering".into())
            }
            other => ControlError::Protocol(other.to_string()),
        }
    }
}

impl ControlPlane for ControlClient {
    fn call(&self, action: &Action) -> Result<String, ControlError> {
        let request = action.to_request();
        tracing::debug!(request_id = %request.request_id, action = %request.action, "Calling control daemon");

        let mut stream = self.connect()?;
        if let Err(e) = write_frame(&mut stream, &request) {
            // The daemon may answer and hang up before reading, e.g. when it
            // rejects the peer; its response is still waiting to be read
            if !matches!(&e, FrameError::Io(io) if io.kind() == io::ErrorKind::BrokenPipe) {
                return Err(self.frame_error(e));
            }
        }
        let response: ActionResponse = read_frame(&mut stream).map_err(|e| self.frame_error(e))?;

        if !response.request_id.is_empty() && response.request_id != request.request_id {
            return Err(ControlError::Protocol(format!(
                "response for {} does not match request {}",
                response.request_id, request.request_id
            )));
        }
        if response.ok {
            Ok(response.output.unwrap_or_default())
        } else {
            Err(ControlError::Remote {
                kind: response.error_kind.unwrap_or(ErrorKind::Internal),
                message: response.error.unwrap_or_default(),
            })
        }
    }
}
