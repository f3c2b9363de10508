//! Privilege boundary between unprivileged callers and the root daemon
//!
//! - [`protocol`]: wire types and framing
//! - [`client`]: the only way unprivileged code reaches the daemon
//! - [`server`]: the root daemon itself
//! - [`registry`] and [`actions`]: the closed set of things the daemon will do

pub mod actions;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod validate;

pub use client::{ControlClient, ControlPlane};
pub use protocol::{Action, ActionRequest, ActionResponse, ErrorKind, ParamValue, Params};
pub use registry::{ActionError, ActionModule, ActionRegistry};
pub use server::ControlServer;

use std::time::Duration;
use thiserror::Error;

/// Failure of a control-plane call as seen by the caller. The first two
/// variants leave the outcome unknown and may be retried; `Remote` is a
/// definite answer from the daemon.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control daemon unavailable: {0}")]
    Unavailable(String),

    #[error("control daemon did not answer within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("control protocol error: {0}")]
    Protocol(String),
}

impl ControlError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControlError::Unavailable(_) | ControlError::Timeout(_))
    }
}
