//! Control protocol: length-prefixed JSON frames over a unix socket
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.
//! A connection carries exactly one request and one response.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::Ipv6Addr;
use std::path::PathBuf;

/// Largest frame either side will accept
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// A single parameter value. Only flat strings and integers exist on the
/// wire; anything else fails to deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Str(String),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

pub type Params = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionRequest {
    /// Correlates the daemon's audit log with the caller's
    pub request_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Params,
}

impl ActionRequest {
    pub fn new(action: impl Into<String>, params: Params) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            action: action.into(),
            params,
        }
    }
}

/// Category of a failed action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    UnknownAction,
    Unauthorized,
    ExternalTool,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation error"),
            ErrorKind::UnknownAction => write!(f, "unknown action"),
            ErrorKind::Unauthorized => write!(f, "unauthorized"),
            ErrorKind::ExternalTool => write!(f, "command failed"),
            ErrorKind::Internal => write!(f, "internal error"),
        }
    }
}

/// Either `ok` with output, or not `ok` with exactly one error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    #[serde(default)]
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ActionResponse {
    pub fn success(request_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ok: true,
            output: Some(output.into()),
            error: None,
            error_kind: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ok: false,
            output: None,
            error: Some(error.into()),
            error_kind: Some(kind),
        }
    }
}

/// The closed set of privileged operations, as callers see them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    QmStart { vmid: u32 },
    /// Immediate power-off
    QmStop { vmid: u32 },
    /// Orderly guest shutdown, bounded by `timeout_secs` on the hypervisor side
    QmShutdown { vmid: u32, timeout_secs: Option<u64> },
    QmDestroy { vmid: u32 },
    QmStatus { vmid: u32 },
    QmTemplate { vmid: u32 },
    QmCreate { vmid: u32, options: BTreeMap<String, String> },
    QmSet { vmid: u32, options: BTreeMap<String, String> },
    QmImportDisk { vmid: u32, image_path: PathBuf, storage: String },
    Ip6RouteAdd { address: Ipv6Addr, dev: String },
    Ip6RouteDel { address: Ipv6Addr, dev: String },
    IdentitySet { vmid: u32, token_id: u64, owner: String },
    IdentityClear { vmid: u32 },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::QmStart { .. } => "qm-start",
            Action::QmStop { .. } => "qm-stop",
            Action::QmShutdown { .. } => "qm-shutdown",
            Action::QmDestroy { .. } => "qm-destroy",
            Action::QmStatus { .. } => "qm-status",
            Action::QmTemplate { .. } => "qm-template",
            Action::QmCreate { .. } => "qm-create",
            Action::QmSet { .. } => "qm-set",
            Action::QmImportDisk { .. } => "qm-importdisk",
            Action::Ip6RouteAdd { .. } => "ip6-route-add",
            Action::Ip6RouteDel { .. } => "ip6-route-del",
            Action::IdentitySet { .. } => "vm-identity-set",
            Action::IdentityClear { .. } => "vm-identity-clear",
        }
    }

    pub fn params(&self) -> Params {
        let mut p = Params::new();
        match self {
            Action::QmStart { vmid }
            | Action::QmStop { vmid }
            | Action::QmDestroy { vmid }
            | Action::QmStatus { vmid }
            | Action::QmTemplate { vmid }
            | Action::IdentityClear { vmid } => {
                p.insert("vmid".into(), (*vmid).into());
            }
            Action::QmShutdown { vmid, timeout_secs } => {
                p.insert("vmid".into(), (*vmid).into());
                if let Some(t) = timeout_secs {
                    p.insert("timeout".into(), ParamValue::Int(*t as i64));
                }
            }
            Action::QmCreate { vmid, options } | Action::QmSet { vmid, options } => {
                for (k, v) in options {
                    p.insert(k.clone(), v.clone().into());
                }
                p.insert("vmid".into(), (*vmid).into());
            }
            Action::QmImportDisk { vmid, image_path, storage } => {
                p.insert("vmid".into(), (*vmid).into());
                p.insert("image_path".into(), image_path.to_string_lossy().into_owned().into());
                p.insert("storage".into(), storage.clone().into());
            }
            Action::Ip6RouteAdd { address, dev } | Action::Ip6RouteDel { address, dev } => {
                p.insert("address".into(), address.to_string().into());
                p.insert("dev".into(), dev.clone().into());
            }
            Action::IdentitySet { vmid, token_id, owner } => {
                p.insert("vmid".into(), (*vmid).into());
                p.insert("token_id".into(), ParamValue::Int(*token_id as i64));
                p.insert("owner".into(), owner.clone().into());
            }
        }
        p
    }

    pub fn to_request(&self) -> ActionRequest {
        ActionRequest::new(self.name(), self.params())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds limit of {max}", max = MAX_FRAME_SIZE)]
    TooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize and length-prefix one message
pub fn frame_message<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(body.len()));
    }
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Validate a length prefix before any payload is buffered
pub fn parse_frame_length(header: [u8; 4]) -> Result<usize, FrameError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}

pub fn write_frame<W: Write, T: Serialize>(w: &mut W, message: &T) -> Result<(), FrameError> {
    w.write_all(&frame_message(message)?)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(r: &mut R) -> Result<T, FrameError> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header)?;
    let len = parse_frame_length(header)?;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

pub async fn write_frame_async<W, T>(w: &mut W, message: &T) -> Result<(), FrameError>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    use tokio::io::AsyncWriteExt;
    w.write_all(&frame_message(message)?).await?;
    w.flush().await?;
    Ok(())
}

/// Read the raw payload of one frame; decoding is left to the caller so a
/// malformed body can still be answered
pub async fn read_frame_async<R>(r: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut header = [0u8; 4];
    r.read_exact(&mut header).await?;
    let len = parse_frame_length(header)?;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}
