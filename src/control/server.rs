//! Root control daemon
//!
//! Listens on a unix socket whose mode and group restrict who can connect,
//! then checks the peer's credentials on every connection. One request per
//! connection; handlers run on the blocking pool so a slow `qm` call never
//! stalls the accept loop.

use regex::Regex;
use std::future::Future;
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, PermissionsExt};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;

use super::protocol::{
    read_frame_async, write_frame_async, ActionRequest, ActionResponse, ErrorKind, FrameError, Params,
};
use super::registry::{ActionError, ActionRegistry};
use crate::config::DaemonConfig;
use crate::{Error, Result};

const DIRECTORY_MODE: u32 = 0o750;

/// How long a connected peer may take to send its request
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameter names whose values never reach the log
const SECRET_KEYS: &[&str] = &["password", "private_key", "api_token", "token", "secret"];

static REQUEST_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]{1,64}$").expect("request id regex is valid"));

pub struct ControlServer {
    registry: Arc<ActionRegistry>,
    config: DaemonConfig,
}

struct ConnectionContext {
    registry: Arc<ActionRegistry>,
    allowed_uid: Option<u32>,
    allow_root: bool,
    request_timeout: Duration,
}

impl ConnectionContext {
    fn is_authorized(&self, uid: u32) -> bool {
        (self.allow_root && uid == 0) || self.allowed_uid == Some(uid)
    }
}

impl ControlServer {
    pub fn new(registry: ActionRegistry, config: DaemonConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
        }
    }

    /// Prepare the socket directory, replace any stale socket and bind.
    /// Must be called from within a tokio runtime.
    pub fn bind(&self) -> Result<UnixListener> {
        let path = &self.config.socket_path;
        if let Some(parent) = path.parent() {
            ensure_directory(parent, self.config.socket_gid)?;
        }
        cleanup_socket(path)?;

        let listener = UnixListener::bind(path).map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("failed to bind control socket {}: {}", path.display(), e),
            ))
        })?;

        let mode = self.config.socket_mode_bits()?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        if let Some(gid) = self.config.socket_gid {
            std::os::unix::fs::chown(path, None, Some(gid))?;
        }

        tracing::info!(
            path = %path.display(),
            mode = %format!("{:o}", mode),
            gid = ?self.config.socket_gid,
            actions = self.registry.actions().count(),
            "Control socket listening"
        );
        Ok(listener)
    }

    /// Accept connections until `shutdown` resolves, then remove the socket
    pub async fn serve<F>(self, listener: UnixListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        let ctx = Arc::new(ConnectionContext {
            registry: self.registry.clone(),
            allowed_uid: self.config.allowed_uid,
            allow_root: self.config.allow_root,
            request_timeout: self.config.request_timeout(),
        });
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = permits.clone().acquire_owned() => permit
                    .map_err(|_| Error::Io(io::Error::other("connection limiter closed")))?,
            };
            let stream = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let ctx = ctx.clone();
            tokio::spawn(async move {
                handle_connection(stream, &ctx).await;
                drop(permit);
            });
        }

        tracing::info!("Control daemon shutting down");
        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            tracing::debug!(error = %e, "Socket already removed");
        }
        Ok(())
    }
}

async fn handle_connection(mut stream: UnixStream, ctx: &ConnectionContext) {
    let (uid, pid) = match stream.peer_cred() {
        Ok(cred) => (cred.uid(), cred.pid()),
        Err(e) => {
            tracing::warn!(error = %e, "Cannot read peer credentials, dropping connection");
            return;
        }
    };

    let response = process(&mut stream, ctx, uid, pid).await;
    if let Err(e) = write_frame_async(&mut stream, &response).await {
        tracing::debug!(actor_uid = uid, error = %e, "Peer went away before the response");
    }
}

async fn process(
    stream: &mut UnixStream,
    ctx: &ConnectionContext,
    uid: u32,
    pid: Option<i32>,
) -> ActionResponse {
    if !ctx.is_authorized(uid) {
        tracing::warn!(actor_uid = uid, actor_pid = ?pid, "Rejected unauthorized peer");
        return ActionResponse::failure("", ErrorKind::Unauthorized, "peer is not permitted to use this socket");
    }

    let body = match tokio::time::timeout(READ_TIMEOUT, read_frame_async(stream)).await {
        Err(_) => {
            return ActionResponse::failure("", ErrorKind::Validation, "timed out waiting for request")
        }
        Ok(Err(FrameError::TooLarge(n))) => {
            tracing::warn!(actor_uid = uid, bytes = n, "Oversized request rejected");
            return ActionResponse::failure(
                "",
                ErrorKind::Validation,
                format!("request of {} bytes exceeds the frame limit", n),
            );
        }
        Ok(Err(e)) => return ActionResponse::failure("", ErrorKind::Validation, e.to_string()),
        Ok(Ok(body)) => body,
    };

    let request: ActionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(actor_uid = uid, error = %e, "Malformed request rejected");
            return ActionResponse::failure("", ErrorKind::Validation, format!("malformed request: {}", e));
        }
    };
    if !REQUEST_ID_RE.is_match(&request.request_id) {
        return ActionResponse::failure("", ErrorKind::Validation, "invalid request_id");
    }
    let request_id = request.request_id.clone();

    tracing::info!(
        request_id = %request_id,
        actor_uid = uid,
        actor_pid = ?pid,
        action = %truncate(&request.action),
        params = %redact(&request.params),
        "Control request"
    );

    let result = dispatch(ctx, request).await;
    match result {
        Ok(output) => {
            tracing::info!(request_id = %request_id, "Action succeeded");
            ActionResponse::success(request_id, output)
        }
        Err(e) => {
            tracing::warn!(request_id = %request_id, kind = ?e.kind(), error = %e, "Action failed");
            ActionResponse::failure(request_id, e.kind(), e.to_string())
        }
    }
}

async fn dispatch(ctx: &ConnectionContext, request: ActionRequest) -> std::result::Result<String, ActionError> {
    if !ctx.registry.contains(&request.action) {
        return Err(ActionError::UnknownAction(truncate(&request.action)));
    }
    let registry = ctx.registry.clone();
    let ActionRequest { action, params, .. } = request;
    let task = tokio::task::spawn_blocking(move || registry.dispatch(&action, &params));
    match tokio::time::timeout(ctx.request_timeout, task).await {
        Err(_) => Err(ActionError::Internal(format!(
            "action did not finish within {}s",
            ctx.request_timeout.as_secs()
        ))),
        Ok(Err(join)) => Err(ActionError::Internal(format!("handler failed: {}", join))),
        Ok(Ok(result)) => result,
    }
}

/// `key=value` pairs for the audit log with secrets masked
pub fn redact(params: &Params) -> String {
    params
        .iter()
        .map(|(k, v)| {
            if SECRET_KEYS.contains(&k.as_str()) {
                format!("{}=***", truncate(k))
            } else {
                format!("{}={}", truncate(k), truncate(&v.to_string()))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate(s: &str) -> String {
    let clean: String = s.chars().filter(|c| !c.is_control()).take(64).collect();
    if clean.len() < s.len() {
        format!("{}...", clean)
    } else {
        clean
    }
}

/// Create the socket directory if missing. Existing directories keep their
/// permissions; a symlink or non-directory is refused.
fn ensure_directory(path: &Path, gid: Option<u32>) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_symlink() {
                return Err(Error::Config(format!(
                    "{} is a symlink, refusing to use it as socket directory",
                    path.display()
                )));
            }
            if !meta.is_dir() {
                return Err(Error::Config(format!("{} is not a directory", path.display())));
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(DIRECTORY_MODE)
                .create(path)?;
            if let Some(gid) = gid {
                std::os::unix::fs::chown(path, None, Some(gid))?;
            }
            tracing::debug!(path = %path.display(), "Created socket directory");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Remove a stale socket left by a previous run; refuse to delete anything else
fn cleanup_socket(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path)?;
            tracing::debug!(path = %path.display(), "Removed stale socket");
            Ok(())
        }
        Ok(_) => Err(Error::Config(format!(
            "{} exists and is not a socket",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
