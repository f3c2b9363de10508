//! VM identity metadata
//!
//! Records which ownership token and wallet a VM is bound to, as
//! `<identity_dir>/<vmid>.json`. Guests read it through a read-only snippet.

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use crate::control::protocol::Params;
use crate::control::registry::{ActionError, ActionModule, Handler};
use crate::control::validate;

static WALLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("wallet regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub vmid: u32,
    pub token_id: u64,
    pub owner: String,
    pub updated_at: String,
}

pub struct IdentityModule {
    dir: PathBuf,
}

impl IdentityModule {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ActionModule for IdentityModule {
    fn name(&self) -> &str {
        "identity"
    }

    fn handlers(&self) -> Vec<(&'static str, Handler)> {
        let dir = self.dir.clone();
        let set: Handler = Arc::new(move |p: &Params| identity_set(&dir, p));
        let dir = self.dir.clone();
        let clear: Handler = Arc::new(move |p: &Params| identity_clear(&dir, p));
        vec![("vm-identity-set", set), ("vm-identity-clear", clear)]
    }
}

fn identity_path(dir: &Path, vmid: u32) -> PathBuf {
    dir.join(format!("{}.json", vmid))
}

fn identity_set(dir: &Path, params: &Params) -> Result<String, ActionError> {
    validate::only_keys(params, &["vmid", "token_id", "owner"])?;
    let vmid = validate::vmid(params)?;
    let token_id = validate::int_in_range(params, "token_id", 0, i64::MAX)? as u64;
    let owner = validate::matching(params, "owner", &WALLET_RE)?;

    let record = IdentityRecord {
        vmid,
        token_id,
        owner: owner.to_string(),
        updated_at: Utc::now().to_rfc3339(),
    };
    let body = serde_json::to_vec_pretty(&record)
        .map_err(|e| ActionError::Internal(format!("cannot encode identity: {}", e)))?;

    std::fs::create_dir_all(dir)
        .map_err(|e| ActionError::Execution(format!("cannot create {}: {}", dir.display(), e)))?;
    let path = identity_path(dir, vmid);
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &body)
        .and_then(|_| std::fs::rename(&tmp, &path))
        .map_err(|e| ActionError::Execution(format!("cannot write {}: {}", path.display(), e)))?;

    tracing::info!(vmid, token_id, path = %path.display(), "VM identity written");
    Ok(path.display().to_string())
}

fn identity_clear(dir: &Path, params: &Params) -> Result<String, ActionError> {
    validate::only_keys(params, &["vmid"])?;
    let vmid = validate::vmid(params)?;
    let path = identity_path(dir, vmid);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(format!("removed {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(ActionError::Execution(format!(
            "cannot remove {}: {}",
            path.display(),
            e
        ))),
    }
}
