//! Action registry
//!
//! Maps action names to handlers. Hypervisor-specific handlers come from
//! [`ActionModule`] implementations selected by name at daemon startup; the
//! set is fixed once the daemon starts serving.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

use super::actions::{identity::IdentityModule, network::NetworkModule, qm::QmModule};
use super::protocol::{ErrorKind, Params};
use crate::config::DaemonConfig;
use crate::runner::CommandRunner;

static ACTION_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]+)*$").expect("action name regex is valid")
});

/// Failure of a single action, always reported back as a structured response
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("{0}")]
    Validation(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("{0}")]
    Unauthorized(String),

    /// The underlying command ran and failed
    #[error("{0}")]
    Execution(String),

    #[error("{0}")]
    Internal(String),
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::Validation(_) => ErrorKind::Validation,
            ActionError::UnknownAction(_) => ErrorKind::UnknownAction,
            ActionError::Unauthorized(_) => ErrorKind::Unauthorized,
            ActionError::Execution(_) => ErrorKind::ExternalTool,
            ActionError::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Handler = Arc<dyn Fn(&Params) -> Result<String, ActionError> + Send + Sync>;

/// A plugin: a named bundle of action handlers. Each handler receives only
/// the flat parameter map and must validate it before doing anything.
pub trait ActionModule: Send + Sync {
    fn name(&self) -> &str;

    fn handlers(&self) -> Vec<(&'static str, Handler)>;
}

/// What built-in modules may need from the daemon environment
pub struct ModuleContext {
    pub runner: Arc<dyn CommandRunner>,
    pub allowed_dirs: Vec<PathBuf>,
    pub identity_dir: PathBuf,
}

impl ModuleContext {
    pub fn from_config(config: &DaemonConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            allowed_dirs: config.allowed_dirs.clone(),
            identity_dir: config.identity_dir.clone(),
        }
    }
}

/// Instantiate a built-in module by its configured name
pub fn builtin_module(name: &str, ctx: &ModuleContext) -> crate::Result<Box<dyn ActionModule>> {
    match name {
        "qm" => Ok(Box::new(QmModule::new(ctx.runner.clone(), ctx.allowed_dirs.clone()))),
        "network" => Ok(Box::new(NetworkModule::new(ctx.runner.clone()))),
        "identity" => Ok(Box::new(IdentityModule::new(ctx.identity_dir.clone()))),
        other => Err(crate::Error::Config(format!("unknown action module: {}", other))),
    }
}

#[derive(Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<String, Handler>,
    owners: BTreeMap<String, String>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every module named in the config. Any problem is fatal.
    pub fn from_config(config: &DaemonConfig, ctx: &ModuleContext) -> crate::Result<Self> {
        if config.modules.is_empty() {
            return Err(crate::Error::Config("no action modules configured".into()));
        }
        let mut registry = Self::new();
        for name in &config.modules {
            let module = builtin_module(name, ctx)?;
            registry.register(module.as_ref())?;
        }
        Ok(registry)
    }

    /// Verify a module's exported surface and add it. Malformed or
    /// colliding action names reject the whole module.
    pub fn register(&mut self, module: &dyn ActionModule) -> crate::Result<()> {
        let handlers = module.handlers();
        if handlers.is_empty() {
            return Err(crate::Error::Config(format!(
                "action module '{}' exports no actions",
                module.name()
            )));
        }
        let mut seen = BTreeSet::new();
        for (action, _) in &handlers {
            if !seen.insert(*action) {
                return Err(crate::Error::Config(format!(
                    "action module '{}' exports action '{}' twice",
                    module.name(),
                    action
                )));
            }
            if !ACTION_NAME_RE.is_match(action) {
                return Err(crate::Error::Config(format!(
                    "action module '{}' exports malformed action name '{}'",
                    module.name(),
                    action
                )));
            }
            if let Some(owner) = self.owners.get(*action) {
                return Err(crate::Error::Config(format!(
                    "action '{}' from module '{}' is already provided by '{}'",
                    action,
                    module.name(),
                    owner
                )));
            }
        }
        let count = handlers.len();
        for (action, handler) in handlers {
            self.owners.insert(action.to_string(), module.name().to_string());
            self.handlers.insert(action.to_string(), handler);
        }
        tracing::info!(module = %module.name(), actions = count, "Action module loaded");
        Ok(())
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn dispatch(&self, action: &str, params: &Params) -> Result<String, ActionError> {
        let handler = self
            .handlers
            .get(action)
            .ok_or_else(|| ActionError::UnknownAction(action.to_string()))?;
        handler(params)
    }
}
