//! vmhost
//!
//! Provisions, tracks and retires virtual machines on a single hypervisor
//! host. Privileged work is split off into a small root daemon that only
//! runs a closed set of validated actions; everything else runs
//! unprivileged against a SQLite lifecycle store.
//!
//! # Key Features
//!
//! - **Privilege separation** - one root daemon, one unix socket, typed actions only
//! - **Crash-safe lifecycle** - records are reserved before anything is realized
//! - **No leaked resources** - addresses and identifiers are released only on destroy
//! - **Two-phase GC** - suspend on expiry, destroy after a grace period
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vmhost::{
//!     ControlClient, CreateRequest, Database, HostConfig, Orchestrator, SystemRunner,
//!     TerraformRealizer,
//! };
//!
//! let config = HostConfig::load("/etc/vmhost/vmhost.yaml")?;
//! let orchestrator = Orchestrator::new(
//!     Database::open(&config.db_file)?,
//!     Arc::new(ControlClient::from_config(&config)),
//!     Arc::new(TerraformRealizer::from_config(&config, Arc::new(SystemRunner))),
//!     config,
//! );
//!
//! let created = orchestrator.create(&CreateRequest::new("web-1").cpu(2).apply(true))?;
//! println!("{} is at {}", created.vm_name, created.ip);
//!
//! orchestrator.destroy("web-1")?;
//! # Ok::<(), vmhost::Error>(())
//! ```

pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod gc;
pub mod logging;
pub mod manifest;
pub mod mint;
pub mod models;
pub mod orchestrator;
pub mod pool;
pub mod realizer;
pub mod runner;

pub use config::HostConfig;
pub use control::{Action, ControlClient, ControlError, ControlPlane, ControlServer};
pub use db::Database;
pub use error::{Error, Result};
pub use gc::{GcOptions, GcReport};
pub use manifest::Manifest;
pub use mint::{CommandMinter, TokenMinter};
pub use models::{CreateOutcome, CreateRequest, VmRecord, VmState, VmStatus};
pub use orchestrator::Orchestrator;
pub use realizer::{Realizer, TerraformRealizer};
pub use runner::{CommandRunner, SystemRunner};
