//! vmhost-rootd - the root control daemon
//!
//! Loads the configured action modules, binds the control socket and serves
//! requests until SIGINT or SIGTERM. A module that fails to load is fatal.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use vmhost::config::DEFAULT_CONFIG_PATH;
use vmhost::control::registry::ModuleContext;
use vmhost::control::{ActionRegistry, ControlServer};
use vmhost::{HostConfig, Result, SystemRunner};

#[derive(Parser)]
#[command(name = "vmhost-rootd")]
#[command(about = "Privileged control daemon for vmhost")]
#[command(version)]
struct Cli {
    /// Path to the host configuration
    #[arg(long, env = "VMHOST_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the socket path from the configuration
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Load modules, print the action table and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    vmhost::logging::init("vmhost=info");
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Control daemon failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = HostConfig::load(&cli.config)?;
    if let Some(socket) = cli.socket {
        config.daemon.socket_path = socket;
    }

    let ctx = ModuleContext::from_config(&config.daemon, Arc::new(SystemRunner));
    let registry = ActionRegistry::from_config(&config.daemon, &ctx)?;
    if cli.check {
        for action in registry.actions() {
            println!("{}", action);
        }
        return Ok(());
    }

    let server = ControlServer::new(registry, config.daemon);
    let listener = server.bind()?;
    server.serve(listener, shutdown_signal()).await
}

async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot install SIGTERM handler, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
        _ = term.recv() => tracing::info!("Received SIGTERM"),
    }
}
