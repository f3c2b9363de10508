//! vmhost CLI - VM lifecycle on a single hypervisor host
//!
//! Runs unprivileged. Privileged steps go through the vmhost-rootd socket.
//! Machine-readable output (create, list) goes to stdout, progress and
//! diagnostics to stderr.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use vmhost::config::{DEFAULT_CONFIG_PATH, MAX_GRACE_DAYS};
use vmhost::models::VmSummary;
use vmhost::{
    CommandMinter, ControlClient, CreateRequest, Database, GcOptions, HostConfig, Manifest,
    Orchestrator, Result, SystemRunner, TerraformRealizer, VmState,
};

#[derive(Parser)]
#[command(name = "vmhost")]
#[command(about = "Provision, track and retire VMs on this host")]
#[command(version)]
struct Cli {
    /// Path to the host configuration
    #[arg(long, global = true, env = "VMHOST_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a VM (plan only unless --apply)
    Create {
        /// VM name
        name: String,
        /// Owner wallet address
        #[arg(long, default_value = "")]
        owner: String,
        /// CPU cores
        #[arg(long, default_value = "1")]
        cpu: u32,
        /// Memory in MiB
        #[arg(long, default_value = "2048")]
        memory: u64,
        /// Disk size in GiB
        #[arg(long, default_value = "10")]
        disk: u32,
        /// Days until the VM expires
        #[arg(long)]
        expiry_days: Option<u32>,
        /// Login user inside the guest
        #[arg(long)]
        username: Option<String>,
        /// Actually create the VM
        #[arg(long)]
        apply: bool,
        /// Rendered boot configuration to attach
        #[arg(long)]
        rendered_config: Option<PathBuf>,
    },
    /// Destroy a VM and release its allocation (safe to repeat)
    Destroy {
        /// VM name
        name: String,
    },
    /// Start a suspended VM
    Start {
        /// VM name
        name: String,
    },
    /// Gracefully shut down a VM
    Stop {
        /// VM name
        name: String,
    },
    /// Power off a VM immediately
    Kill {
        /// VM name
        name: String,
    },
    /// Print active, suspended, destroyed or unknown
    Status {
        /// VM name
        name: String,
    },
    /// List all VM records
    List {
        /// Output format
        #[arg(long, value_enum, default_value_t = ListFormat::Tsv)]
        format: ListFormat,
    },
    /// Suspend expired VMs and destroy those past the grace period
    Gc {
        /// Apply changes (default is a dry run)
        #[arg(long)]
        execute: bool,
        /// Only run the suspend phase
        #[arg(long, conflicts_with = "destroy_only")]
        suspend_only: bool,
        /// Only run the destroy phase
        #[arg(long)]
        destroy_only: bool,
        /// Override the configured grace period
        #[arg(long, value_parser = clap::value_parser!(u32).range(0..=MAX_GRACE_DAYS as i64))]
        grace_days: Option<u32>,
    },
    /// Extend a VM's expiry and bring it back up
    Resume {
        /// VM name
        name: String,
        /// Days to add to the expiry
        #[arg(long, default_value = "30")]
        extend_days: u32,
        /// Check without changing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Retry a failed ownership token mint with a fresh token id
    Mint {
        /// VM name
        name: String,
    },
    /// Print or write the command discovery manifest
    Manifest {
        /// Executable recorded for every verb
        #[arg(long, default_value = "vmhost")]
        exe: String,
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ListFormat {
    Tsv,
    Json,
}

fn main() -> ExitCode {
    vmhost::logging::init("vmhost=info");
    let cli = Cli::parse();

    match cli.command {
        // Query commands always succeed
        Commands::Status { name } => {
            let state = match build(&cli.config) {
                Ok(orch) => orch.status(&name),
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot load lifecycle store");
                    VmState::Unknown
                }
            };
            println!("{}", state);
            ExitCode::SUCCESS
        }
        Commands::List { format } => {
            let rows = build(&cli.config).and_then(|orch| orch.list()).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Cannot list VMs");
                Vec::new()
            });
            print_list(&rows, format);
            ExitCode::SUCCESS
        }
        command => match run(&cli.config, command) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}

fn build(config_path: &Path) -> Result<Orchestrator> {
    let config = HostConfig::load(config_path)?;
    let db = Database::open(&config.db_file)?;
    db.verify_invariants()?;
    let runner = Arc::new(SystemRunner);
    let control = Arc::new(ControlClient::from_config(&config));
    let realizer = Arc::new(TerraformRealizer::from_config(&config, runner.clone()));
    let minter = config
        .tokens
        .minter
        .clone()
        .map(|m| Arc::new(CommandMinter::new(m, runner)));

    let orch = Orchestrator::new(db, control, realizer, config);
    Ok(match minter {
        Some(m) => orch.with_minter(m),
        None => orch,
    })
}

fn run(config_path: &Path, command: Commands) -> Result<()> {
    if let Commands::Manifest { exe, output } = &command {
        let manifest = Manifest::for_executable(exe);
        match output {
            Some(path) => {
                manifest.save(path)?;
                eprintln!("Manifest written to {}", path.display());
            }
            None => println!("{}", manifest.to_json()?),
        }
        return Ok(());
    }

    let orch = build(config_path)?;
    match command {
        Commands::Create {
            name,
            owner,
            cpu,
            memory,
            disk,
            expiry_days,
            username,
            apply,
            rendered_config,
        } => {
            let mut req = CreateRequest::new(name)
                .owner(owner)
                .cpu(cpu)
                .memory_mb(memory)
                .disk_gb(disk)
                .apply(apply);
            if let Some(days) = expiry_days {
                req = req.expiry_days(days);
            }
            if let Some(user) = username {
                req = req.username(user);
            }
            if let Some(path) = rendered_config {
                req = req.rendered_config(path);
            }

            let outcome = orch.create(&req)?;
            if let Some(plan) = &outcome.plan {
                eprintln!("{}", plan);
                eprintln!("Dry run: nothing was created. Re-run with --apply to create.");
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Destroy { name } => {
            println!("Destroying {}...", name);
            if orch.destroy(&name)? {
                println!("Done.");
            } else {
                println!("{} was already destroyed.", name);
            }
        }
        Commands::Start { name } => {
            println!("Starting {}...", name);
            orch.start(&name)?;
            println!("Done.");
        }
        Commands::Stop { name } => {
            println!("Stopping {}...", name);
            orch.stop(&name)?;
            println!("Done.");
        }
        Commands::Kill { name } => {
            println!("Killing {}...", name);
            orch.kill(&name)?;
            println!("Done.");
        }
        Commands::Gc {
            execute,
            suspend_only,
            destroy_only,
            grace_days,
        } => {
            let mut opts = GcOptions::new(grace_days.unwrap_or(orch.config().gc.grace_days)).execute(execute);
            if suspend_only {
                opts = opts.suspend_only();
            }
            if destroy_only {
                opts = opts.destroy_only();
            }
            let report = vmhost::gc::sweep(&orch, &opts)?;
            print!("{}", report);
        }
        Commands::Resume {
            name,
            extend_days,
            dry_run,
        } => {
            println!("Resuming {}...", name);
            let record = orch.resume(&name, extend_days, dry_run)?;
            if dry_run {
                println!("Dry run: {} would be active until {}.", name, record.expires_at);
            } else {
                println!("{} is active until {}.", name, record.expires_at);
            }
        }
        Commands::Mint { name } => {
            println!("Minting token for {}...", name);
            let token_id = orch.retry_mint(&name)?;
            println!("Minted token {}.", token_id);
        }
        Commands::Status { .. } | Commands::List { .. } | Commands::Manifest { .. } => {}
    }
    Ok(())
}

fn print_list(rows: &[VmSummary], format: ListFormat) {
    match format {
        ListFormat::Json => match serde_json::to_string_pretty(rows) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot encode VM list");
                println!("[]");
            }
        },
        ListFormat::Tsv => {
            println!("NAME\tSTATUS\tADDRESS\tCREATED");
            for r in rows {
                println!("{}\t{}\t{}\t{}", r.name, r.status, r.address, r.created.to_rfc3339());
            }
        }
    }
}
