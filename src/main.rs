//! qvm command-line interface.
//!
//! Each invocation is one short-lived process running one operation on a
//! single-threaded runtime.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use qvm::arch::Architecture;
use qvm::backup::{BackupMode, ResetReport, reset_check_exit_code};
use qvm::config::{ExplicitSource, Key, Layered, Settings};
use qvm::net::QueryMode;
use qvm::paths::QvmPaths;
use qvm::status;
use qvm::vm::lifecycle::{CloneOptions, CreateOptions, Manager};

/// Manage QEMU VMs on this host
#[derive(Parser, Debug)]
#[command(name = "qvm", version, about = "Single-host QEMU VM manager")]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding one subdirectory per VM
    #[arg(long, global = true)]
    vms_dir: Option<PathBuf>,

    /// Registry document
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Private key for guest access (its .pub is installed in guests)
    #[arg(long, global = true)]
    ssh_key: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Copy)]
struct ModeFlags {
    /// Share one ARP and process snapshot; skip DNS and console
    #[arg(long, conflicts_with = "basic")]
    fast: bool,

    /// Process liveness only
    #[arg(long)]
    basic: bool,
}

impl ModeFlags {
    fn mode(self) -> QueryMode {
        match (self.fast, self.basic) {
            (_, true) => QueryMode::Basic,
            (true, _) => QueryMode::Fast,
            _ => QueryMode::Full,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct BackupFlags {
    /// Preserve the whole home directory instead of the keep set
    #[arg(long)]
    full_home: bool,

    /// Comma-separated keep set overriding keep_paths
    #[arg(long)]
    keep: Option<String>,
}

impl BackupFlags {
    fn mode(&self) -> BackupMode {
        if self.full_home {
            BackupMode::FullHome
        } else {
            BackupMode::KeepSet
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a VM from a cloud image
    Create {
        name: String,
        /// Base cloud image the overlay is backed by
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        arch: Option<Architecture>,
        #[arg(long)]
        memory: Option<u32>,
        #[arg(long)]
        vcpus: Option<u32>,
        #[arg(long)]
        disk_size: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
        /// OS label shown as os_version
        #[arg(long)]
        os: Option<String>,
        /// Start the VM once created
        #[arg(long)]
        start: bool,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
        /// Skip the graceful power-down
        #[arg(long)]
        force: bool,
    },
    Pause {
        name: String,
    },
    Resume {
        name: String,
    },
    /// Delete a VM, its directory and its hosts entry
    Destroy {
        name: String,
        #[arg(long)]
        force: bool,
    },
    Clone {
        source: String,
        target: String,
        /// Clone a running source
        #[arg(long)]
        force: bool,
        /// Fresh overlay; carry user state over from the source
        #[arg(long)]
        reset: bool,
        #[command(flatten)]
        backup: BackupFlags,
    },
    /// Reprovision a VM, preserving selected home content
    Reset {
        name: String,
        /// Recreate the overlay from the base image
        #[arg(long)]
        reimage: bool,
        #[command(flatten)]
        backup: BackupFlags,
    },
    /// Exit 0 if a reset needs no extra boot, 1 if it does, 2 if invalid
    ResetCheck {
        name: String,
        #[arg(long)]
        full_home: bool,
    },
    Status {
        name: String,
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        mode: ModeFlags,
    },
    List {
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        mode: ModeFlags,
    },
    /// Write current addresses to the hosts file
    HostsSync {
        names: Vec<String>,
    },
    /// Reconcile the registry with VM directories
    Sync,
    /// Show every setting and where it came from
    Config,
}

fn explicit_source(cli: &Cli) -> ExplicitSource {
    let mut explicit = ExplicitSource::default();
    if let Some(dir) = &cli.vms_dir {
        explicit.set(Key::VmsDir, dir.display().to_string());
    }
    if let Some(path) = &cli.registry {
        explicit.set(Key::RegistryPath, path.display().to_string());
    }
    if let Some(key) = &cli.ssh_key {
        explicit.set(Key::SshKey, key.display().to_string());
    }
    if let Command::Reset { backup, .. } | Command::Clone { backup, .. } = &cli.command {
        if let Some(keep) = &backup.keep {
            explicit.set(Key::KeepPaths, keep.clone());
        }
    }
    explicit
}

fn print_report(report: &ResetReport) {
    let how = if report.artifact.reused { "cached" } else { "fresh" };
    println!(
        "{}: restored from {} backup at {}",
        report.record.name,
        how,
        report.host.ip
    );
    for w in &report.warnings {
        eprintln!("qvm: warning: {w}");
    }
}

fn print_config(layers: &Layered) {
    for key in Key::ALL {
        match layers.lookup(key) {
            Some(r) => println!("{:<28} {:<40} ({})", key.name(), r.value, r.source),
            None => println!("{:<28} -", key.name()),
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let (layers, paths) = Layered::for_process(explicit_source(&cli))?;

    // Shown even when a value would fail to parse.
    if let Command::Config = cli.command {
        print_config(&layers);
        return Ok(ExitCode::SUCCESS);
    }

    let settings = Settings::from_layers(&layers)?;
    paths.ensure().context("creating qvm directories")?;
    std::fs::create_dir_all(&settings.vms_dir)
        .with_context(|| format!("creating {}", settings.vms_dir.display()))?;
    let manager = Manager::new(settings);

    match cli.command {
        Command::Create {
            name,
            image,
            arch,
            memory,
            vcpus,
            disk_size,
            username,
            hostname,
            os,
            start,
        } => {
            let opts = CreateOptions {
                base_image: image,
                arch,
                memory_mb: memory,
                vcpus,
                disk_size,
                username,
                hostname,
                os,
            };
            let vm = manager.create(&name, opts).await?;
            println!("created {} ({})", vm.name, vm.mac_address);
            if start {
                manager.start(&vm).await?;
                println!("started {}", vm.name);
            }
        }
        Command::Start { name } => {
            manager.start(&manager.get(&name)?).await?;
            println!("started {name}");
        }
        Command::Stop { name, force } => {
            manager.stop(&manager.get(&name)?, force).await?;
            println!("stopped {name}");
        }
        Command::Pause { name } => {
            manager.pause(&manager.get(&name)?).await?;
            println!("paused {name}");
        }
        Command::Resume { name } => {
            manager.resume(&manager.get(&name)?).await?;
            println!("resumed {name}");
        }
        Command::Destroy { name, force } => {
            manager.destroy(&name, force).await?;
            println!("destroyed {name}");
        }
        Command::Clone {
            source,
            target,
            force,
            reset,
            backup,
        } => {
            let opts = CloneOptions {
                force,
                reset: reset.then(|| backup.mode()),
            };
            let (vm, report) = manager.clone_vm(&source, &target, opts).await?;
            println!("cloned {source} -> {} ({})", vm.name, vm.mac_address);
            if let Some(report) = report {
                print_report(&report);
            }
        }
        Command::Reset { name, reimage, backup } => {
            let report = manager.reset(&name, backup.mode(), reimage).await?;
            print_report(&report);
        }
        Command::ResetCheck { name, full_home } => {
            let mode = if full_home {
                BackupMode::FullHome
            } else {
                BackupMode::KeepSet
            };
            let outcome = manager.reset_check(&name, mode).await;
            match &outcome {
                Ok(feasibility) => debug!(vm = %name, ?feasibility, "reset check"),
                Err(e) => eprintln!("qvm: error: {e}"),
            }
            return Ok(ExitCode::from(reset_check_exit_code(&outcome)));
        }
        Command::Status { name, json, mode } => {
            let s = manager.status(&name, mode.mode()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&s)?);
            } else {
                println!("{}", s.render_human());
            }
        }
        Command::List { json, mode } => {
            let rows = manager.list(mode.mode()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print!("{}", status::render_table(&rows));
            }
        }
        Command::HostsSync { names } => {
            let updates = manager.hosts_sync(&names).await?;
            debug!(
                file = %manager.settings().hosts_file.display(),
                count = updates.len(),
                "hosts synced"
            );
            for (name, ip) in updates {
                match ip {
                    Some(ip) => println!("{ip}\t{name}"),
                    None => println!("-\t{name} (removed)"),
                }
            }
        }
        Command::Sync => {
            let report = manager.sync()?;
            debug!(registry = %manager.registry().path().display(), "registry synced");
            for name in &report.removed {
                println!("removed {name}");
            }
            for name in &report.absorbed {
                println!("absorbed {name}");
            }
        }
        Command::Config => print_config(&layers),
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_dir = QvmPaths::resolve()
        .map(|p| p.logs)
        .unwrap_or_else(|| std::env::temp_dir().join("qvm"));
    let _log_guard = qvm::logging::init(&log_dir, cli.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("qvm: error: failed to create runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            debug!(error = ?e, "command failed");
            eprintln!("qvm: error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
