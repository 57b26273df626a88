//! VM lifecycle operations.
//!
//! ```text
//! Manager
//!   ├─► create   validate → qemu-img overlay → seed → register
//!   ├─► start    qemu-system-* -daemonize → wait for qemu.pid
//!   ├─► stop     QMP system_powerdown → SIGTERM → SIGKILL
//!   ├─► pause / resume   QMP stop / cont
//!   ├─► destroy  refuse if running (unless forced) → rm dir, registry, hosts
//!   ├─► clone    copy overlay, or fresh overlay + BackupRestoreEngine
//!   └─► reset    BackupRestoreEngine
//! ```
//!
//! Every live-state question goes through [`StatusMachine`]; the Manager
//! never caches a status, pid or address.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::process::{LiveProcess, ProcessProbe};
use super::qmp::QmpClient;
use super::remote::{GuestShell, SshShell};
use super::seed::{self, SeedConfig};
use super::{NetworkMode, VmLayout, VmRecord, derive_mac, new_instance_id, validate_name};
use crate::arch::Architecture;
use crate::backup::{
    BackupMode, BackupRestoreEngine, EngineSettings, Feasibility, ResetReport, VmControl,
};
use crate::config::Settings;
use crate::error::{QvmError, Result};
use crate::hosts::HostsFile;
use crate::net::QueryMode;
use crate::net::resolver::ResolverSettings;
use crate::registry::{Registry, SyncReport};
use crate::status::{Evaluation, LiveStatus, Probes, StatusMachine};

const PIDFILE_WAIT: Duration = Duration::from_secs(10);
const POWERDOWN_GRACE: Duration = Duration::from_secs(60);
const TERM_GRACE: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub base_image: std::path::PathBuf,
    pub arch: Option<Architecture>,
    pub memory_mb: Option<u32>,
    pub vcpus: Option<u32>,
    pub disk_size: Option<String>,
    pub username: Option<String>,
    pub hostname: Option<String>,
    pub os: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CloneOptions {
    /// Clone a running source anyway.
    pub force: bool,
    /// Start from a fresh overlay and carry user state over instead of
    /// copying the disk.
    pub reset: Option<BackupMode>,
}

/// Build the emulator command line for `vm`.
pub fn build_qemu_command(vm: &VmRecord, network: &NetworkMode) -> Command {
    let spec = vm.architecture.spec();
    let layout = vm.layout();
    let mut cmd = Command::new(spec.binary);

    cmd.arg("-name").arg(&vm.name);
    cmd.arg("-machine").arg(format!("{},accel={}", spec.machine, spec.accel));
    cmd.arg("-cpu").arg(spec.cpu);
    cmd.arg("-m").arg(vm.memory_mb.to_string());
    cmd.arg("-smp").arg(vm.vcpus.to_string());

    if let Some(fw) = spec.find_firmware() {
        cmd.arg("-bios").arg(fw);
    } else if !spec.firmware.is_empty() {
        warn!(arch = %vm.architecture, "no UEFI firmware found; guest may not boot");
    }

    cmd.arg("-drive").arg(format!(
        "file={},if=virtio,format=qcow2",
        layout.disk().display()
    ));
    cmd.arg("-drive").arg(format!(
        "file={},media=cdrom,readonly=on",
        layout.seed_iso().display()
    ));

    cmd.arg("-netdev").arg(network.netdev_arg());
    cmd.arg("-device")
        .arg(format!("virtio-net-pci,netdev=net0,mac={}", vm.mac_address));

    cmd.arg("-serial")
        .arg(format!("file:{}", layout.console_log().display()));
    cmd.arg("-display").arg("none");
    cmd.arg("-qmp").arg(format!(
        "unix:{},server=on,wait=off",
        layout.qmp_socket().display()
    ));
    cmd.arg("-pidfile").arg(layout.pid_file());
    cmd.arg("-daemonize");

    cmd
}

/// Run a host tool to completion; non-zero exit is an error carrying stderr.
async fn run_tool(program: &str, args: &[String]) -> Result<String> {
    debug!(program, ?args, "running");
    let out = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| QvmError::command(program, format!("failed to spawn: {e}")))?;
    if out.status.success() {
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    } else {
        Err(QvmError::command(
            program,
            format!(
                "exit {}: {}",
                out.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        ))
    }
}

/// Create `disk` as a qcow2 overlay on `base`.
async fn create_overlay(base: &Path, disk: &Path, size: &str) -> Result<()> {
    if !base.is_file() {
        return Err(QvmError::BaseImageMissing {
            path: base.to_path_buf(),
        });
    }
    let info = run_tool(
        "qemu-img",
        &["info".into(), "--output=json".into(), base.display().to_string()],
    )
    .await?;
    let format = serde_json::from_str::<serde_json::Value>(&info)?
        .get("format")
        .and_then(|f| f.as_str())
        .unwrap_or("qcow2")
        .to_string();
    run_tool(
        "qemu-img",
        &[
            "create".into(),
            "-f".into(),
            "qcow2".into(),
            "-F".into(),
            format,
            "-b".into(),
            base.display().to_string(),
            disk.display().to_string(),
            size.to_string(),
        ],
    )
    .await?;
    Ok(())
}

pub struct Manager {
    settings: Settings,
    registry: Registry,
    probes: Probes,
    qmp: QmpClient,
    shell: Arc<dyn GuestShell>,
}

impl Manager {
    pub fn new(settings: Settings) -> Self {
        let probes = Probes::system(&settings);
        let shell = Arc::new(SshShell::new(&settings.ssh_key, settings.ssh_timeout * 5));
        Self::with_parts(settings, probes, shell)
    }

    pub fn with_parts(settings: Settings, probes: Probes, shell: Arc<dyn GuestShell>) -> Self {
        Self {
            registry: Registry::new(&settings.registry_path),
            qmp: QmpClient::default(),
            settings,
            probes,
            shell,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn machine(&self) -> StatusMachine<'_> {
        StatusMachine::new(&self.probes, ResolverSettings::from(&self.settings))
    }

    async fn process(&self, vm: &VmRecord) -> Option<LiveProcess> {
        ProcessProbe::new(self.probes.processes.as_ref()).find(vm, None).await
    }

    pub fn get(&self, name: &str) -> Result<VmRecord> {
        validate_name(name)?;
        self.registry.get(name)?.ok_or_else(|| QvmError::VmNotFound {
            name: name.to_string(),
        })
    }

    // -- queries ------------------------------------------------------------

    pub async fn status(&self, name: &str, mode: QueryMode) -> Result<LiveStatus> {
        let vm = self.get(name)?;
        Ok(self.machine().query(&vm, mode, None).await)
    }

    pub async fn list(&self, mode: QueryMode) -> Result<Vec<LiveStatus>> {
        let vms = self.registry.list()?;
        Ok(self.machine().query_many(&vms, mode).await)
    }

    pub async fn reset_check(&self, name: &str, mode: BackupMode) -> Result<Feasibility> {
        let vm = self.get(name)?;
        let status = self.machine().evaluate(&vm, QueryMode::Full, None).await.status;
        Ok(Feasibility::check(&vm, mode, status))
    }

    /// Write current best addresses to the hosts file. Empty `names` means
    /// every registered VM.
    pub async fn hosts_sync(&self, names: &[String]) -> Result<BTreeMap<String, Option<Ipv4Addr>>> {
        let vms = if names.is_empty() {
            self.registry.list()?
        } else {
            names.iter().map(|n| self.get(n)).collect::<Result<Vec<_>>>()?
        };
        let machine = self.machine();
        let mut updates = BTreeMap::new();
        for vm in &vms {
            let host = machine.evaluate(vm, QueryMode::Full, None).await.host;
            updates.insert(vm.name.clone(), host.map(|h| h.ip));
        }
        HostsFile::new(&self.settings.hosts_file).update(&updates)?;
        Ok(updates)
    }

    pub fn sync(&self) -> Result<SyncReport> {
        self.registry.sync(&self.settings)
    }

    // -- create -------------------------------------------------------------

    pub async fn create(&self, name: &str, opts: CreateOptions) -> Result<VmRecord> {
        validate_name(name)?;
        let public_key = self.settings.ssh_public_key()?;
        if !opts.base_image.is_file() {
            return Err(QvmError::BaseImageMissing {
                path: opts.base_image.clone(),
            });
        }
        let layout = VmLayout::for_name(&self.settings.vms_dir, name)?;
        if layout.exists() || self.registry.get(name)?.is_some() {
            return Err(QvmError::VmAlreadyExists {
                name: name.to_string(),
            });
        }

        let now = Utc::now();
        let record = VmRecord {
            name: name.to_string(),
            directory: layout.dir.clone(),
            hostname: opts.hostname.unwrap_or_else(|| name.to_string()),
            username: opts.username.unwrap_or_else(|| self.settings.default_username.clone()),
            architecture: opts.arch.unwrap_or(self.settings.default_arch),
            mac_address: derive_mac(name),
            memory_mb: opts.memory_mb.unwrap_or(self.settings.default_memory_mb),
            vcpus: opts.vcpus.unwrap_or(self.settings.default_vcpus),
            disk_size: opts.disk_size.unwrap_or_else(|| self.settings.default_disk_size.clone()),
            instance_id: new_instance_id(name),
            os: opts.os.unwrap_or_else(|| self.settings.default_os.clone()),
            base_image: opts.base_image,
            created: now,
            updated: now,
        };

        std::fs::create_dir_all(&layout.dir)?;
        let built = async {
            create_overlay(&record.base_image, &layout.disk(), &record.disk_size).await?;
            seed::write_seed(&layout, &seed_config(&record, &public_key)).await?;
            self.registry.register(&record)
        }
        .await;
        if let Err(e) = built {
            if let Err(cleanup) = std::fs::remove_dir_all(&layout.dir) {
                warn!(
                    dir = %layout.dir.display(),
                    error = %cleanup,
                    "could not remove partial VM directory"
                );
            }
            return Err(e);
        }

        info!(vm = %name, mac = %record.mac_address, arch = %record.architecture, "created");
        Ok(record)
    }

    // -- power --------------------------------------------------------------

    pub async fn start(&self, vm: &VmRecord) -> Result<()> {
        let layout = vm.layout();
        if !layout.exists() {
            return Err(QvmError::VmNotFound {
                name: vm.name.clone(),
            });
        }
        if let Some(p) = self.process(vm).await {
            info!(vm = %vm.name, pid = p.pid, "already running");
            return Ok(());
        }

        // A previous boot's transcript would feed stale leases to the
        // console signal.
        tokio::fs::write(layout.console_log(), b"").await?;
        let _ = std::fs::remove_file(layout.qmp_socket());

        let mut cmd = build_qemu_command(vm, &self.settings.network);
        cmd.stdin(Stdio::null());
        let program = vm.architecture.spec().binary;
        let out = cmd
            .output()
            .await
            .map_err(|e| QvmError::command(program, format!("failed to spawn: {e}")))?;
        if !out.status.success() {
            return Err(QvmError::command(
                program,
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }

        let deadline = tokio::time::Instant::now() + PIDFILE_WAIT;
        loop {
            if let Some(p) = self.process(vm).await {
                info!(vm = %vm.name, pid = p.pid, "started");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(QvmError::Timeout {
                    what: format!("emulator for VM {} did not report a pid", vm.name),
                    bound: format!("{} seconds", PIDFILE_WAIT.as_secs()),
                });
            }
            tokio::time::sleep(POLL).await;
        }
    }

    async fn wait_exit(&self, pid: u32, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while self.probes.processes.is_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL).await;
        }
        true
    }

    /// Graceful power-down, escalating to signals. `force` goes straight to
    /// SIGKILL.
    pub async fn stop(&self, vm: &VmRecord, force: bool) -> Result<()> {
        let layout = vm.layout();
        let Some(process) = self.process(vm).await else {
            debug!(vm = %vm.name, "not running");
            return Ok(());
        };
        let pid = process.pid;

        let mut exited = false;
        if !force {
            match self.qmp.powerdown(&layout.qmp_socket()).await {
                Ok(()) => exited = self.wait_exit(pid, POWERDOWN_GRACE).await,
                Err(e) => warn!(vm = %vm.name, error = %e, "powerdown request failed"),
            }
            if !exited {
                info!(vm = %vm.name, pid, "sending SIGTERM");
                self.probes.processes.terminate(pid, false);
                exited = self.wait_exit(pid, TERM_GRACE).await;
            }
        }
        if !exited {
            info!(vm = %vm.name, pid, "sending SIGKILL");
            self.probes.processes.terminate(pid, true);
            exited = self.wait_exit(pid, TERM_GRACE).await;
        }
        if !exited {
            return Err(QvmError::Timeout {
                what: format!("VM {} (pid {pid}) did not exit", vm.name),
                bound: format!("{} seconds", (POWERDOWN_GRACE + TERM_GRACE * 2).as_secs()),
            });
        }

        let _ = std::fs::remove_file(layout.pid_file());
        let _ = std::fs::remove_file(layout.qmp_socket());
        info!(vm = %vm.name, "stopped");
        Ok(())
    }

    pub async fn pause(&self, vm: &VmRecord) -> Result<()> {
        self.require_process(vm).await?;
        self.qmp.pause(&vm.layout().qmp_socket()).await?;
        info!(vm = %vm.name, "paused");
        Ok(())
    }

    pub async fn resume(&self, vm: &VmRecord) -> Result<()> {
        self.require_process(vm).await?;
        self.qmp.resume(&vm.layout().qmp_socket()).await?;
        info!(vm = %vm.name, "resumed");
        Ok(())
    }

    async fn require_process(&self, vm: &VmRecord) -> Result<LiveProcess> {
        self.process(vm).await.ok_or_else(|| QvmError::VmNotRunning {
            name: vm.name.clone(),
        })
    }

    // -- destructive --------------------------------------------------------

    pub async fn destroy(&self, name: &str, force: bool) -> Result<()> {
        validate_name(name)?;
        let layout = VmLayout::for_name(&self.settings.vms_dir, name)?;
        let vm = match self.registry.get(name)? {
            Some(vm) => vm,
            None if layout.exists() => {
                // Unregistered directory: absorb it first so it can be probed.
                self.registry.sync(&self.settings)?;
                self.get(name)?
            }
            None => return Err(QvmError::VmNotFound { name: name.to_string() }),
        };

        if self.process(&vm).await.is_some() {
            if !force {
                return Err(QvmError::VmRunning {
                    name: name.to_string(),
                    operation: "destroy".to_string(),
                });
            }
            self.stop(&vm, true).await?;
        }

        let dir = vm.layout().dir;
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        self.registry.unregister(name)?;
        if let Err(e) = HostsFile::new(&self.settings.hosts_file).remove(name) {
            warn!(vm = %name, error = %e, "could not update hosts file");
        }
        info!(vm = %name, "destroyed");
        Ok(())
    }

    pub async fn clone_vm(
        &self,
        source: &str,
        target: &str,
        opts: CloneOptions,
    ) -> Result<(VmRecord, Option<ResetReport>)> {
        validate_name(target)?;
        let src = self.get(source)?;
        let public_key = self.settings.ssh_public_key()?;
        let layout = VmLayout::for_name(&self.settings.vms_dir, target)?;
        if layout.exists() || self.registry.get(target)?.is_some() {
            return Err(QvmError::VmAlreadyExists {
                name: target.to_string(),
            });
        }
        if opts.reset.is_none() && !opts.force && self.process(&src).await.is_some() {
            return Err(QvmError::VmRunning {
                name: source.to_string(),
                operation: "clone".to_string(),
            });
        }

        let now = Utc::now();
        let record = VmRecord {
            name: target.to_string(),
            directory: layout.dir.clone(),
            hostname: target.to_string(),
            mac_address: derive_mac(target),
            instance_id: new_instance_id(target),
            created: now,
            updated: now,
            ..src.clone()
        };

        std::fs::create_dir_all(&layout.dir)?;
        let built = async {
            match opts.reset {
                Some(_) => create_overlay(&src.base_image, &layout.disk(), &src.disk_size).await?,
                None => {
                    tokio::fs::copy(src.layout().disk(), layout.disk()).await?;
                }
            }
            seed::write_seed(&layout, &seed_config(&record, &public_key)).await?;
            self.registry.register(&record)
        }
        .await;
        if let Err(e) = built {
            let _ = std::fs::remove_dir_all(&layout.dir);
            return Err(e);
        }
        info!(source = %source, vm = %target, "cloned");

        let report = match opts.reset {
            Some(mode) => Some(self.engine(public_key).carry_over(&src, &record, mode).await?),
            None => None,
        };
        Ok((record, report))
    }

    pub async fn reset(&self, name: &str, mode: BackupMode, reimage: bool) -> Result<ResetReport> {
        let vm = self.get(name)?;
        let public_key = self.settings.ssh_public_key()?;
        self.engine(public_key).reset(&vm, mode, reimage).await
    }

    fn engine(&self, public_key: String) -> BackupRestoreEngine<'_> {
        BackupRestoreEngine::new(
            self,
            self.shell.as_ref(),
            EngineSettings::from_settings(&self.settings, public_key),
        )
    }
}

fn seed_config(vm: &VmRecord, public_key: &str) -> SeedConfig {
    SeedConfig {
        instance_id: vm.instance_id.clone(),
        hostname: vm.hostname.clone(),
        username: vm.username.clone(),
        public_key: public_key.to_string(),
    }
}

#[async_trait]
impl VmControl for Manager {
    async fn observe(&self, vm: &VmRecord) -> Evaluation {
        self.machine().evaluate(vm, QueryMode::Full, None).await
    }

    async fn start(&self, vm: &VmRecord) -> Result<()> {
        Manager::start(self, vm).await
    }

    async fn stop(&self, vm: &VmRecord) -> Result<()> {
        Manager::stop(self, vm, false).await
    }

    async fn reprovision(&self, vm: &VmRecord, reimage: bool) -> Result<VmRecord> {
        Manager::stop(self, vm, false).await?;
        let layout = vm.layout();
        if reimage {
            let disk = layout.disk();
            if disk.exists() {
                tokio::fs::remove_file(&disk).await?;
            }
            create_overlay(&vm.base_image, &disk, &vm.disk_size).await?;
        }
        let instance_id = new_instance_id(&vm.name);
        seed::rewrite_instance_id(&layout, &instance_id).await?;
        let record = VmRecord {
            instance_id,
            updated: Utc::now(),
            ..vm.clone()
        };
        self.registry.register(&record)?;
        info!(vm = %vm.name, reimage, instance_id = %record.instance_id, "reprovisioned");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn record() -> VmRecord {
        VmRecord {
            name: "alpha".into(),
            directory: "/vms/alpha".into(),
            hostname: "alpha".into(),
            username: "ubuntu".into(),
            architecture: Architecture::X86_64,
            mac_address: "52:54:00:11:22:33".into(),
            memory_mb: 4096,
            vcpus: 4,
            disk_size: "20G".into(),
            instance_id: "iid-alpha-1".into(),
            os: "ubuntu-24.04".into(),
            base_image: "/images/noble.img".into(),
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn qemu_command_uses_arch_table_and_layout() {
        let cmd = build_qemu_command(&record(), &NetworkMode::Bridge("virbr0".into()));
        assert_eq!(cmd.as_std().get_program(), OsStr::new("qemu-system-x86_64"));
        let a = args(&cmd);
        assert!(value_after(&a, "-machine")[0].starts_with("q35,accel="));
        assert_eq!(value_after(&a, "-m"), ["4096"]);
        assert_eq!(value_after(&a, "-smp"), ["4"]);
        assert_eq!(value_after(&a, "-netdev"), ["bridge,id=net0,br=virbr0"]);
        assert_eq!(
            value_after(&a, "-device"),
            ["virtio-net-pci,netdev=net0,mac=52:54:00:11:22:33"]
        );
        assert_eq!(value_after(&a, "-pidfile"), ["/vms/alpha/qemu.pid"]);
        assert_eq!(value_after(&a, "-serial"), ["file:/vms/alpha/console.log"]);
        assert_eq!(
            value_after(&a, "-qmp"),
            ["unix:/vms/alpha/qmp.sock,server=on,wait=off"]
        );
        assert!(a.contains(&"-daemonize".to_string()));
    }

    #[test]
    fn i386_uses_its_own_cpu_model() {
        let vm = VmRecord {
            architecture: Architecture::I386,
            ..record()
        };
        let cmd = build_qemu_command(&vm, &NetworkMode::User);
        assert_eq!(cmd.as_std().get_program(), OsStr::new("qemu-system-i386"));
        assert_eq!(value_after(&args(&cmd), "-cpu"), ["qemu32"]);
    }

    #[tokio::test]
    async fn overlay_requires_base_image() {
        let tmp = tempfile::tempdir().unwrap();
        let err = create_overlay(&tmp.path().join("missing.img"), &tmp.path().join("d.qcow2"), "1G")
            .await
            .unwrap_err();
        assert!(matches!(err, QvmError::BaseImageMissing { .. }));
    }
}
