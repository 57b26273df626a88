//! BackupRestoreEngine: carry guest user state across a reset or clone.
//!
//! ```text
//! ensure_artifact ─┬─ cached?  ─────────────────────────────────┐
//!                  └─ boot if needed → capture → stop if booted │
//!                                                               ▼
//!            reprovision (stop, optional reimage, new instance-id) → start
//!                                                               │
//!   wait_running (fatal) → wait_ssh (fatal, re-resolving) → wait_provisioned
//!                                                               │
//!                       upload → restore (wipe, extract, re-seed key) → verify
//! ```
//!
//! Each step takes the previous step's value ([`Artifact`], [`ResolvedHost`])
//! rather than sharing mutable state. After the two reachability waits every
//! remote step is best-effort: failures become warnings on the report.

use std::path::PathBuf;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::{Settings, WaitPolicy};
use crate::error::{QvmError, Result};
use crate::net::ResolvedHost;
use crate::status::{Evaluation, VmStatus};
use crate::vm::remote::{GuestShell, GuestTarget, shell_quote};
use crate::vm::{VmLayout, VmRecord};

const REMOTE_ARCHIVE: &str = "/tmp/qvm-restore.tar.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupMode {
    /// The configured keep paths under the guest home.
    #[default]
    KeepSet,
    /// The whole home directory.
    FullHome,
}

impl BackupMode {
    fn artifact_name(self) -> &'static str {
        match self {
            BackupMode::KeepSet => "keep-backup.tar.gz",
            BackupMode::FullHome => "home-backup.tar.gz",
        }
    }

    pub fn artifact_path(self, layout: &VmLayout) -> PathBuf {
        layout.backup_dir().join(self.artifact_name())
    }
}

/// A host-side archive ready to be restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub mode: BackupMode,
    /// Taken from the cache rather than captured by this run.
    pub reused: bool,
}

/// What the engine needs from the lifecycle layer.
#[async_trait]
pub trait VmControl: Send + Sync {
    async fn observe(&self, vm: &VmRecord) -> Evaluation;
    async fn start(&self, vm: &VmRecord) -> Result<()>;
    async fn stop(&self, vm: &VmRecord) -> Result<()>;
    /// Stop the VM if it runs, optionally recreate its overlay from the base
    /// image, and issue a fresh instance-id. Returns the updated record.
    async fn reprovision(&self, vm: &VmRecord, reimage: bool) -> Result<VmRecord>;
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub keep_paths: Vec<String>,
    /// Operator key re-seeded into `authorized_keys` after the home wipe.
    pub public_key: String,
    pub running_wait: WaitPolicy,
    pub ssh_wait: WaitPolicy,
    pub provision_wait: WaitPolicy,
}

impl EngineSettings {
    pub fn from_settings(settings: &Settings, public_key: String) -> Self {
        Self {
            keep_paths: settings.keep_paths.clone(),
            public_key,
            running_wait: settings.running_wait,
            ssh_wait: settings.running_wait,
            provision_wait: WaitPolicy::new(60, std::time::Duration::from_secs(5)),
        }
    }
}

/// Can a reset preserve state without an extra boot right now?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feasibility {
    Cached,
    Running,
    NeedsBoot,
    /// Registered, but its directory is gone; nothing to reset.
    Missing,
}

impl Feasibility {
    pub fn check(vm: &VmRecord, mode: BackupMode, status: VmStatus) -> Self {
        if status == VmStatus::Missing || !vm.layout().exists() {
            Feasibility::Missing
        } else if mode.artifact_path(&vm.layout()).is_file() {
            Feasibility::Cached
        } else if status == VmStatus::Running {
            Feasibility::Running
        } else {
            Feasibility::NeedsBoot
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            Feasibility::Cached | Feasibility::Running => 0,
            Feasibility::NeedsBoot => 1,
            Feasibility::Missing => 2,
        }
    }
}

/// Exit status of `reset-check`. Any error means the VM is unusable.
pub fn reset_check_exit_code(outcome: &Result<Feasibility>) -> u8 {
    match outcome {
        Ok(feasibility) => feasibility.exit_code(),
        Err(_) => 2,
    }
}

#[derive(Debug, Clone)]
pub struct ResetReport {
    pub record: VmRecord,
    pub artifact: Artifact,
    pub host: ResolvedHost,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provisioning {
    Absent,
    Done,
    Failed,
    Pending,
}

fn parse_provisioning(output: &str) -> Provisioning {
    let Some(state) = output
        .lines()
        .find_map(|l| l.trim().strip_prefix("status:"))
        .map(str::trim)
    else {
        return Provisioning::Pending;
    };
    match state {
        "done" => Provisioning::Done,
        "absent" | "disabled" => Provisioning::Absent,
        "error" | "degraded" | "degraded done" => Provisioning::Failed,
        _ => Provisioning::Pending,
    }
}

fn quoted_list(items: &[String]) -> String {
    items.iter().map(|p| shell_quote(p)).collect::<Vec<_>>().join(" ")
}

/// Tar the requested content of `$HOME` to stdout.
pub fn capture_script(mode: BackupMode, keep: &[String]) -> String {
    match mode {
        BackupMode::FullHome => "cd \"$HOME\" || exit 1\ntar czf - .\n".to_string(),
        BackupMode::KeepSet => format!(
            "cd \"$HOME\" || exit 1\n\
             set --\n\
             for p in {list}; do [ -e \"$p\" ] && set -- \"$@\" \"$p\"; done\n\
             if [ $# -eq 0 ]; then tar czf - -T /dev/null; else tar czf - \"$@\"; fi\n",
            list = quoted_list(keep),
        ),
    }
}

/// Wipe home to the skeleton, extract, and re-seed the operator key
/// before and after extraction.
pub fn restore_script(public_key: &str) -> String {
    format!(
        "archive={archive}\n\
         key={key}\n\
         reseed() {{\n\
         \x20 mkdir -p \"$HOME/.ssh\" && chmod 700 \"$HOME/.ssh\" && touch \"$HOME/.ssh/authorized_keys\" &&\n\
         \x20 {{ grep -qxF \"$key\" \"$HOME/.ssh/authorized_keys\" || printf '%s\\n' \"$key\" >> \"$HOME/.ssh/authorized_keys\"; }} &&\n\
         \x20 chmod 600 \"$HOME/.ssh/authorized_keys\"\n\
         }}\n\
         cd / || exit 1\n\
         find \"$HOME\" -mindepth 1 -maxdepth 1 -exec rm -rf {{}} + 2>/dev/null\n\
         cp -a /etc/skel/. \"$HOME\"/ 2>/dev/null\n\
         reseed\n\
         rc=0\n\
         tar xzf \"$archive\" -C \"$HOME\" || rc=$?\n\
         reseed\n\
         sudo -n chown -R \"$(id -u):$(id -g)\" \"$HOME\" 2>/dev/null || true\n\
         [ -d \"$HOME/.ssh\" ] && find \"$HOME/.ssh\" -type f -name 'id_*' ! -name '*.pub' -exec chmod 600 {{}} +\n\
         exit $rc\n",
        archive = REMOTE_ARCHIVE,
        key = shell_quote(public_key.trim()),
    )
}

/// Re-extract keep items missing after restore, then drop the upload.
/// Full-home archives are taken from `.`, so their members carry a `./`
/// prefix.
pub fn verify_script(mode: BackupMode, keep: &[String]) -> String {
    if keep.is_empty() {
        return format!("rm -f {REMOTE_ARCHIVE}\n");
    }
    let member = match mode {
        BackupMode::KeepSet => "$p",
        BackupMode::FullHome => "./$p",
    };
    format!(
        "archive={archive}\n\
         for p in {list}; do\n\
         \x20 if [ ! -e \"$HOME/$p\" ]; then\n\
         \x20   if tar xzf \"$archive\" -C \"$HOME\" \"{member}\" 2>/dev/null; then echo \"restored $p\"; else echo \"absent $p\"; fi\n\
         \x20 fi\n\
         done\n\
         rm -f \"$archive\"\n",
        archive = REMOTE_ARCHIVE,
        list = quoted_list(keep),
    )
}

pub struct BackupRestoreEngine<'a> {
    control: &'a dyn VmControl,
    shell: &'a dyn GuestShell,
    settings: EngineSettings,
}

impl<'a> BackupRestoreEngine<'a> {
    pub fn new(
        control: &'a dyn VmControl,
        shell: &'a dyn GuestShell,
        settings: EngineSettings,
    ) -> Self {
        Self {
            control,
            shell,
            settings,
        }
    }

    /// Reset `vm` to a clean slate, preserving the `mode` content.
    pub async fn reset(
        &self,
        vm: &VmRecord,
        mode: BackupMode,
        reimage: bool,
    ) -> Result<ResetReport> {
        let artifact = self.ensure_artifact(vm, mode).await?;
        let record = self.control.reprovision(vm, reimage).await?;
        self.control.start(&record).await?;
        self.restore_into(&record, artifact).await
    }

    /// Move the `mode` content of `source` into the freshly created `target`.
    pub async fn carry_over(
        &self,
        source: &VmRecord,
        target: &VmRecord,
        mode: BackupMode,
    ) -> Result<ResetReport> {
        let artifact = self.ensure_artifact(source, mode).await?;
        self.control.start(target).await?;
        self.restore_into(target, artifact).await
    }

    /// The cached artifact, or a freshly captured one. Boots the VM only when
    /// there is no cache and it is not already running, and stops it again
    /// afterwards.
    pub async fn ensure_artifact(&self, vm: &VmRecord, mode: BackupMode) -> Result<Artifact> {
        let layout = vm.layout();
        let path = mode.artifact_path(&layout);
        if path.is_file() {
            info!(vm = %vm.name, path = %path.display(), "reusing cached backup");
            return Ok(Artifact {
                path,
                mode,
                reused: true,
            });
        }

        let status = self.control.observe(vm).await.status;
        if status == VmStatus::Paused {
            return Err(QvmError::remote(
                "backup",
                format!("VM {} is paused; resume it first", vm.name),
            ));
        }
        let booted_for_backup = !status.has_process();
        if booted_for_backup {
            info!(vm = %vm.name, "starting VM to capture backup");
            self.control.start(vm).await?;
        }

        let captured = self.capture(vm, mode, &path).await;

        if booted_for_backup {
            if let Err(e) = self.control.stop(vm).await {
                warn!(vm = %vm.name, error = %e, "failed to stop VM after backup");
            }
        }
        captured?;
        Ok(Artifact {
            path,
            mode,
            reused: false,
        })
    }

    async fn capture(&self, vm: &VmRecord, mode: BackupMode, dest: &std::path::Path) -> Result<()> {
        let host = self.wait_running(vm).await?;
        let host = self.wait_ssh(vm, host).await?;
        let target = GuestTarget::new(host.ip, &vm.username);

        let dir = vm.layout().backup_dir();
        std::fs::create_dir_all(&dir)?;
        let tmp = NamedTempFile::new_in(&dir)?;
        let script = capture_script(mode, &self.settings.keep_paths);
        self.shell.run_to_file(&target, "capture backup", &script, tmp.path()).await?;
        if tmp.as_file().metadata()?.len() == 0 {
            return Err(QvmError::remote("capture backup", "guest produced an empty archive"));
        }
        tmp.persist(dest).map_err(|e| e.error)?;
        info!(vm = %vm.name, path = %dest.display(), "backup captured");
        Ok(())
    }

    /// Poll until the VM reports `running`; fatal on exhaustion.
    pub async fn wait_running(&self, vm: &VmRecord) -> Result<ResolvedHost> {
        let policy = self.settings.running_wait;
        for attempt in 1..=policy.attempts {
            let eval = self.control.observe(vm).await;
            if let (VmStatus::Running, Some(host)) = (eval.status, eval.host) {
                return Ok(host);
            }
            debug!(vm = %vm.name, attempt, status = %eval.status, "waiting for running state");
            if attempt < policy.attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }
        Err(QvmError::Timeout {
            what: format!("VM {} did not reach running state", vm.name),
            bound: policy.describe(),
        })
    }

    /// Wait for key-based ssh on the current best address, re-resolving it
    /// between attempts; fatal on exhaustion.
    pub async fn wait_ssh(&self, vm: &VmRecord, mut host: ResolvedHost) -> Result<ResolvedHost> {
        let policy = self.settings.ssh_wait;
        for attempt in 1..=policy.attempts {
            let target = GuestTarget::new(host.ip, &vm.username);
            if host.ssh_reachable && self.shell.probe(&target).await {
                return Ok(host);
            }
            debug!(vm = %vm.name, attempt, ip = %host.ip, "waiting for ssh");
            if attempt < policy.attempts {
                tokio::time::sleep(policy.interval).await;
            }
            if let Some(fresh) = self.control.observe(vm).await.host {
                if fresh.ip != host.ip {
                    info!(
                        vm = %vm.name,
                        old = %host.ip,
                        new = %fresh.ip,
                        "address changed while waiting"
                    );
                }
                host = fresh;
            }
        }
        Err(QvmError::Timeout {
            what: format!("SSH on VM {} did not become available", vm.name),
            bound: policy.describe(),
        })
    }

    async fn wait_provisioned(&self, target: &GuestTarget, warnings: &mut Vec<String>) {
        let script = "if ! command -v cloud-init >/dev/null 2>&1; then echo 'status: absent'; \
                      else cloud-init status 2>/dev/null || true; fi";
        let policy = self.settings.provision_wait;
        for attempt in 1..=policy.attempts {
            let reply = self.shell.run(target, "cloud-init status", script).await;
            match reply.map(|o| parse_provisioning(&o)) {
                Ok(Provisioning::Done | Provisioning::Absent) => return,
                Ok(Provisioning::Failed) => {
                    soft(warnings, "cloud-init", "provisioning reported an error".to_string());
                    return;
                }
                Ok(Provisioning::Pending) => debug!(attempt, "provisioning still running"),
                Err(e) => debug!(attempt, error = %e, "provisioning status unavailable"),
            }
            if attempt < policy.attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }
        soft(
            warnings,
            "cloud-init",
            format!("provisioning did not finish within {}; continuing", policy.describe()),
        );
    }

    async fn restore_into(&self, vm: &VmRecord, artifact: Artifact) -> Result<ResetReport> {
        let mut warnings = Vec::new();
        let host = self.wait_running(vm).await?;
        let host = self.wait_ssh(vm, host).await?;
        let target = GuestTarget::new(host.ip, &vm.username);

        self.wait_provisioned(&target, &mut warnings).await;

        match self.shell.upload(&target, &artifact.path, REMOTE_ARCHIVE).await {
            Ok(()) => {
                let script = restore_script(&self.settings.public_key);
                if let Err(e) = self.shell.run(&target, "restore", &script).await {
                    soft(&mut warnings, "restore", e.to_string());
                }
                self.verify(&target, artifact.mode, &mut warnings).await;
            }
            Err(e) => soft(&mut warnings, "upload", e.to_string()),
        }

        info!(vm = %vm.name, ip = %host.ip, warnings = warnings.len(), "restore finished");
        Ok(ResetReport {
            record: vm.clone(),
            artifact,
            host,
            warnings,
        })
    }

    async fn verify(&self, target: &GuestTarget, mode: BackupMode, warnings: &mut Vec<String>) {
        let script = verify_script(mode, &self.settings.keep_paths);
        match self.shell.run(target, "verify", &script).await {
            Ok(out) => {
                for line in out.lines() {
                    if let Some(item) = line.strip_prefix("restored ") {
                        let detail = format!("{item} was missing after restore; re-extracted");
                        soft(warnings, "verify", detail);
                    } else if let Some(item) = line.strip_prefix("absent ") {
                        debug!(item, "keep item not present in backup");
                    }
                }
            }
            Err(e) => soft(warnings, "verify", e.to_string()),
        }
    }
}

fn soft(warnings: &mut Vec<String>, step: &str, detail: String) {
    warn!(step, %detail, "continuing after remote step failure");
    warnings.push(format!("{step}: {detail}"));
}
