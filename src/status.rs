//! StatusStateMachine: live lifecycle state, recomputed on every query.
//!
//! ```text
//! directory missing                          → missing
//! no emulator process                        → stopped
//! QMP reports paused/suspended               → paused
//! no best IP                                 → initializing
//! best IP, port 22 closed                    → booting
//! best IP, port 22 open                      → running
//! ```
//!
//! Nothing here is persisted. Probe failures degrade towards the less
//! alarming state: an unanswered QMP query means "not paused".

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::arch::Architecture;
use crate::config::Settings;
use crate::net::resolver::ResolverSettings;
use crate::net::{
    ArpSnapshot, BestIpResolver, IpSource, NetworkSignals, QueryMode, ResolvedHost, SystemNetwork,
};
use crate::vm::VmRecord;
use crate::vm::process::{
    LiveProcess, ProcessProbe, ProcessSnapshot, ProcessTable, SystemProcessTable,
};
use crate::vm::qmp::{ControlChannel, QmpClient, RunState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Missing,
    Stopped,
    Paused,
    Initializing,
    Booting,
    Running,
}

impl VmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::Missing => "missing",
            VmStatus::Stopped => "stopped",
            VmStatus::Paused => "paused",
            VmStatus::Initializing => "initializing",
            VmStatus::Booting => "booting",
            VmStatus::Running => "running",
        }
    }

    /// An emulator process exists.
    pub fn has_process(self) -> bool {
        !matches!(self, VmStatus::Missing | VmStatus::Stopped)
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SshStatus {
    Reachable,
    Unreachable,
    Unknown,
}

/// The status ladder as a pure function of the collected evidence.
pub fn classify(
    dir_exists: bool,
    process: Option<&LiveProcess>,
    run_state: Option<RunState>,
    mode: QueryMode,
    host: Option<&ResolvedHost>,
) -> VmStatus {
    if !dir_exists {
        return VmStatus::Missing;
    }
    if process.is_none() {
        return VmStatus::Stopped;
    }
    if run_state == Some(RunState::Paused) {
        return VmStatus::Paused;
    }
    if mode == QueryMode::Basic {
        return VmStatus::Running;
    }
    match host {
        None => VmStatus::Initializing,
        Some(h) if !h.ssh_reachable => VmStatus::Booting,
        Some(_) => VmStatus::Running,
    }
}

/// Everything reported by `qvm status`.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub name: String,
    pub status: VmStatus,
    pub hostname: String,
    pub username: String,
    pub ip_address: Option<Ipv4Addr>,
    pub ip_source: Option<IpSource>,
    pub mac_address: String,
    pub pid: Option<u32>,
    pub uptime: Option<String>,
    pub uptime_seconds: Option<u64>,
    pub ssh_status: SshStatus,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub disk_size: String,
    pub os_version: String,
    pub architecture: Architecture,
    pub directory: PathBuf,
}

impl LiveStatus {
    pub fn render_human(&self) -> String {
        let dash = || "-".to_string();
        let rows: [(&str, String); 15] = [
            ("name", self.name.clone()),
            ("status", self.status.to_string()),
            ("hostname", self.hostname.clone()),
            ("username", self.username.clone()),
            ("ip_address", self.ip_address.map(|i| i.to_string()).unwrap_or_else(dash)),
            ("mac_address", self.mac_address.clone()),
            ("pid", self.pid.map(|p| p.to_string()).unwrap_or_else(dash)),
            ("uptime", self.uptime.clone().unwrap_or_else(dash)),
            ("ssh_status", format!("{:?}", self.ssh_status).to_lowercase()),
            ("memory_mb", self.memory_mb.to_string()),
            ("vcpus", self.vcpus.to_string()),
            ("disk_size", self.disk_size.clone()),
            ("os_version", self.os_version.clone()),
            ("architecture", self.architecture.to_string()),
            ("directory", self.directory.display().to_string()),
        ];
        rows.iter()
            .map(|(k, v)| format!("{k:<13} {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Table for `qvm list`.
pub fn render_table(rows: &[LiveStatus]) -> String {
    let mut out = format!(
        "{:<20} {:<13} {:<16} {:<7} {:<10} {}\n",
        "NAME", "STATUS", "IP", "PID", "UPTIME", "SSH"
    );
    for s in rows {
        out.push_str(&format!(
            "{:<20} {:<13} {:<16} {:<7} {:<10} {}\n",
            s.name,
            s.status,
            s.ip_address.map(|i| i.to_string()).unwrap_or_else(|| "-".into()),
            s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            s.uptime.as_deref().unwrap_or("-"),
            format!("{:?}", s.ssh_status).to_lowercase(),
        ));
    }
    out
}

pub fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    let (days, hours, mins, s) = (secs / 86400, secs / 3600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m {s}s")
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// The host-facing seams, bundled.
#[derive(Clone)]
pub struct Probes {
    pub processes: Arc<dyn ProcessTable>,
    pub network: Arc<dyn NetworkSignals>,
    pub control: Arc<dyn ControlChannel>,
}

impl Probes {
    pub fn system(settings: &Settings) -> Self {
        Self {
            processes: Arc::new(SystemProcessTable),
            network: Arc::new(SystemNetwork::new(settings)),
            control: Arc::new(QmpClient::new(settings.probe_timeout * 2)),
        }
    }
}

/// Process table and neighbor table captured once for a batch query.
#[derive(Debug, Clone, Default)]
pub struct BatchSnapshot {
    pub processes: ProcessSnapshot,
    pub arp: ArpSnapshot,
}

impl BatchSnapshot {
    pub async fn capture(probes: &Probes) -> Self {
        Self {
            processes: ProcessSnapshot::capture(probes.processes.as_ref()).await,
            arp: ArpSnapshot::capture(probes.network.as_ref()).await,
        }
    }
}

/// Status together with the process and address it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub status: VmStatus,
    pub process: Option<LiveProcess>,
    pub host: Option<ResolvedHost>,
}

pub struct StatusMachine<'a> {
    probes: &'a Probes,
    resolver: ResolverSettings,
}

impl<'a> StatusMachine<'a> {
    pub fn new(probes: &'a Probes, resolver: ResolverSettings) -> Self {
        Self { probes, resolver }
    }

    /// Live process for `vm`, if any.
    pub async fn process(
        &self,
        vm: &VmRecord,
        batch: Option<&BatchSnapshot>,
    ) -> Option<LiveProcess> {
        ProcessProbe::new(self.probes.processes.as_ref())
            .find(vm, batch.map(|b| &b.processes))
            .await
    }

    /// Walk the ladder once and keep the evidence.
    pub async fn evaluate(
        &self,
        vm: &VmRecord,
        mode: QueryMode,
        batch: Option<&BatchSnapshot>,
    ) -> Evaluation {
        let layout = vm.layout();
        let dir_exists = layout.exists();

        let process = if dir_exists {
            self.process(vm, batch).await
        } else {
            None
        };

        let run_state = match process {
            Some(_) => self.probes.control.run_state(&layout.qmp_socket()).await,
            None => None,
        };

        let host = if process.is_some() && run_state != Some(RunState::Paused) {
            BestIpResolver::new(self.probes.network.as_ref(), self.resolver)
                .resolve(vm, process.as_ref(), mode, batch.map(|b| &b.arp))
                .await
        } else {
            None
        };

        let status = classify(dir_exists, process.as_ref(), run_state, mode, host.as_ref());
        debug!(vm = %vm.name, %status, ?host, "status computed");
        Evaluation { status, process, host }
    }

    pub async fn query(
        &self,
        vm: &VmRecord,
        mode: QueryMode,
        batch: Option<&BatchSnapshot>,
    ) -> LiveStatus {
        let Evaluation { status, process, host } = self.evaluate(vm, mode, batch).await;

        let elapsed = match process {
            Some(p) => self.probes.processes.elapsed(p.pid).await,
            None => None,
        };

        let ssh_status = match (&host, mode) {
            (Some(h), _) if h.ssh_reachable => SshStatus::Reachable,
            (_, QueryMode::Basic) => SshStatus::Unknown,
            _ if status.has_process() => SshStatus::Unreachable,
            _ => SshStatus::Unknown,
        };

        LiveStatus {
            name: vm.name.clone(),
            status,
            hostname: vm.hostname.clone(),
            username: vm.username.clone(),
            ip_address: host.map(|h| h.ip),
            ip_source: host.map(|h| h.source),
            mac_address: vm.mac_address.clone(),
            pid: process.map(|p| p.pid),
            uptime: elapsed.map(format_uptime),
            uptime_seconds: elapsed.map(|d| d.as_secs()),
            ssh_status,
            memory_mb: vm.memory_mb,
            vcpus: vm.vcpus,
            disk_size: vm.disk_size.clone(),
            os_version: vm.os.clone(),
            architecture: vm.architecture,
            directory: vm.directory.clone(),
        }
    }

    /// Query many VMs. Fast and basic modes share one process-table and
    /// neighbor-table capture across the whole batch.
    pub async fn query_many(&self, vms: &[VmRecord], mode: QueryMode) -> Vec<LiveStatus> {
        let batch = match mode {
            QueryMode::Full => None,
            QueryMode::Fast | QueryMode::Basic => Some(BatchSnapshot::capture(self.probes).await),
        };
        let mut out = Vec::with_capacity(vms.len());
        for vm in vms {
            out.push(self.query(vm, mode, batch.as_ref()).await);
        }
        out
    }
}
