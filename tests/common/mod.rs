//! Fakes for the host-facing seams, shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use qvm::arch::Architecture;
use qvm::config::{DefaultSource, ExplicitSource, Key, Layered, Settings};
use qvm::net::{Neighbor, NetworkSignals, SSH_PORT, normalize_mac};
use qvm::paths::QvmPaths;
use qvm::status::Probes;
use qvm::vm::process::{ProcessEntry, ProcessTable};
use qvm::error::{QvmError, Result};
use qvm::vm::qmp::{ControlChannel, RunState};
use qvm::vm::remote::{GuestShell, GuestTarget};
use qvm::vm::{VmRecord, derive_mac};

// ---------------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeProcesses {
    entries: Mutex<Vec<ProcessEntry>>,
    pub list_calls: AtomicUsize,
}

impl FakeProcesses {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a running emulator for `vm`, its command line carrying the MAC.
    pub fn spawn_emulator(&self, pid: u32, vm: &VmRecord) {
        self.entries.lock().unwrap().push(ProcessEntry {
            pid,
            command: format!(
                "qemu-system-x86_64 -name {} -drive file={},if=virtio -device virtio-net-pci,netdev=net0,mac={}",
                vm.name,
                vm.layout().disk().display(),
                vm.mac_address
            ),
        });
    }

    pub fn kill_all(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessTable for FakeProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        self.entries.lock().unwrap().iter().any(|e| e.pid == pid)
    }

    async fn list(&self) -> Vec<ProcessEntry> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().clone()
    }

    async fn elapsed(&self, pid: u32) -> Option<Duration> {
        self.is_alive(pid).then(|| Duration::from_secs(307))
    }

    fn terminate(&self, pid: u32, _kill: bool) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.pid != pid);
        entries.len() != before
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Neighbor table, DNS answers and open SSH ports. Addresses in
/// `learnable` join the neighbor table once something connects to them.
#[derive(Default)]
pub struct FakeNetwork {
    neighbors: Mutex<Vec<Neighbor>>,
    learnable: Mutex<HashMap<Ipv4Addr, String>>,
    dns: Mutex<HashMap<String, Vec<Ipv4Addr>>>,
    open: Mutex<HashSet<Ipv4Addr>>,
    pub neighbor_calls: AtomicUsize,
    pub lookups: AtomicUsize,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `mac` may be in any form a host tool prints; it is canonicalized
    /// the way the real table parser does.
    pub fn neighbor(&self, ip: &str, mac: &str) {
        self.neighbors.lock().unwrap().push(Neighbor {
            ip: ip.parse().unwrap(),
            mac: normalize_mac(mac).unwrap(),
        });
    }

    pub fn clear_neighbors(&self) {
        self.neighbors.lock().unwrap().clear();
    }

    pub fn learnable(&self, ip: &str, mac: &str) {
        self.learnable
            .lock()
            .unwrap()
            .insert(ip.parse().unwrap(), normalize_mac(mac).unwrap());
    }

    pub fn dns(&self, name: &str, ips: &[&str]) {
        self.dns
            .lock()
            .unwrap()
            .insert(name.to_string(), ips.iter().map(|i| i.parse().unwrap()).collect());
    }

    pub fn open_ssh(&self, ip: &str) {
        self.open.lock().unwrap().insert(ip.parse().unwrap());
    }

    pub fn close_ssh(&self, ip: &str) {
        self.open.lock().unwrap().remove(&ip.parse().unwrap());
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbor_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkSignals for FakeNetwork {
    async fn neighbors(&self) -> Vec<Neighbor> {
        self.neighbor_calls.fetch_add(1, Ordering::SeqCst);
        self.neighbors.lock().unwrap().clone()
    }

    async fn lookup_host(&self, hostname: &str) -> Vec<Ipv4Addr> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.dns.lock().unwrap().get(hostname).cloned().unwrap_or_default()
    }

    async fn port_open(&self, ip: Ipv4Addr, port: u16, _timeout: Duration) -> bool {
        if let Some(mac) = self.learnable.lock().unwrap().remove(&ip) {
            self.neighbors.lock().unwrap().push(Neighbor { ip, mac });
        }
        port == SSH_PORT && self.open.lock().unwrap().contains(&ip)
    }
}

// ---------------------------------------------------------------------------
// QMP
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeQmp {
    state: Mutex<Option<RunState>>,
}

impl FakeQmp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, state: Option<RunState>) {
        *self.state.lock().unwrap() = state;
    }
}

#[async_trait]
impl ControlChannel for FakeQmp {
    async fn run_state(&self, _socket: &Path) -> Option<RunState> {
        *self.state.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Guest shell
// ---------------------------------------------------------------------------

/// Records every guest interaction. `run_to_file` writes `archive`; steps
/// named in `failing` return an error.
pub struct FakeShell {
    pub archive: Vec<u8>,
    pub failing: Mutex<HashSet<String>>,
    pub log: Mutex<Vec<String>>,
    pub uploads: Mutex<Vec<(GuestTarget, Vec<u8>, String)>>,
}

impl FakeShell {
    pub fn new() -> Arc<Self> {
        Self::with_archive(b"\x1f\x8bfake-home-archive")
    }

    pub fn with_archive(archive: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            archive: archive.to_vec(),
            failing: Mutex::new(HashSet::new()),
            log: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        })
    }

    pub fn fail(&self, step: &str) {
        self.failing.lock().unwrap().insert(step.to_string());
    }

    pub fn steps(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, target: &GuestTarget, step: &str) -> Result<()> {
        self.log.lock().unwrap().push(format!("{step}@{}", target.ip));
        if self.failing.lock().unwrap().contains(step) {
            return Err(QvmError::Remote {
                step: step.to_string(),
                detail: "exit status 1: simulated failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GuestShell for FakeShell {
    async fn run(&self, target: &GuestTarget, step: &str, _script: &str) -> Result<String> {
        self.record(target, step)?;
        Ok(match step {
            "cloud-init status" => "status: done\n".to_string(),
            _ => String::new(),
        })
    }

    async fn run_to_file(
        &self,
        target: &GuestTarget,
        step: &str,
        _script: &str,
        dest: &Path,
    ) -> Result<()> {
        self.record(target, step)?;
        std::fs::write(dest, &self.archive)?;
        Ok(())
    }

    async fn upload(&self, target: &GuestTarget, local: &Path, remote_path: &str) -> Result<()> {
        self.record(target, "upload")?;
        let bytes = std::fs::read(local)?;
        self.uploads
            .lock()
            .unwrap()
            .push((target.clone(), bytes, remote_path.to_string()));
        Ok(())
    }

    async fn probe(&self, _target: &GuestTarget) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub struct Host {
    pub processes: Arc<FakeProcesses>,
    pub network: Arc<FakeNetwork>,
    pub qmp: Arc<FakeQmp>,
}

impl Host {
    pub fn new() -> Self {
        Self {
            processes: FakeProcesses::new(),
            network: FakeNetwork::new(),
            qmp: FakeQmp::new(),
        }
    }

    pub fn probes(&self) -> Probes {
        Probes {
            processes: self.processes.clone(),
            network: self.network.clone(),
            control: self.qmp.clone(),
        }
    }
}

pub const ALPHA_MAC: &str = "52:54:00:11:22:33";

/// A VM record whose directory (under `vms_dir`) exists.
pub fn vm(vms_dir: &Path, name: &str, mac: &str) -> VmRecord {
    let directory = vms_dir.join(name);
    std::fs::create_dir_all(&directory).unwrap();
    VmRecord {
        name: name.to_string(),
        directory,
        hostname: name.to_string(),
        username: "ubuntu".to_string(),
        architecture: Architecture::X86_64,
        mac_address: mac.to_string(),
        memory_mb: 2048,
        vcpus: 2,
        disk_size: "20G".to_string(),
        instance_id: format!("iid-{name}-1"),
        os: "ubuntu-24.04".to_string(),
        base_image: PathBuf::from("/images/noble.img"),
        created: Utc::now(),
        updated: Utc::now(),
    }
}

pub fn alpha(vms_dir: &Path) -> VmRecord {
    vm(vms_dir, "alpha", ALPHA_MAC)
}

pub fn derived(vms_dir: &Path, name: &str) -> VmRecord {
    vm(vms_dir, name, &derive_mac(name))
}

/// Settings rooted in `root`, with an operator key pair present and
/// zero-interval waits.
pub fn settings(root: &Path) -> Settings {
    let home = root.join("home");
    let key = home.join(".ssh").join("id_test");
    std::fs::create_dir_all(key.parent().unwrap()).unwrap();
    std::fs::write(&key, "PRIVATE").unwrap();
    let public = home.join(".ssh").join("id_test.pub");
    std::fs::write(public, "ssh-ed25519 AAAATEST op@host\n").unwrap();

    let mut explicit = ExplicitSource::default();
    explicit
        .set(Key::VmsDir, root.join("vms").display().to_string())
        .set(Key::RegistryPath, root.join("registry.json").display().to_string())
        .set(Key::HostsFile, root.join("hosts").display().to_string())
        .set(Key::SshKey, key.display().to_string())
        .set(Key::RunningWaitAttempts, "3")
        .set(Key::RunningWaitIntervalSecs, "0")
        .set(Key::Network, "user");

    let paths = QvmPaths::under_home(&home);
    let layers = Layered::new(vec![
        Box::new(explicit),
        Box::new(DefaultSource::new(paths, home)),
    ]);
    let settings = Settings::from_layers(&layers).unwrap();
    std::fs::create_dir_all(&settings.vms_dir).unwrap();
    settings
}
