//! ProcessProbe: is the emulator for a VM alive, and what is its pid?
//!
//! Resolution order:
//!
//! 1. `qemu.pid` in the VM directory, if the referenced process exists.
//! 2. Otherwise delete the stale file and scan the process table for a
//!    `qemu-system-*` command line carrying the VM's MAC (primary) or its
//!    overlay disk path (fallback).
//! 3. A scan hit is written back to `qemu.pid`.
//!
//! The process-table scan scrapes `ps` output. There is no structured way to
//! discover emulators started outside qvm, so the string matching is kept in
//! this file and nowhere else.
//!
//! "Not found" is the normal stopped signal, not an error. It is only valid
//! at the instant of the call; a VM may be starting concurrently.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::vm::VmRecord;

const EMULATOR_MARKER: &str = "qemu-system";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub command: String,
}

/// How a live process was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    PidFile,
    Scan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveProcess {
    pub pid: u32,
    pub discovered: Discovery,
}

/// Host process table. Implemented by [`SystemProcessTable`]; tests
/// substitute a fixed table.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
    async fn list(&self) -> Vec<ProcessEntry>;
    async fn elapsed(&self, pid: u32) -> Option<Duration>;

    /// Send SIGTERM, or SIGKILL when `kill` is set. Returns whether the
    /// signal was delivered.
    fn terminate(&self, pid: u32, kill: bool) -> bool;
}

pub struct SystemProcessTable;

#[async_trait]
impl ProcessTable for SystemProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        // EPERM still means the process exists (owned by another user).
        matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
    }

    async fn list(&self) -> Vec<ProcessEntry> {
        match Command::new("ps")
            .args(["axww", "-o", "pid=,command="])
            .output()
            .await
        {
            Ok(out) if out.status.success() => {
                parse_ps_output(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                debug!(status = ?out.status, "ps exited unsuccessfully");
                Vec::new()
            }
            Err(e) => {
                debug!(error = %e, "failed to run ps");
                Vec::new()
            }
        }
    }

    async fn elapsed(&self, pid: u32) -> Option<Duration> {
        let out = Command::new("ps")
            .args(["-o", "etime=", "-p", &pid.to_string()])
            .output()
            .await
            .ok()?;
        if !out.status.success() {
            return None;
        }
        parse_etime(&String::from_utf8_lossy(&out.stdout))
    }

    fn terminate(&self, pid: u32, kill: bool) -> bool {
        use nix::sys::signal::{Signal, kill as send};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        let signal = if kill { Signal::SIGKILL } else { Signal::SIGTERM };
        send(Pid::from_raw(raw), signal).is_ok()
    }
}

/// Parse `ps -o pid=,command=` output.
pub fn parse_ps_output(text: &str) -> Vec<ProcessEntry> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            Some(ProcessEntry {
                pid: pid.parse().ok()?,
                command: command.trim().to_string(),
            })
        })
        .collect()
}

/// Parse a `ps` elapsed time: `[[dd-]hh:]mm:ss`.
pub fn parse_etime(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (days, clock) = match raw.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, raw),
    };
    let parts = clock
        .split(':')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    let (h, m, s) = match parts.as_slice() {
        [m, s] => (0, *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return None,
    };
    Some(Duration::from_secs(((days * 24 + h) * 60 + m) * 60 + s))
}

/// One process-table capture shared by every VM in a batch query.
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    pub entries: Vec<ProcessEntry>,
}

impl ProcessSnapshot {
    pub async fn capture(table: &dyn ProcessTable) -> Self {
        Self {
            entries: table.list().await,
        }
    }
}

/// Find the emulator in `entries` whose command line names `vm`.
pub fn match_emulator<'e>(entries: &'e [ProcessEntry], vm: &VmRecord) -> Option<&'e ProcessEntry> {
    let emulators = || {
        entries
            .iter()
            .filter(|e| e.command.contains(EMULATOR_MARKER))
    };
    let mac = vm.mac_address.to_ascii_lowercase();
    if !mac.is_empty() {
        if let Some(hit) = emulators().find(|e| e.command.to_ascii_lowercase().contains(&mac)) {
            return Some(hit);
        }
    }
    let disk = vm.layout().disk();
    let disk = disk.to_string_lossy();
    emulators().find(|e| e.command.contains(disk.as_ref()))
}

pub struct ProcessProbe<'a> {
    table: &'a dyn ProcessTable,
}

impl<'a> ProcessProbe<'a> {
    pub fn new(table: &'a dyn ProcessTable) -> Self {
        Self { table }
    }

    pub async fn find(
        &self,
        vm: &VmRecord,
        snapshot: Option<&ProcessSnapshot>,
    ) -> Option<LiveProcess> {
        let layout = vm.layout();
        let pid_file = layout.pid_file();

        if let Ok(text) = std::fs::read_to_string(&pid_file) {
            match text.trim().parse::<u32>() {
                Ok(pid) if self.table.is_alive(pid) => {
                    return Some(LiveProcess {
                        pid,
                        discovered: Discovery::PidFile,
                    });
                }
                _ => {
                    debug!(vm = %vm.name, "removing stale pid file");
                    let _ = std::fs::remove_file(&pid_file);
                }
            }
        }

        let owned;
        let entries = match snapshot {
            Some(s) => &s.entries,
            None => {
                owned = self.table.list().await;
                &owned
            }
        };

        let hit = match_emulator(entries, vm)?;
        let pid = hit.pid;
        if layout.exists() {
            if let Err(e) = std::fs::write(&pid_file, format!("{pid}\n")) {
                debug!(vm = %vm.name, error = %e, "could not rewrite pid file");
            }
        }
        debug!(vm = %vm.name, pid, "emulator rediscovered by process scan");
        Some(LiveProcess {
            pid,
            discovered: Discovery::Scan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_output_parses_pid_and_command() {
        let text = "    1 /sbin/init\n 4242 qemu-system-x86_64 -name alpha -device virtio-net-pci,netdev=net0,mac=52:54:00:11:22:33\nbogus\n";
        let entries = parse_ps_output(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].pid, 4242);
        assert!(entries[1].command.starts_with("qemu-system-x86_64"));
    }

    fn record(mac: &str) -> VmRecord {
        VmRecord {
            name: "alpha".to_string(),
            directory: std::path::PathBuf::from("/vms/alpha"),
            hostname: "alpha".to_string(),
            username: "ubuntu".to_string(),
            architecture: crate::arch::Architecture::X86_64,
            mac_address: mac.to_string(),
            memory_mb: 2048,
            vcpus: 2,
            disk_size: "20G".to_string(),
            instance_id: "iid-alpha-1".to_string(),
            os: "ubuntu-24.04".to_string(),
            base_image: std::path::PathBuf::from("/images/noble.img"),
            created: chrono::Utc::now(),
            updated: chrono::Utc::now(),
        }
    }

    fn entry(pid: u32, command: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            command: command.to_string(),
        }
    }

    #[test]
    fn scan_matches_mac_before_disk() {
        let entries = [
            entry(10, "qemu-system-x86_64 -drive file=/vms/alpha/disk.qcow2,if=virtio"),
            entry(11, "qemu-system-x86_64 -device virtio-net-pci,mac=52:54:00:AA:BB:CC"),
        ];
        let hit = match_emulator(&entries, &record("52:54:00:aa:bb:cc")).unwrap();
        assert_eq!(hit.pid, 11);
    }

    #[test]
    fn scan_falls_back_to_disk_filename() {
        let entries = [
            entry(10, "qemu-system-x86_64 -name beta -drive file=/vms/beta/disk.qcow2"),
            entry(11, "qemu-system-x86_64 -name alpha -drive file=/vms/alpha/disk.qcow2,if=virtio"),
        ];
        assert_eq!(match_emulator(&entries, &record("52:54:00:11:22:33")).unwrap().pid, 11);
        assert_eq!(match_emulator(&entries, &record("")).unwrap().pid, 11);
    }

    #[test]
    fn scan_ignores_non_emulator_processes() {
        let entries = [
            entry(20, "ssh -o ProxyCommand=none ubuntu@host # 52:54:00:11:22:33"),
            entry(21, "tail -f /vms/alpha/disk.qcow2"),
        ];
        assert!(match_emulator(&entries, &record("52:54:00:11:22:33")).is_none());
    }

    #[test]
    fn etime_formats() {
        assert_eq!(parse_etime("05:07"), Some(Duration::from_secs(307)));
        assert_eq!(parse_etime(" 01:00:00\n"), Some(Duration::from_secs(3600)));
        assert_eq!(
            parse_etime("2-00:00:01"),
            Some(Duration::from_secs(2 * 86400 + 1))
        );
        assert_eq!(parse_etime("garbage"), None);
    }
}
