//! Status ladder and address resolution against a fake host.
//!
//! Tested in this file:
//! - a VM with no emulator process never reports an address, whatever the
//!   neighbor table, DNS or console transcript say
//! - booting vs running, decided by port 22 on the resolved address
//! - SSH reachability outranks source priority
//! - ARP > DNS (ARP-confirmed) > console when nothing answers
//! - paused VMs report no address
//! - fast and basic batch queries share one snapshot
//! - pid file self-healing

mod common;

use std::net::Ipv4Addr;

use qvm::net::resolver::ResolverSettings;
use qvm::net::{BestIpResolver, IpSource, QueryMode};
use qvm::status::{SshStatus, StatusMachine, VmStatus};
use qvm::vm::process::{Discovery, LiveProcess};
use qvm::vm::qmp::RunState;

use common::{ALPHA_MAC, Host};

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn write_console(vm: &qvm::vm::VmRecord, text: &str) {
    std::fs::write(vm.layout().console_log(), text).unwrap();
}

// ---------------------------------------------------------------------------
// No process, no address
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stopped_vm_has_no_address_despite_stale_signals() {
    let tmp = tempfile::tempdir().unwrap();
    let vm = common::alpha(tmp.path());
    let host = Host::new();
    host.network.neighbor("192.168.1.50", ALPHA_MAC);
    host.network.dns("alpha", &["192.168.1.50"]);
    host.network.open_ssh("192.168.1.50");
    write_console(&vm, "ci-info: eth0 192.168.1.50\n");

    let probes = host.probes();
    let machine = StatusMachine::new(&probes, ResolverSettings::default());
    let s = machine.query(&vm, QueryMode::Full, None).await;

    assert_eq!(s.status, VmStatus::Stopped);
    assert_eq!(s.ip_address, None);
    assert_eq!(s.pid, None);
    assert_eq!(s.ssh_status, SshStatus::Unknown);
    assert_eq!(host.network.neighbor_count(), 0);
    assert_eq!(host.network.lookup_count(), 0);
}

#[tokio::test]
async fn resolver_returns_none_without_a_process() {
    let tmp = tempfile::tempdir().unwrap();
    let vm = common::alpha(tmp.path());
    let host = Host::new();
    host.network.neighbor("192.168.1.50", ALPHA_MAC);

    let resolver = BestIpResolver::new(host.network.as_ref(), ResolverSettings::default());
    for mode in [QueryMode::Full, QueryMode::Fast, QueryMode::Basic] {
        assert_eq!(resolver.resolve(&vm, None, mode, None).await, None);
    }
}

#[tokio::test]
async fn missing_directory_is_missing() {
    let tmp = tempfile::tempdir().unwrap();
    let vm = common::alpha(tmp.path());
    std::fs::remove_dir_all(&vm.directory).unwrap();

    let host = Host::new();
    let probes = host.probes();
    let s = StatusMachine::new(&probes, ResolverSettings::default())
        .query(&vm, QueryMode::Full, None)
        .await;
    assert_eq!(s.status, VmStatus::Missing);
    assert_eq!(s.ip_address, None);
}

// ---------------------------------------------------------------------------
// Booting and running
// ---------------------------------------------------------------------------

#[tokio::test]
async fn arp_address_with_closed_port_is_booting_then_running() {
    let tmp = tempfile::tempdir().unwrap();
    let vm = common::alpha(tmp.path());
    let host = Host::new();
    host.processes.spawn_emulator(4242, &vm);
    // some arp builds drop leading zeros
    host.network.neighbor("192.168.1.50", "52:54:0:11:22:33");
    host.qmp.set(Some(RunState::Running));

    let probes = host.probes();
    let machine = StatusMachine::new(&probes, ResolverSettings::default());

    let s = machine.query(&vm, QueryMode::Full, None).await;
    assert_eq!(s.status, VmStatus::Booting);
    assert_eq!(s.ip_address, Some(ip("192.168.1.50")));
    assert_eq!(s.ip_source, Some(IpSource::Arp));
    assert_eq!(s.ssh_status, SshStatus::Unreachable);
    assert_eq!(s.pid, Some(4242));
    assert_eq!(s.uptime.as_deref(), Some("5m 7s"));

    host.network.open_ssh("192.168.1.50");
    let s = machine.query(&vm, QueryMode::Full, None).await;
    assert_eq!(s.status, VmStatus::Running);
    assert_eq!(s.ip_address, Some(ip("192.168.1.50")));
    assert_eq!(s.ssh_status, SshStatus::Reachable);
}

#[tokio::test]
async fn process_without_any_address_is_initializing() {
    let tmp = tempfile::tempdir().unwrap();
    let vm = common::alpha(tmp.path());
    let host = Host::new();
    host.processes.spawn_emulator(4242, &vm);

    let probes = host.probes();
    let s = StatusMachine::new(&probes, ResolverSettings::default())
        .query(&vm, QueryMode::Full, None)
        .await;
    assert_eq!(s.status, VmStatus::Initializing);
    assert_eq!(s.ip_address, None);
    assert_eq!(s.ssh_status, SshStatus::Unreachable);
}

#[tokio::test]
async fn paused_vm_reports_no_address() {
    let tmp = tempfile::tempdir().unwrap();
    let vm = common::alpha(tmp.path());
    let host = Host::new();
    host.processes.spawn_emulator(4242, &vm);
    host.network.neighbor("192.168.1.50", ALPHA_MAC);
    host.network.open_ssh("192.168.1.50");
    host.qmp.set(Some(RunState::Paused));

    let probes = host.probes();
    let s = StatusMachine::new(&probes, ResolverSettings::default())
        .query(&vm, QueryMode::Full, None)
        .await;
    assert_eq!(s.status, VmStatus::Paused);
    assert_eq!(s.ip_address, None);
    assert_eq!(s.pid, Some(4242));
}

#[tokio::test]
async fn unanswered_control_channel_is_not_paused() {
    let tmp = tempfile::tempdir().unwrap();
    let vm = common::alpha(tmp.path());
    let host = Host::new();
    host.processes.spawn_emulator(4242, &vm);
    host.network.neighbor("192.168.1.50", ALPHA_MAC);
    host.network.open_ssh("192.168.1.50");
    host.qmp.set(None);

    let probes = host.probes();
    let s = StatusMachine::new(&probes, ResolverSettings::default())
        .query(&vm, QueryMode::Full, None)
        .await;
    assert_eq!(s.status, VmStatus::Running);
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reachable_console_address_beats_unreachable_arp_address() {
    let tmp = tempfile::tempdir().unwrap();
    let vm = common::alpha(tmp.path());
    let host = Host::new();
    host.network.neighbor("192.168.1.50", ALPHA_MAC);
    host.network.open_ssh("192.168.1.77");
    write_console(&vm, "[   12.3] cloud-init: ip 192.168.1.77\n");

    let process = LiveProcess { pid: 1, discovered: Discovery::PidFile };
    let resolved = BestIpResolver::new(host.network.as_ref(), ResolverSettings::default())
        .resolve(&vm, Some(&process), QueryMode::Full, None)
        .await
        .unwrap();

    assert_eq!(resolved.ip, ip("192.168.1.77"));
    assert_eq!(resolved.source, IpSource::Console);
    assert!(resolved.ssh_reachable);
}

#[tokio::test]
async fn source_priority_applies_when_nothing_answers() {
    let process = LiveProcess { pid: 1, discovered: Discovery::PidFile };

    // All three sources present: ARP wins.
    let tmp = tempfile::tempdir().unwrap();
    let vm = common::alpha(tmp.path());
    write_console(&vm, "lease 192.168.1.70\n");
    let host = Host::new();
    host.network.neighbor("192.168.1.50", ALPHA_MAC);
    host.network.dns("alpha.local", &["192.168.1.60"]);
    host.network.learnable("192.168.1.60", ALPHA_MAC);
    let resolver = BestIpResolver::new(host.network.as_ref(), ResolverSettings::default());
    let candidates = resolver.candidates(&vm, QueryMode::Full, None).await;
    assert_eq!(
        candidates.iter().map(|c| (c.ip, c.source)).collect::<Vec<_>>(),
        vec![
            (ip("192.168.1.50"), IpSource::Arp),
            (ip("192.168.1.60"), IpSource::Dns),
            (ip("192.168.1.70"), IpSource::Console),
        ]
    );

    // No ARP entry yet: the confirmed DNS answer wins over the console.
    let host = Host::new();
    host.network.dns("alpha.local", &["192.168.1.60"]);
    host.network.learnable("192.168.1.60", ALPHA_MAC);
    let resolved = BestIpResolver::new(host.network.as_ref(), ResolverSettings::default())
        .resolve(&vm, Some(&process), QueryMode::Full, None)
        .await
        .unwrap();
    assert_eq!((resolved.ip, resolved.source), (ip("192.168.1.60"), IpSource::Dns));
    assert!(!resolved.ssh_reachable);

    // Only the console transcript.
    let host = Host::new();
    let resolved = BestIpResolver::new(host.network.as_ref(), ResolverSettings::default())
        .resolve(&vm, Some(&process), QueryMode::Full, None)
        .await
        .unwrap();
    assert_eq!((resolved.ip, resolved.source), (ip("192.168.1.70"), IpSource::Console));
}

#[tokio::test]
async fn dns_answer_for_another_mac_is_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let vm = common::alpha(tmp.path());
    let host = Host::new();
    host.network.dns("alpha", &["192.168.1.99"]);
    host.network.learnable("192.168.1.99", "52:54:00:aa:bb:cc");
    host.network.open_ssh("192.168.1.99");

    let candidates = BestIpResolver::new(host.network.as_ref(), ResolverSettings::default())
        .candidates(&vm, QueryMode::Full, None)
        .await;
    assert!(candidates.is_empty());
}

#[tokio::test]
async fn fast_mode_uses_only_arp() {
    let tmp = tempfile::tempdir().unwrap();
    let vm = common::alpha(tmp.path());
    write_console(&vm, "lease 192.168.1.70\n");
    let host = Host::new();
    host.network.dns("alpha", &["192.168.1.60"]);

    let candidates = BestIpResolver::new(host.network.as_ref(), ResolverSettings::default())
        .candidates(&vm, QueryMode::Fast, None)
        .await;
    assert!(candidates.is_empty());
    assert_eq!(host.network.lookup_count(), 0);
}

// ---------------------------------------------------------------------------
// Batch queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fast_list_shares_one_snapshot() {
    let tmp = tempfile::tempdir().unwrap();
    let host = Host::new();
    let vms: Vec<_> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|n| common::derived(tmp.path(), n))
        .collect();
    for (i, vm) in vms.iter().enumerate() {
        host.processes.spawn_emulator(100 + i as u32, vm);
        let addr = format!("10.0.2.{}", 10 + i);
        host.network.neighbor(&addr, &vm.mac_address);
        host.network.open_ssh(&addr);
    }

    let probes = host.probes();
    let rows = StatusMachine::new(&probes, ResolverSettings::default())
        .query_many(&vms, QueryMode::Fast)
        .await;

    assert_eq!(host.processes.list_count(), 1);
    assert_eq!(host.network.neighbor_count(), 1);
    assert_eq!(host.network.lookup_count(), 0);
    assert!(rows.iter().all(|r| r.status == VmStatus::Running));
    assert_eq!(rows[1].ip_address, Some(ip("10.0.2.11")));
}

#[tokio::test]
async fn basic_mode_reports_liveness_only() {
    let tmp = tempfile::tempdir().unwrap();
    let host = Host::new();
    let running = common::derived(tmp.path(), "alpha");
    let stopped = common::derived(tmp.path(), "beta");
    host.processes.spawn_emulator(100, &running);
    host.network.neighbor("10.0.2.10", &running.mac_address);

    let probes = host.probes();
    let rows = StatusMachine::new(&probes, ResolverSettings::default())
        .query_many(&[running, stopped], QueryMode::Basic)
        .await;

    assert_eq!(rows[0].status, VmStatus::Running);
    assert_eq!(rows[0].ip_address, None);
    assert_eq!(rows[0].ssh_status, SshStatus::Unknown);
    assert_eq!(rows[1].status, VmStatus::Stopped);
    assert_eq!(host.network.lookup_count(), 0);
}

// ---------------------------------------------------------------------------
// Pid file
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scan_rewrites_pid_file_and_stale_file_is_removed() {
    let tmp = tempfile::tempdir().unwrap();
    let vm = common::alpha(tmp.path());
    let pid_file = vm.layout().pid_file();
    std::fs::write(&pid_file, "999999\n").unwrap();

    let host = Host::new();
    host.processes.spawn_emulator(4242, &vm);
    let probes = host.probes();
    let machine = StatusMachine::new(&probes, ResolverSettings::default());

    let process = machine.process(&vm, None).await.unwrap();
    assert_eq!(process.discovered, Discovery::Scan);
    assert_eq!(std::fs::read_to_string(&pid_file).unwrap().trim(), "4242");

    let process = machine.process(&vm, None).await.unwrap();
    assert_eq!(process.discovered, Discovery::PidFile);

    host.processes.kill_all();
    assert_eq!(machine.process(&vm, None).await, None);
    assert!(!pid_file.exists());
}
