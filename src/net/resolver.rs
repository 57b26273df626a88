//! BestIPResolver: merge the network signals into one address.
//!
//! ```text
//! live process? ──no──► None
//!      │yes
//!      ▼
//! ARP(mac)  ─┐
//! DNS(host) ─┼─ ARP-verified ──► ordered, deduplicated candidates
//! console   ─┘                      │ drop loopback / link-local
//!                                   ▼
//!                first candidate answering :22 ──► ResolvedHost { ssh_reachable: true }
//!                otherwise first candidate     ──► ResolvedHost { ssh_reachable: false }
//! ```
//!
//! Candidate priority is ARP, then DNS, then console. A stopped VM never gets
//! an address, whatever the tables still say about it.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::arp::ArpSnapshot;
use super::{NetworkSignals, SSH_PORT, console, dns};
use crate::config::Settings;
use crate::vm::VmRecord;
use crate::vm::process::LiveProcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IpSource {
    Arp,
    Dns,
    Console,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub ip: Ipv4Addr,
    pub source: IpSource,
}

/// Outcome of a resolution: the chosen address and whether it accepted a
/// TCP connection on port 22 while being ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedHost {
    pub ip: Ipv4Addr,
    pub source: IpSource,
    pub ssh_reachable: bool,
}

/// How much work a status query may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// ARP, DNS (ARP-verified) and console signals, then SSH ranking.
    #[default]
    Full,
    /// Batch mode: shared ARP snapshot only, then SSH ranking.
    Fast,
    /// Process liveness only; no address work at all.
    Basic,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverSettings {
    pub ssh_timeout: Duration,
    pub probe_timeout: Duration,
    pub console_tail_lines: usize,
}

impl From<&Settings> for ResolverSettings {
    fn from(s: &Settings) -> Self {
        Self {
            ssh_timeout: s.ssh_timeout,
            probe_timeout: s.probe_timeout,
            console_tail_lines: s.console_tail_lines,
        }
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            ssh_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
            console_tail_lines: 400,
        }
    }
}

/// Ordered candidate list; the first source to offer an address keeps it.
#[derive(Debug, Default)]
struct CandidateList {
    items: Vec<Candidate>,
}

impl CandidateList {
    fn push(&mut self, ip: Ipv4Addr, source: IpSource) {
        if !self.contains(ip) {
            self.items.push(Candidate { ip, source });
        }
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        self.items.iter().any(|c| c.ip == ip)
    }

    fn into_filtered(self) -> Vec<Candidate> {
        self.items
            .into_iter()
            .filter(|c| !c.ip.is_loopback() && !c.ip.is_link_local())
            .collect()
    }
}

pub struct BestIpResolver<'a> {
    net: &'a dyn NetworkSignals,
    settings: ResolverSettings,
}

impl<'a> BestIpResolver<'a> {
    pub fn new(net: &'a dyn NetworkSignals, settings: ResolverSettings) -> Self {
        Self { net, settings }
    }

    /// Best address for `vm`, or `None`.
    ///
    /// `process` is the ProcessProbe result; without a live process this
    /// returns `None` before consulting any signal. `arp` is a batch snapshot;
    /// when absent the neighbor table is read fresh.
    pub async fn resolve(
        &self,
        vm: &VmRecord,
        process: Option<&LiveProcess>,
        mode: QueryMode,
        arp: Option<&ArpSnapshot>,
    ) -> Option<ResolvedHost> {
        if process.is_none() || mode == QueryMode::Basic {
            return None;
        }
        let candidates = self.candidates(vm, mode, arp).await;
        self.rank(&candidates).await
    }

    /// Gather candidates in priority order. Does not check liveness; callers
    /// go through [`resolve`](Self::resolve).
    pub async fn candidates(
        &self,
        vm: &VmRecord,
        mode: QueryMode,
        arp: Option<&ArpSnapshot>,
    ) -> Vec<Candidate> {
        let mut list = CandidateList::default();

        let fresh;
        let snapshot = match arp {
            Some(s) => s,
            None => {
                fresh = ArpSnapshot::capture(self.net).await;
                &fresh
            }
        };
        for ip in snapshot.ips_for(&vm.mac_address) {
            list.push(ip, IpSource::Arp);
        }

        if mode == QueryMode::Full {
            for ip in self.verified_dns(vm, &list).await {
                list.push(ip, IpSource::Dns);
            }
            let console_path = vm.layout().console_log();
            let tail = self.settings.console_tail_lines;
            for ip in console::read_candidates(&console_path, tail).await {
                list.push(ip, IpSource::Console);
            }
        }

        let candidates = list.into_filtered();
        debug!(vm = %vm.name, ?candidates, "ip candidates");
        candidates
    }

    /// DNS answers whose MAC, after nudging the neighbor table, matches.
    async fn verified_dns(&self, vm: &VmRecord, known: &CandidateList) -> Vec<Ipv4Addr> {
        let mut unverified = Vec::new();
        for name in dns::candidate_names(&vm.hostname) {
            for ip in self.net.lookup_host(&name).await {
                if !known.contains(ip) && !unverified.contains(&ip) {
                    unverified.push(ip);
                }
            }
        }
        if unverified.is_empty() {
            return Vec::new();
        }

        for ip in &unverified {
            self.net.nudge(*ip, self.settings.probe_timeout).await;
        }
        let confirm = ArpSnapshot::capture(self.net).await;
        let mac = super::normalize_mac(&vm.mac_address);

        unverified
            .into_iter()
            .filter(|ip| {
                let ok = mac.is_some() && confirm.mac_for(*ip) == mac.as_deref();
                if !ok {
                    debug!(vm = %vm.name, %ip, "dns answer not confirmed by arp; ignoring");
                }
                ok
            })
            .collect()
    }

    /// First candidate answering on port 22, else the first candidate.
    pub async fn rank(&self, candidates: &[Candidate]) -> Option<ResolvedHost> {
        for c in candidates {
            if self
                .net
                .port_open(c.ip, SSH_PORT, self.settings.ssh_timeout)
                .await
            {
                return Some(ResolvedHost {
                    ip: c.ip,
                    source: c.source,
                    ssh_reachable: true,
                });
            }
        }
        candidates.first().map(|c| ResolvedHost {
            ip: c.ip,
            source: c.source,
            ssh_reachable: false,
        })
    }
}
