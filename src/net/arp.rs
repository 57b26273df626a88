//! ARP signal: the host neighbor table, keyed by normalized MAC.
//!
//! Neighbor tables are read from `/proc/net/arp` where available, then
//! `ip neigh show`, then `arp -an`. All three formats go through the same
//! line parser: each line contributes one IPv4 address and one MAC.
//!
//! Some `arp` implementations strip leading zeros from MAC octets
//! (`52:54:0:8e:d3:f6`), so every MAC is normalized to zero-padded
//! lowercase colon-hex before comparison.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use super::NetworkSignals;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub ip: Ipv4Addr,
    /// Always in canonical form, see [`normalize_mac`].
    pub mac: String,
}

/// Canonical `aa:bb:cc:dd:ee:ff` form, or `None` if `raw` is not a MAC.
///
/// Accepts `:` or `-` separators and one- or two-digit octets.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.trim().split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }
    let mut octets = Vec::with_capacity(6);
    for part in parts {
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        octets.push(u8::from_str_radix(part, 16).ok()?);
    }
    Some(
        octets
            .iter()
            .map(|o| format!("{o:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

static IPV4_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").expect("static regex"));
static MAC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9A-Fa-f]{1,2}(?:[:-][0-9A-Fa-f]{1,2}){5}\b").expect("static regex")
});

/// Parse any of the supported neighbor-table formats.
///
/// Lines without both an IPv4 address and a usable MAC (incomplete or
/// failed entries, IPv6 neighbors, headers) are skipped.
pub fn parse_neighbor_table(text: &str) -> Vec<Neighbor> {
    text.lines()
        .filter_map(|line| {
            let ip = IPV4_RE
                .find(line)
                .and_then(|m| m.as_str().parse::<Ipv4Addr>().ok())?;
            let mac = MAC_RE.find(line).and_then(|m| normalize_mac(m.as_str()))?;
            if mac == "00:00:00:00:00:00" {
                return None;
            }
            Some(Neighbor { ip, mac })
        })
        .collect()
}

/// Read the host neighbor table. Never fails; an unreadable table is empty.
pub async fn read_system_table() -> Vec<Neighbor> {
    if let Ok(text) = tokio::fs::read_to_string("/proc/net/arp").await {
        let table = parse_neighbor_table(&text);
        if !table.is_empty() {
            return table;
        }
    }
    for (program, args) in [("ip", &["neigh", "show"][..]), ("arp", &["-an"][..])] {
        match Command::new(program).args(args).output().await {
            Ok(out) if out.status.success() => {
                return parse_neighbor_table(&String::from_utf8_lossy(&out.stdout));
            }
            Ok(out) => debug!(program, status = ?out.status, "neighbor listing failed"),
            Err(e) => debug!(program, error = %e, "neighbor listing unavailable"),
        }
    }
    Vec::new()
}

/// One neighbor-table capture. Batch queries share a single snapshot.
#[derive(Debug, Clone, Default)]
pub struct ArpSnapshot {
    pub neighbors: Vec<Neighbor>,
}

impl ArpSnapshot {
    pub fn new(neighbors: Vec<Neighbor>) -> Self {
        Self { neighbors }
    }

    pub async fn capture(net: &dyn NetworkSignals) -> Self {
        Self::new(net.neighbors().await)
    }

    /// All IPs bound to `mac`, in table order, without duplicates.
    pub fn ips_for(&self, mac: &str) -> Vec<Ipv4Addr> {
        let Some(mac) = normalize_mac(mac) else {
            return Vec::new();
        };
        let mut ips = Vec::new();
        for n in self.neighbors.iter().filter(|n| n.mac == mac) {
            if !ips.contains(&n.ip) {
                ips.push(n.ip);
            }
        }
        ips
    }

    pub fn mac_for(&self, ip: Ipv4Addr) -> Option<&str> {
        self.neighbors
            .iter()
            .find(|n| n.ip == ip)
            .map(|n| n.mac.as_str())
    }
}
