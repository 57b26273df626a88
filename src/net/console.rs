//! Console signal: IPv4 addresses mentioned in the serial transcript.
//!
//! Only the last `tail_lines` lines are considered. Addresses that can never
//! belong to the guest's bridge interface are rejected outright; RFC1918
//! addresses are ranked ahead of the rest. The ranking is a heuristic for
//! private bridges, not a filter.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Upper bound on bytes read from the end of the transcript.
const MAX_TAIL_BYTES: u64 = 1024 * 1024;

static DOTTED_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9][0-9.]*[0-9]").expect("static regex"));

/// Whether `ip` could plausibly be the guest's address.
pub fn is_plausible(ip: Ipv4Addr) -> bool {
    let first = ip.octets()[0];
    !(ip.is_unspecified()
        || first == 0
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || first >= 224)
}

/// The last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}

/// Extract, filter, deduplicate (first seen wins) and rank candidates.
pub fn extract_candidates(text: &str, tail: usize) -> Vec<Ipv4Addr> {
    let mut seen = Vec::new();
    for line in tail_lines(text, tail) {
        for run in DOTTED_RUN_RE.find_iter(line) {
            let Ok(ip) = run.as_str().parse::<Ipv4Addr>() else {
                continue;
            };
            if is_plausible(ip) && !seen.contains(&ip) {
                seen.push(ip);
            }
        }
    }
    let (mut private, public): (Vec<_>, Vec<_>) = seen.into_iter().partition(|ip| ip.is_private());
    private.extend(public);
    private
}

/// Read the transcript's tail from disk. A missing or unreadable file
/// yields no candidates.
pub async fn read_candidates(path: &Path, tail: usize) -> Vec<Ipv4Addr> {
    match read_tail(path).await {
        Ok(text) => extract_candidates(&text, tail),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "console transcript unavailable");
            Vec::new()
        }
    }
}

async fn read_tail(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len > MAX_TAIL_BYTES {
        file.seek(std::io::SeekFrom::Start(len - MAX_TAIL_BYTES)).await?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips(v: &[Ipv4Addr]) -> Vec<String> {
        v.iter().map(|i| i.to_string()).collect()
    }

    #[test]
    fn rejects_unusable_addresses() {
        let text = "lo: 127.0.0.1\nll 169.254.3.4\nbcast 255.255.255.255\nmcast 224.0.0.251\n\
                    mask 255.255.255.0\nany 0.0.0.0\nreal 192.168.1.50\n";
        assert_eq!(ips(&extract_candidates(text, 400)), vec!["192.168.1.50"]);
    }

    #[test]
    fn private_ranked_before_public_preserving_order() {
        let text = "ci-info: | eth0 | True | 8.8.4.4 |\n\
                    ci-info: | eth0 | True | 10.0.0.7 | 255.0.0.0 |\n\
                    dhcp 203.0.113.9\n\
                    again 10.0.0.7 and 172.16.5.5\n";
        assert_eq!(
            ips(&extract_candidates(text, 400)),
            vec!["10.0.0.7", "172.16.5.5", "8.8.4.4", "203.0.113.9"]
        );
    }

    #[test]
    fn only_tail_window_is_read() {
        let mut text = String::from("old lease 192.168.1.10\n");
        for _ in 0..5 {
            text.push_str("noise\n");
        }
        text.push_str("new lease 192.168.1.20\n");
        assert_eq!(ips(&extract_candidates(&text, 3)), vec!["192.168.1.20"]);
    }

    #[test]
    fn ignores_non_addresses() {
        let text = "version 6.8.0.45.1 build 1.2.3 at 300.1.1.1, addr 192.168.1.50.\n";
        assert_eq!(ips(&extract_candidates(text, 400)), vec!["192.168.1.50"]);
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_candidates(&tmp.path().join("console.log"), 400).await.is_empty());
    }

    #[tokio::test]
    async fn reads_file_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("console.log");
        std::fs::write(&path, "Cloud-init: eth0 192.168.122.77/24\n").unwrap();
        assert_eq!(ips(&read_candidates(&path, 400).await), vec!["192.168.122.77"]);
    }
}
