//! DNS signal.
//!
//! Two strategies, tried in the configured order until one yields an
//! address:
//!
//! - `fast`: a resolver built from the system `resolv.conf` with its cache
//!   disabled, the hosts file ignored and a single short attempt. This
//!   bypasses OS-level caching.
//! - `system`: the platform resolver (`getaddrinfo`), which may answer from
//!   a cache or from `/etc/hosts`, and handles `.local` via mDNS where the
//!   host is configured for it.
//!
//! Unqualified hostnames are also tried with a `.local` suffix. Results are
//! only candidates; the resolver re-verifies each one against the ARP table.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::system_conf::read_system_conf;

use crate::error::QvmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsStrategy {
    Fast,
    System,
}

impl FromStr for DnsStrategy {
    type Err = QvmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fast" => Ok(DnsStrategy::Fast),
            "system" => Ok(DnsStrategy::System),
            other => Err(QvmError::InvalidConfig {
                key: "dns_order".to_string(),
                reason: format!("unknown strategy {other:?} (expected fast or system)"),
            }),
        }
    }
}

/// Names to look up for `hostname`, most specific first.
pub fn candidate_names(hostname: &str) -> Vec<String> {
    let hostname = hostname.trim().trim_end_matches('.');
    if hostname.is_empty() {
        return Vec::new();
    }
    let mut names = vec![hostname.to_string()];
    if !hostname.contains('.') {
        names.push(format!("{hostname}.local"));
    }
    names
}

pub struct DnsSignal {
    order: Vec<DnsStrategy>,
    timeout: Duration,
    fast: Option<TokioAsyncResolver>,
}

impl DnsSignal {
    pub fn new(order: Vec<DnsStrategy>, timeout: Duration) -> Self {
        let fast = if order.contains(&DnsStrategy::Fast) {
            build_uncached_resolver(timeout)
        } else {
            None
        };
        Self { order, timeout, fast }
    }

    pub async fn resolve(&self, hostname: &str) -> Vec<Ipv4Addr> {
        let names = candidate_names(hostname);
        for strategy in &self.order {
            let mut found = Vec::new();
            for name in &names {
                let ips = match strategy {
                    DnsStrategy::Fast => self.lookup_fast(name).await,
                    DnsStrategy::System => self.lookup_system(name).await,
                };
                for ip in ips {
                    if !found.contains(&ip) {
                        found.push(ip);
                    }
                }
            }
            if !found.is_empty() {
                debug!(hostname, ?strategy, ips = ?found, "dns answered");
                return found;
            }
        }
        Vec::new()
    }

    async fn lookup_fast(&self, name: &str) -> Vec<Ipv4Addr> {
        let Some(resolver) = &self.fast else {
            return Vec::new();
        };
        match tokio::time::timeout(self.timeout, resolver.lookup_ip(name)).await {
            Ok(Ok(lookup)) => lookup.iter().filter_map(v4).collect(),
            Ok(Err(e)) => {
                debug!(name, error = %e, "fast lookup failed");
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }

    async fn lookup_system(&self, name: &str) -> Vec<Ipv4Addr> {
        match tokio::time::timeout(self.timeout, tokio::net::lookup_host((name, 0))).await {
            Ok(Ok(addrs)) => addrs.map(|a| a.ip()).filter_map(v4).collect(),
            Ok(Err(e)) => {
                debug!(name, error = %e, "system lookup failed");
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }
}

fn v4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }
}

fn build_uncached_resolver(timeout: Duration) -> Option<TokioAsyncResolver> {
    match read_system_conf() {
        Ok((config, mut opts)) => {
            opts.cache_size = 0;
            opts.use_hosts_file = false;
            opts.attempts = 1;
            opts.timeout = timeout;
            Some(TokioAsyncResolver::tokio(config, opts))
        }
        Err(e) => {
            debug!(error = %e, "no system resolver configuration; fast dns disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unqualified_names_get_local_variant() {
        assert_eq!(candidate_names("alpha"), vec!["alpha", "alpha.local"]);
        assert_eq!(candidate_names("alpha.lan"), vec!["alpha.lan"]);
        assert_eq!(candidate_names("alpha.lan."), vec!["alpha.lan"]);
        assert!(candidate_names("  ").is_empty());
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!("fast".parse::<DnsStrategy>().unwrap(), DnsStrategy::Fast);
        assert_eq!(" system".parse::<DnsStrategy>().unwrap(), DnsStrategy::System);
        assert!("mdns".parse::<DnsStrategy>().is_err());
    }

    #[tokio::test]
    async fn system_strategy_resolves_localhost() {
        let dns = DnsSignal::new(vec![DnsStrategy::System], Duration::from_secs(2));
        let ips = dns.resolve("localhost").await;
        assert!(ips.contains(&Ipv4Addr::LOCALHOST), "{ips:?}");
    }

    #[tokio::test]
    async fn empty_order_resolves_nothing() {
        let dns = DnsSignal::new(Vec::new(), Duration::from_millis(100));
        assert!(dns.resolve("localhost").await.is_empty());
    }
}
