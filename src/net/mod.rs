//! Network signals used to locate a VM.
//!
//! [`NetworkSignals`] is the seam between the resolver and the host: the
//! neighbor table, name resolution and TCP reachability. Every method is
//! infallible; a failed probe is simply an absent signal.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::config::Settings;

pub mod arp;
pub mod console;
pub mod dns;
pub mod resolver;

pub use arp::{ArpSnapshot, Neighbor, normalize_mac};
pub use resolver::{BestIpResolver, Candidate, IpSource, QueryMode, ResolvedHost};

pub const SSH_PORT: u16 = 22;

#[async_trait]
pub trait NetworkSignals: Send + Sync {
    async fn neighbors(&self) -> Vec<Neighbor>;

    async fn lookup_host(&self, hostname: &str) -> Vec<Ipv4Addr>;

    async fn port_open(&self, ip: Ipv4Addr, port: u16, timeout: Duration) -> bool;

    /// Provoke link-layer traffic to `ip` so the neighbor table learns it.
    async fn nudge(&self, ip: Ipv4Addr, timeout: Duration) {
        let _ = self.port_open(ip, SSH_PORT, timeout).await;
    }
}

/// The real host: `/proc/net/arp` / `ip neigh` / `arp`, DNS, TCP connect.
pub struct SystemNetwork {
    dns: dns::DnsSignal,
}

impl SystemNetwork {
    pub fn new(settings: &Settings) -> Self {
        Self {
            dns: dns::DnsSignal::new(settings.dns_order.clone(), settings.probe_timeout),
        }
    }
}

#[async_trait]
impl NetworkSignals for SystemNetwork {
    async fn neighbors(&self) -> Vec<Neighbor> {
        arp::read_system_table().await
    }

    async fn lookup_host(&self, hostname: &str) -> Vec<Ipv4Addr> {
        self.dns.resolve(hostname).await
    }

    async fn port_open(&self, ip: Ipv4Addr, port: u16, timeout: Duration) -> bool {
        tcp_port_open(ip, port, timeout).await
    }
}

pub async fn tcp_port_open(ip: Ipv4Addr, port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((ip, port));
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn open_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(tcp_port_open(Ipv4Addr::LOCALHOST, port, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!tcp_port_open(Ipv4Addr::LOCALHOST, port, Duration::from_millis(500)).await);
    }
}
