use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use super::DiscoveryStrategy;
use crate::command::CommandRunner;
use crate::error::Result;
use crate::identity::IdentityResolver;

/// Reachability checks used by the active probe.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn reachable(&self, addr: IpAddr, timeout: Duration) -> bool;

    async fn port_open(&self, addr: IpAddr, port: u16, timeout: Duration) -> bool;
}

/// ICMP echo through `ping` plus a TCP connect.
#[derive(Clone)]
pub struct SystemProber {
    runner: Arc<dyn CommandRunner>,
    ping: String,
}

impl SystemProber {
    pub fn new(runner: Arc<dyn CommandRunner>, ping: impl Into<String>) -> Self {
        Self {
            runner,
            ping: ping.into(),
        }
    }
}

#[async_trait]
impl Prober for SystemProber {
    async fn reachable(&self, addr: IpAddr, timeout: Duration) -> bool {
        let wait = timeout.as_secs().max(1).to_string();
        let target = addr.to_string();
        let args = ["-c", "1", "-W", &wait, &target];
        let ping = self.runner.run(&self.ping, &args);
        match tokio::time::timeout(timeout + Duration::from_millis(500), ping).await {
            Ok(Ok(output)) => output.is_success(),
            _ => false,
        }
    }

    async fn port_open(&self, addr: IpAddr, port: u16, timeout: Duration) -> bool {
        let target = SocketAddr::new(addr, port);
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(target)).await,
            Ok(Ok(_))
        )
    }
}

/// Widest subnet the active probe will ever enumerate.
pub const MIN_SCAN_PREFIX: u8 = 16;

/// Host addresses of `addr`'s subnet, excluding `addr` itself.
///
/// Prefixes wider than `min_prefix` (and never wider than
/// [`MIN_SCAN_PREFIX`]) are narrowed to it around `addr`.
/// Network and broadcast addresses are skipped for prefixes up to /30.
pub fn subnet_hosts(addr: Ipv4Addr, prefix: u8, min_prefix: u8) -> Vec<Ipv4Addr> {
    let prefix = prefix.max(min_prefix).max(MIN_SCAN_PREFIX).min(32);
    if prefix == 32 {
        return Vec::new();
    }
    let mask: u32 = u32::MAX << (32 - prefix as u32);
    let base = u32::from(addr) & mask;
    let last = base | !mask;
    let (first, last) = if prefix >= 31 { (base, last) } else { (base + 1, last - 1) };

    (first..=last)
        .map(Ipv4Addr::from)
        .filter(|host| *host != addr)
        .collect()
}

/// Scans the local subnet for hosts answering on the service port.
#[derive(Clone)]
pub struct ActiveProbe {
    identity: Arc<dyn IdentityResolver>,
    prober: Arc<dyn Prober>,
    port: u16,
    reach_timeout: Duration,
    port_timeout: Duration,
    concurrency: usize,
    min_prefix: u8,
}

impl ActiveProbe {
    pub fn new(identity: Arc<dyn IdentityResolver>, prober: Arc<dyn Prober>, port: u16) -> Self {
        Self {
            identity,
            prober,
            port,
            reach_timeout: Duration::from_millis(1500),
            port_timeout: Duration::from_millis(1500),
            concurrency: 64,
            min_prefix: 22,
        }
    }

    pub fn with_timeouts(mut self, reach: Duration, port: Duration) -> Self {
        self.reach_timeout = reach;
        self.port_timeout = port;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_min_prefix(mut self, min_prefix: u8) -> Self {
        self.min_prefix = min_prefix;
        self
    }
}

#[async_trait]
impl DiscoveryStrategy for ActiveProbe {
    fn name(&self) -> &'static str {
        "active"
    }

    async fn discover(&self) -> Result<BTreeSet<IpAddr>> {
        let network = self.identity.local_network().await?;
        let IpAddr::V4(local) = network.address else {
            debug!("Active probe skipped, local address {} is not IPv4", network.address);
            return Ok(BTreeSet::new());
        };

        let hosts = subnet_hosts(local, network.prefix, self.min_prefix);
        debug!("Probing {} host(s) around {}/{}", hosts.len(), local, network.prefix);

        let found = stream::iter(hosts)
            .map(|host| {
                let addr = IpAddr::V4(host);
                async move {
                    if !self.prober.reachable(addr, self.reach_timeout).await {
                        return None;
                    }
                    self.prober
                        .port_open(addr, self.port, self.port_timeout)
                        .await
                        .then_some(addr)
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|hit| async move { hit })
            .collect::<BTreeSet<IpAddr>>()
            .await;

        Ok(found)
    }
}
