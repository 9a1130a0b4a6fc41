//! Peer discovery.
//!
//! Candidate peers are the union of every configured strategy's findings,
//! minus the local address. An empty set is a valid outcome.

mod mdns;
mod probe;

pub use mdns::{Advertisement, Advertiser, MdnsAdvertiser, MdnsBrowser, NoopAdvertiser};
pub use probe::{subnet_hosts, ActiveProbe, Prober, SystemProber, MIN_SCAN_PREFIX};

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;

#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn discover(&self) -> Result<BTreeSet<IpAddr>>;
}

/// Seed addresses from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPeers {
    peers: BTreeSet<IpAddr>,
}

impl StaticPeers {
    pub fn new(peers: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            peers: peers.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DiscoveryStrategy for StaticPeers {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn discover(&self) -> Result<BTreeSet<IpAddr>> {
        Ok(self.peers.clone())
    }
}

#[derive(Clone)]
pub struct PeerDiscovery {
    strategies: Vec<Arc<dyn DiscoveryStrategy>>,
}

impl PeerDiscovery {
    pub fn new(strategies: Vec<Arc<dyn DiscoveryStrategy>>) -> Self {
        Self { strategies }
    }

    /// Run every strategy concurrently and union the results.
    ///
    /// A failing strategy contributes nothing; it does not fail the pass.
    pub async fn discover(&self, local: IpAddr) -> BTreeSet<IpAddr> {
        let passes = self.strategies.iter().map(|strategy| {
            let strategy = strategy.clone();
            async move { (strategy.name(), strategy.discover().await) }
        });

        let mut peers = BTreeSet::new();
        for (name, outcome) in futures::future::join_all(passes).await {
            match outcome {
                Ok(found) => {
                    debug!("{} discovery found {} peer(s)", name, found.len());
                    peers.extend(found);
                }
                Err(e) => warn!("{} discovery failed: {}", name, e),
            }
        }
        peers.remove(&local);
        info!("Discovered {} candidate peer(s)", peers.len());
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;
    use std::net::Ipv4Addr;

    struct Failing;

    #[async_trait]
    impl DiscoveryStrategy for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn discover(&self) -> Result<BTreeSet<IpAddr>> {
            Err(ClusterError::Discovery("multicast unavailable".into()))
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn test_union_excludes_local_and_tolerates_failure() {
        let strategies: Vec<Arc<dyn DiscoveryStrategy>> = vec![
            Arc::new(StaticPeers::new([ip(3), ip(1), ip(2)])),
            Arc::new(StaticPeers::new([ip(3), ip(4)])),
            Arc::new(Failing),
        ];
        let discovery = PeerDiscovery::new(strategies);
        let peers = discovery.discover(ip(1)).await;
        assert_eq!(peers.into_iter().collect::<Vec<_>>(), vec![ip(2), ip(3), ip(4)]);
    }

    #[tokio::test]
    async fn test_empty_is_valid() {
        let discovery = PeerDiscovery::new(vec![]);
        assert!(discovery.discover(ip(1)).await.is_empty());
    }
}
