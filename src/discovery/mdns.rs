use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::DiscoveryStrategy;
use crate::error::{ClusterError, Result};
use crate::types::MembershipState;

/// Passive discovery by browsing multicast-DNS service records.
#[derive(Debug, Clone)]
pub struct MdnsBrowser {
    service_type: String,
    window: Duration,
}

impl MdnsBrowser {
    pub fn new(service_type: impl Into<String>, window: Duration) -> Self {
        Self {
            service_type: service_type.into(),
            window,
        }
    }
}

#[async_trait]
impl DiscoveryStrategy for MdnsBrowser {
    fn name(&self) -> &'static str {
        "mdns"
    }

    async fn discover(&self) -> Result<BTreeSet<IpAddr>> {
        let daemon = ServiceDaemon::new()?;
        let receiver = daemon.browse(&self.service_type)?;
        let deadline = Instant::now() + self.window;
        let mut found = BTreeSet::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    debug!("mDNS resolved {}", info.get_fullname());
                    found.extend(info.get_addresses().iter().copied());
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }

        let _ = daemon.stop_browse(&self.service_type);
        let _ = daemon.shutdown();
        Ok(found)
    }
}

/// What a node announces about itself after bootstrap.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: IpAddr,
    pub port: u16,
    pub hostname: String,
    pub role: MembershipState,
    pub version: String,
}

#[async_trait]
pub trait Advertiser: Send + Sync {
    async fn publish(&self, ad: &Advertisement) -> Result<()>;

    async fn withdraw(&self) -> Result<()>;
}

/// Publishes the local service record; it stays registered while this
/// value lives.
pub struct MdnsAdvertiser {
    service_type: String,
    registered: Mutex<Option<(ServiceDaemon, String)>>,
}

impl MdnsAdvertiser {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            registered: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Advertiser for MdnsAdvertiser {
    async fn publish(&self, ad: &Advertisement) -> Result<()> {
        self.withdraw().await?;

        let daemon = ServiceDaemon::new()?;
        let host = format!("{}.local.", ad.hostname.trim_end_matches('.'));
        let role = ad.role.to_string();
        let properties = [("role", role.as_str()), ("version", ad.version.as_str())];
        let info = ServiceInfo::new(
            &self.service_type,
            &ad.hostname,
            &host,
            ad.address,
            ad.port,
            &properties[..],
        )?;
        let fullname = info.get_fullname().to_string();
        daemon.register(info)?;
        info!("Advertising {} as {} on {}:{}", fullname, role, ad.address, ad.port);

        *self.registered.lock() = Some((daemon, fullname));
        Ok(())
    }

    async fn withdraw(&self) -> Result<()> {
        let previous = self.registered.lock().take();
        if let Some((daemon, fullname)) = previous {
            if let Err(e) = daemon.unregister(&fullname) {
                warn!("Failed to unregister {}: {}", fullname, e);
            }
            daemon
                .shutdown()
                .map_err(|e| ClusterError::Discovery(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        if let Some((daemon, fullname)) = self.registered.get_mut().take() {
            let _ = daemon.unregister(&fullname);
            let _ = daemon.shutdown();
        }
    }
}

/// Used by one-shot commands that must not leave a record behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAdvertiser;

#[async_trait]
impl Advertiser for NoopAdvertiser {
    async fn publish(&self, ad: &Advertisement) -> Result<()> {
        debug!("Skipping advertisement of {} ({})", ad.address, ad.role);
        Ok(())
    }

    async fn withdraw(&self) -> Result<()> {
        Ok(())
    }
}
