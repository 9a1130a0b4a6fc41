use async_trait::async_trait;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use sysinfo::{Disks, Networks, System};
use tracing::debug;

use super::{IdentityResolver, LocalNetwork, ResourceProbe};
use crate::error::{ClusterError, Result};
use crate::types::ResourceSample;

const ROUTE_TABLE: &str = "/proc/net/route";

/// Resolves identity from the host's interfaces.
#[derive(Debug, Clone, Default)]
pub struct SystemIdentity {
    /// Configured address that bypasses interface detection
    pinned: Option<IpAddr>,
}

impl SystemIdentity {
    pub fn new(pinned: Option<IpAddr>) -> Self {
        Self { pinned }
    }
}

#[async_trait]
impl IdentityResolver for SystemIdentity {
    async fn local_network(&self) -> Result<LocalNetwork> {
        let pinned = self.pinned;
        tokio::task::spawn_blocking(move || {
            let default_iface = fs::read_to_string(ROUTE_TABLE)
                .ok()
                .and_then(|table| default_route_interface(&table));

            let networks = Networks::new_with_refreshed_list();
            let interfaces: Vec<(String, Vec<(IpAddr, u8)>)> = networks
                .iter()
                .map(|(name, data)| {
                    let addrs = data.ip_networks().iter().map(|n| (n.addr, n.prefix)).collect();
                    (name.clone(), addrs)
                })
                .collect();

            if let Some(address) = pinned {
                let prefix = interfaces
                    .iter()
                    .flat_map(|(_, addrs)| addrs.iter())
                    .find(|(addr, _)| *addr == address)
                    .map(|(_, prefix)| *prefix)
                    .unwrap_or(24);
                return Ok(LocalNetwork { address, prefix });
            }

            choose_network(&interfaces, default_iface.as_deref()).ok_or(ClusterError::NoAddress)
        })
        .await
        .map_err(|e| ClusterError::Io(e.to_string()))?
    }

    async fn hostname(&self) -> Option<String> {
        System::host_name()
    }
}

/// Interface carrying the default route in a `/proc/net/route` table.
pub(crate) fn default_route_interface(table: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let mut cols = line.split_whitespace();
        let iface = cols.next()?;
        let destination = cols.next()?;
        (destination == "00000000").then(|| iface.to_string())
    })
}

/// Prefer the default-route interface's IPv4 address, then any non-loopback
/// IPv4 address.
pub(crate) fn choose_network(
    interfaces: &[(String, Vec<(IpAddr, u8)>)],
    default_iface: Option<&str>,
) -> Option<LocalNetwork> {
    let usable = |addr: &IpAddr| match addr {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_unspecified() && !v4.is_link_local(),
        IpAddr::V6(_) => false,
    };

    let pick = |addrs: &Vec<(IpAddr, u8)>| {
        addrs
            .iter()
            .find(|(addr, _)| usable(addr))
            .map(|(address, prefix)| LocalNetwork {
                address: *address,
                prefix: *prefix,
            })
    };

    if let Some(name) = default_iface {
        if let Some(network) = interfaces
            .iter()
            .find(|(iface, _)| iface == name)
            .and_then(|(_, addrs)| pick(addrs))
        {
            return Some(network);
        }
    }

    let mut sorted: Vec<_> = interfaces.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted.into_iter().find_map(|(_, addrs)| pick(addrs))
}

/// Samples memory, CPU and the disk holding the data directory.
#[derive(Debug, Clone)]
pub struct SystemResourceProbe {
    data_path: PathBuf,
}

impl SystemResourceProbe {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
        }
    }
}

#[async_trait]
impl ResourceProbe for SystemResourceProbe {
    async fn sample(&self) -> ResourceSample {
        let data_path = self.data_path.clone();
        let blocking = tokio::task::spawn_blocking(move || {
            let mut system = System::new();
            system.refresh_memory();
            let total = system.total_memory() as f64;
            let memory = (total > 0.0).then(|| system.used_memory() as f64 / total * 100.0);

            system.refresh_cpu_usage();
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            system.refresh_cpu_usage();
            let cpu = (!system.cpus().is_empty()).then(|| system.global_cpu_usage() as f64);

            let disks = Disks::new_with_refreshed_list();
            let mounts: Vec<(PathBuf, u64, u64)> = disks
                .list()
                .iter()
                .map(|d| (d.mount_point().to_path_buf(), d.total_space(), d.available_space()))
                .collect();
            let disk = disk_usage_for(&data_path, &mounts);

            ResourceSample::new(memory, disk, cpu)
        });

        match blocking.await {
            Ok(sample) => sample,
            Err(e) => {
                debug!("Resource sampling task failed: {}", e);
                ResourceSample::unavailable()
            }
        }
    }
}

/// Usage percent of the mount with the longest prefix of `path`.
pub(crate) fn disk_usage_for(path: &Path, mounts: &[(PathBuf, u64, u64)]) -> Option<f64> {
    mounts
        .iter()
        .filter(|(mount, total, _)| *total > 0 && path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.as_os_str().len())
        .map(|(_, total, available)| {
            let used = total.saturating_sub(*available) as f64;
            used / *total as f64 * 100.0
        })
}
