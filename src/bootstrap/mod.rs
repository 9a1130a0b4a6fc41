//! Cluster Bootstrap Coordinator
//!
//! Brings the local node into a cluster: join an existing one through the
//! first discovered peer that accepts us, or found a new one when nobody
//! does.
//!
//! ```text
//! NotJoined -> Discovering -> JoinAttempt -> Joined
//!                          \-> Founding   -> Founded
//! ```

mod candidates;
mod credentials;
mod store;

pub use candidates::{first_success, CandidateQueue, Selection};
pub use credentials::{CredentialSource, HttpCredentialSource, JoinGrant};
pub use store::MembershipStore;
pub(crate) use store::{read_json, write_json_atomic};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::config::{Config, StorageProvisionConfig};
use crate::control_plane::{ControlPlane, StorageLayer};
use crate::discovery::{Advertisement, Advertiser, PeerDiscovery};
use crate::error::{ClusterError, Result};
use crate::identity::NodeProbe;
use crate::retry::RetryPolicy;
use crate::types::{ClusterMembership, JoinRole, MembershipState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPhase {
    NotJoined,
    Discovering,
    JoinAttempt,
    Joined,
    Founding,
    Founded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BootstrapOutcome {
    /// Membership already established; nothing was done
    AlreadyMember { state: MembershipState },
    Joined { via: IpAddr, manager: IpAddr, role: JoinRole },
    Founded { address: IpAddr },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAttemptRecord {
    pub peer: IpAddr,
    /// `None` for the attempt that succeeded
    pub error: Option<String>,
    pub rejected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub outcome: BootstrapOutcome,
    pub phases: Vec<BootstrapPhase>,
    pub attempts: Vec<JoinAttemptRecord>,
    /// Founding provisioning steps that failed without aborting the founding
    pub provisioning_failures: Vec<String>,
}

impl BootstrapReport {
    fn no_op(state: MembershipState) -> Self {
        Self {
            outcome: BootstrapOutcome::AlreadyMember { state },
            phases: Vec::new(),
            attempts: Vec::new(),
            provisioning_failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub join_role: JoinRole,
    pub overlay_networks: Vec<String>,
    pub storage: Option<StorageProvisionConfig>,
    pub service_port: u16,
    pub descriptor_version: String,
}

impl BootstrapSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            join_role: config.node.join_role,
            overlay_networks: config.bootstrap.overlay_networks.clone(),
            storage: config.bootstrap.storage.clone(),
            service_port: config.node.service_port,
            descriptor_version: config.descriptor_version(),
        }
    }
}

#[derive(Clone)]
pub struct BootstrapCoordinator {
    probe: NodeProbe,
    discovery: PeerDiscovery,
    credentials: Arc<dyn CredentialSource>,
    control_plane: Arc<dyn ControlPlane>,
    storage: Option<Arc<dyn StorageLayer>>,
    advertiser: Arc<dyn Advertiser>,
    store: MembershipStore,
    settings: BootstrapSettings,
}

impl BootstrapCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        probe: NodeProbe,
        discovery: PeerDiscovery,
        credentials: Arc<dyn CredentialSource>,
        control_plane: Arc<dyn ControlPlane>,
        storage: Option<Arc<dyn StorageLayer>>,
        advertiser: Arc<dyn Advertiser>,
        store: MembershipStore,
        settings: BootstrapSettings,
    ) -> Self {
        Self {
            probe,
            discovery,
            credentials,
            control_plane,
            storage,
            advertiser,
            store,
            settings,
        }
    }

    pub fn store(&self) -> &MembershipStore {
        &self.store
    }

    /// One pass of the bootstrap state machine.
    ///
    /// Transient failures are returned to the caller, which re-invokes the
    /// coordinator; see [`BootstrapCoordinator::run_until_settled`].
    #[instrument(skip(self), name = "bootstrap")]
    pub async fn run(&self) -> Result<BootstrapReport> {
        let membership = self.probe.current_membership().await;
        if membership.state != MembershipState::NotJoined {
            info!("Already {}, nothing to bootstrap", membership.state);
            return Ok(BootstrapReport::no_op(membership.state));
        }
        if membership.unknown {
            let persisted = self.store.load()?;
            if persisted.is_member() {
                info!(
                    "Control plane unreachable but persisted membership is {}, not bootstrapping",
                    persisted.state
                );
                return Ok(BootstrapReport::no_op(persisted.state));
            }
        }

        let mut phases = vec![BootstrapPhase::NotJoined];
        let local = self.probe.local_address().await?;

        phases.push(BootstrapPhase::Discovering);
        let peers = self.discovery.discover(local).await;

        let mut record = ClusterMembership::default();
        record.begin_join()?;
        let mut attempts = Vec::new();

        if !peers.is_empty() {
            phases.push(BootstrapPhase::JoinAttempt);
            let role = self.settings.join_role;
            let selection = first_success(CandidateQueue::new(peers), |peer| async move {
                let grant = self.credentials.request_token(peer, role).await?;
                self.control_plane
                    .join_cluster(grant.manager_address, &grant.token)
                    .await?;
                Ok::<_, ClusterError>(grant)
            })
            .await;

            attempts.extend(selection.failures.iter().map(|(peer, e)| JoinAttemptRecord {
                peer: *peer,
                error: Some(e.to_string()),
                rejected: e.is_policy_rejection(),
            }));

            if let Some((via, grant)) = selection.winner {
                attempts.push(JoinAttemptRecord {
                    peer: via,
                    error: None,
                    rejected: false,
                });
                record.establish(grant.role, grant.manager_address, Some(grant.token), Utc::now())?;
                phases.push(BootstrapPhase::Joined);
                info!("Joined cluster via {} as {}", via, grant.role);

                self.finish(&mut record, local).await?;
                return Ok(BootstrapReport {
                    outcome: BootstrapOutcome::Joined {
                        via,
                        manager: grant.manager_address,
                        role: grant.role,
                    },
                    phases,
                    attempts,
                    provisioning_failures: Vec::new(),
                });
            }
        }

        if membership.unknown {
            return Err(ClusterError::transient(
                "control plane unreachable and no peer accepted us; refusing to found a new cluster",
            ));
        }

        phases.push(BootstrapPhase::Founding);
        info!("No peer accepted a join, founding a new cluster on {}", local);
        let token = self.control_plane.init_cluster(local).await?;
        record.establish(JoinRole::Manager, local, Some(token), Utc::now())?;
        let provisioning_failures = self.provision(local).await;
        phases.push(BootstrapPhase::Founded);

        self.finish(&mut record, local).await?;
        Ok(BootstrapReport {
            outcome: BootstrapOutcome::Founded { address: local },
            phases,
            attempts,
            provisioning_failures,
        })
    }

    /// Re-invoke [`run`](Self::run) while it fails transiently.
    pub async fn run_until_settled(&self, policy: &RetryPolicy) -> Result<BootstrapReport> {
        policy.run("bootstrap", |_| self.run()).await
    }

    /// Baseline networks and storage for a freshly founded cluster.
    async fn provision(&self, local: IpAddr) -> Vec<String> {
        let mut failures = Vec::new();
        for network in &self.settings.overlay_networks {
            if let Err(e) = self.control_plane.create_overlay_network(network).await {
                error!("Failed to create overlay network {}: {}", network, e);
                failures.push(format!("network {}: {}", network, e));
            }
        }

        if let (Some(storage), Some(cfg)) = (&self.storage, &self.settings.storage) {
            let brick = format!("{}:{}", local, cfg.brick_path);
            let provisioned = async {
                storage.create_volume(&cfg.volume, &[brick]).await?;
                storage.mount(&cfg.volume, &cfg.mount_path).await
            };
            if let Err(e) = provisioned.await {
                error!("Failed to provision storage volume {}: {}", cfg.volume, e);
                failures.push(format!("volume {}: {}", cfg.volume, e));
            }
        }
        failures
    }

    async fn finish(&self, record: &mut ClusterMembership, local: IpAddr) -> Result<()> {
        record.last_applied_version = Some(self.settings.descriptor_version.clone());
        self.store.save(record)?;

        let ad = Advertisement {
            address: local,
            port: self.settings.service_port,
            hostname: self
                .probe
                .hostname()
                .await
                .unwrap_or_else(|| local.to_string().replace(['.', ':'], "-")),
            role: record.state,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        if let Err(e) = self.advertiser.publish(&ad).await {
            warn!("Failed to publish service advertisement: {}", e);
        }
        Ok(())
    }
}
