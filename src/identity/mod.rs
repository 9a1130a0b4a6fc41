//! Local node identity and state.
//!
//! Answers "who am I": the routable address, the local resource picture and
//! the membership as reported by the control plane.

mod system;

pub use system::{SystemIdentity, SystemResourceProbe};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::control_plane::{ControlPlane, SwarmState};
use crate::error::Result;
use crate::types::{ClusterMembership, MembershipState, ResourceSample};

/// Address of the default-route interface together with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNetwork {
    pub address: IpAddr,
    pub prefix: u8,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Fails with `NoAddress` when no non-loopback address exists.
    async fn local_network(&self) -> Result<LocalNetwork>;

    async fn local_address(&self) -> Result<IpAddr> {
        Ok(self.local_network().await?.address)
    }

    async fn hostname(&self) -> Option<String>;
}

#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Never fails; unreadable metrics are left as `None`.
    async fn sample(&self) -> ResourceSample;
}

/// Combined view of the local node used by bootstrap, reconcile and monitor.
#[derive(Clone)]
pub struct NodeProbe {
    identity: Arc<dyn IdentityResolver>,
    resources: Arc<dyn ResourceProbe>,
    control_plane: Arc<dyn ControlPlane>,
}

impl NodeProbe {
    pub fn new(
        identity: Arc<dyn IdentityResolver>,
        resources: Arc<dyn ResourceProbe>,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Self {
        Self {
            identity,
            resources,
            control_plane,
        }
    }

    pub async fn local_address(&self) -> Result<IpAddr> {
        self.identity.local_address().await
    }

    pub async fn local_network(&self) -> Result<LocalNetwork> {
        self.identity.local_network().await
    }

    pub async fn hostname(&self) -> Option<String> {
        self.identity.hostname().await
    }

    pub async fn sample_resources(&self) -> ResourceSample {
        self.resources.sample().await
    }

    /// Membership as the control plane sees it right now.
    ///
    /// An unreachable control plane yields a membership flagged `unknown`
    /// rather than an error.
    pub async fn current_membership(&self) -> ClusterMembership {
        match self.control_plane.local_state().await {
            Ok(local) => {
                let state = match local.state {
                    SwarmState::Active if local.is_manager => MembershipState::Manager,
                    SwarmState::Active => MembershipState::Worker,
                    SwarmState::Locked => MembershipState::Manager,
                    SwarmState::Pending => MembershipState::Joining,
                    SwarmState::Inactive | SwarmState::Error => MembershipState::NotJoined,
                };
                debug!("Control plane reports local state {:?} -> {}", local.state, state);
                ClusterMembership {
                    state,
                    manager_address: local.manager_address,
                    ..ClusterMembership::default()
                }
            }
            Err(e) => {
                warn!("Membership unknown, control plane unreachable: {}", e);
                ClusterMembership::unknown()
            }
        }
    }
}
