//! Seams to the container orchestrator, the distributed storage layer and
//! the local host runtime.

mod docker;
mod gluster;

pub use docker::DockerCli;
pub use gluster::{parse_volume_status, GlusterCli};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

use crate::error::Result;
use crate::types::{JoinRole, JoinToken, NodeRecord, NodeStatus, TaskState, VolumeStatus};

/// Swarm participation state of the local engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwarmState {
    Inactive,
    Pending,
    Active,
    Error,
    Locked,
}

impl SwarmState {
    pub fn parse(word: &str) -> Self {
        match word.trim().to_lowercase().as_str() {
            "active" => SwarmState::Active,
            "pending" => SwarmState::Pending,
            "locked" => SwarmState::Locked,
            "error" => SwarmState::Error,
            _ => SwarmState::Inactive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNodeState {
    pub node_id: Option<String>,
    pub state: SwarmState,
    pub is_manager: bool,
    pub manager_address: Option<IpAddr>,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Cheap liveness check of the local agent.
    async fn ping(&self) -> Result<()> {
        self.local_state().await.map(|_| ())
    }

    async fn local_state(&self) -> Result<LocalNodeState>;

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>>;

    async fn inspect_node(&self, id: &str) -> Result<NodeStatus>;

    async fn list_services(&self) -> Result<Vec<String>>;

    /// States of the tasks the scheduler currently wants running.
    async fn list_tasks(&self, service: &str) -> Result<Vec<TaskState>>;

    /// Declared replica count; `None` for global-mode services.
    async fn inspect_service(&self, service: &str) -> Result<Option<u32>>;

    /// Found a new cluster advertising on `address`; returns the manager join token.
    async fn init_cluster(&self, address: IpAddr) -> Result<JoinToken>;

    async fn join_cluster(&self, manager: IpAddr, token: &JoinToken) -> Result<()>;

    async fn issue_join_token(&self, role: JoinRole) -> Result<JoinToken>;

    /// Ask the scheduler to re-place tasks without changing the declared spec.
    async fn force_service_update(&self, service: &str) -> Result<()>;

    /// Idempotent; an existing network of the same name is success.
    async fn create_overlay_network(&self, name: &str) -> Result<()>;

    async fn limit_service_memory(&self, service: &str, limit: &str) -> Result<()>;
}

#[async_trait]
pub trait StorageLayer: Send + Sync {
    async fn volume_status(&self, name: &str) -> Result<VolumeStatus>;

    async fn create_volume(&self, name: &str, bricks: &[String]) -> Result<()>;

    async fn mount(&self, name: &str, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub commands_run: usize,
    pub commands_failed: usize,
}

/// Host-level actions on the local node.
#[async_trait]
pub trait LocalRuntime: Send + Sync {
    async fn restart_agent(&self) -> Result<()>;

    async fn run_cleanup(&self) -> Result<CleanupSummary>;

    async fn list_exited_managed(&self) -> Result<Vec<String>>;

    async fn remove_unit(&self, id: &str) -> Result<()>;
}
