use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{CleanupSummary, ControlPlane, LocalNodeState, LocalRuntime, SwarmState};
use crate::command::{split_command_line, CommandOutput, CommandRunner};
use crate::error::{ClusterError, Result};
use crate::types::{JoinRole, JoinToken, NodeRecord, NodeRole, NodeStatus, TaskState};

/// Swarm manager port used for joins.
pub const SWARM_PORT: u16 = 2377;

/// Docker Swarm through the `docker` CLI.
#[derive(Clone)]
pub struct DockerCli {
    runner: Arc<dyn CommandRunner>,
    docker: String,
    systemctl: String,
    agent_unit: String,
    cleanup_commands: Vec<String>,
    managed_label: String,
}

impl DockerCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            docker: "docker".to_string(),
            systemctl: "systemctl".to_string(),
            agent_unit: "docker".to_string(),
            cleanup_commands: Vec::new(),
            managed_label: "swarmkeeper.managed=true".to_string(),
        }
    }

    pub fn with_binaries(mut self, docker: impl Into<String>, systemctl: impl Into<String>) -> Self {
        self.docker = docker.into();
        self.systemctl = systemctl.into();
        self
    }

    pub fn with_agent_unit(mut self, unit: impl Into<String>) -> Self {
        self.agent_unit = unit.into();
        self
    }

    pub fn with_cleanup_commands(mut self, commands: Vec<String>) -> Self {
        self.cleanup_commands = commands;
        self
    }

    pub fn with_managed_label(mut self, label: impl Into<String>) -> Self {
        self.managed_label = label.into();
        self
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        let output = self.runner.run(&self.docker, args).await?;
        if output.is_success() {
            Ok(output.stdout)
        } else {
            Err(classify_failure(&format!("docker {}", args.join(" ")), &output))
        }
    }
}

/// Map a failed docker invocation onto the error classes callers act on.
pub(crate) fn classify_failure(operation: &str, output: &CommandOutput) -> ClusterError {
    let message = output.diagnostic();
    let lower = message.to_lowercase();

    if lower.contains("invalid join token")
        || lower.contains("permission denied")
        || lower.contains("not authorized")
        || lower.contains("rejected")
    {
        ClusterError::rejected(message)
    } else if lower.contains("cannot connect to the docker daemon")
        || lower.contains("connection refused")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("context deadline exceeded")
    {
        ClusterError::transient(format!("{}: {}", operation, message))
    } else {
        ClusterError::command(operation, message)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmInfo {
    #[serde(rename = "NodeID", default)]
    node_id: String,
    #[serde(default)]
    node_addr: String,
    #[serde(default)]
    local_node_state: String,
    #[serde(default)]
    control_available: bool,
    #[serde(default)]
    remote_managers: Option<Vec<RemoteManager>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RemoteManager {
    addr: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInspect {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    spec: NodeSpecInspect,
    #[serde(default)]
    description: Option<NodeDescription>,
    status: NodeStatusInspect,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeSpecInspect {
    #[serde(default)]
    role: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeDescription {
    #[serde(default)]
    hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeStatusInspect {
    #[serde(default)]
    state: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    addr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskLine {
    #[serde(default)]
    current_state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceMode {
    #[serde(default)]
    replicated: Option<Replicated>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Replicated {
    #[serde(default)]
    replicas: Option<u32>,
}

fn host_of(addr: &str) -> Option<IpAddr> {
    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    host.trim_matches(|c| c == '[' || c == ']').parse().ok()
}

pub(crate) fn parse_swarm_info(json: &str) -> Result<LocalNodeState> {
    let info: SwarmInfo = serde_json::from_str(json.trim())?;
    let state = SwarmState::parse(&info.local_node_state);
    let manager_address = if info.control_available {
        host_of(&info.node_addr)
    } else {
        info.remote_managers
            .unwrap_or_default()
            .iter()
            .find_map(|m| host_of(&m.addr))
    };
    Ok(LocalNodeState {
        node_id: (!info.node_id.is_empty()).then_some(info.node_id),
        state,
        is_manager: info.control_available,
        manager_address,
    })
}

pub(crate) fn parse_node_inspect(json: &str) -> Result<Vec<NodeRecord>> {
    let nodes: Vec<NodeInspect> = serde_json::from_str(json.trim())?;
    Ok(nodes
        .into_iter()
        .map(|node| {
            let role = match node.spec.role.as_str() {
                "manager" => NodeRole::Manager,
                "worker" => NodeRole::Worker,
                _ => NodeRole::Unknown,
            };
            let address = node
                .status
                .addr
                .as_deref()
                .and_then(host_of)
                .unwrap_or(IpAddr::from([0, 0, 0, 0]));
            NodeRecord {
                id: Some(node.id),
                hostname: node.description.and_then(|d| d.hostname),
                address,
                role,
                last_seen_at: node.updated_at.unwrap_or_else(Utc::now),
                healthy: node.status.state == "ready",
            }
        })
        .collect())
}

/// Task states from `docker service ps --format '{{json .}}'` lines.
pub(crate) fn parse_task_lines(output: &str) -> Vec<TaskState> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<TaskLine>(line) {
            Ok(task) => task
                .current_state
                .split_whitespace()
                .next()
                .and_then(TaskState::from_scheduler),
            Err(e) => {
                debug!("Skipping unparsable task line: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl ControlPlane for DockerCli {
    async fn local_state(&self) -> Result<LocalNodeState> {
        let out = self.docker(&["info", "--format", "{{json .Swarm}}"]).await?;
        parse_swarm_info(&out)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let ids = self.docker(&["node", "ls", "-q"]).await?;
        let ids: Vec<&str> = ids.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["node", "inspect"];
        args.extend(ids);
        let json = self.docker(&args).await?;
        parse_node_inspect(&json)
    }

    async fn inspect_node(&self, id: &str) -> Result<NodeStatus> {
        let json = self.docker(&["node", "inspect", "--format", "{{json .Status}}", id]).await?;
        let status: NodeStatusInspect = serde_json::from_str(json.trim())?;
        Ok(NodeStatus {
            state: status.state,
            message: status.message.filter(|m| !m.is_empty()),
        })
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        let out = self.docker(&["service", "ls", "--format", "{{.Name}}"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn list_tasks(&self, service: &str) -> Result<Vec<TaskState>> {
        let out = self
            .docker(&[
                "service",
                "ps",
                service,
                "--no-trunc",
                "--filter",
                "desired-state=running",
                "--format",
                "{{json .}}",
            ])
            .await?;
        Ok(parse_task_lines(&out))
    }

    async fn inspect_service(&self, service: &str) -> Result<Option<u32>> {
        let out = self
            .docker(&["service", "inspect", "--format", "{{json .Spec.Mode}}", service])
            .await?;
        let mode: ServiceMode = serde_json::from_str(out.trim())?;
        Ok(mode.replicated.and_then(|r| r.replicas))
    }

    async fn init_cluster(&self, address: IpAddr) -> Result<JoinToken> {
        let addr = address.to_string();
        let output = self
            .runner
            .run(&self.docker, &["swarm", "init", "--advertise-addr", &addr])
            .await?;
        if !output.is_success() {
            if output.diagnostic().contains("already part of a swarm") {
                info!("Local engine already belongs to a swarm, reusing it");
            } else {
                return Err(classify_failure("docker swarm init", &output));
            }
        }
        info!("Initialized swarm advertising {}", address);
        self.issue_join_token(JoinRole::Manager).await
    }

    async fn join_cluster(&self, manager: IpAddr, token: &JoinToken) -> Result<()> {
        let remote = match manager {
            IpAddr::V4(v4) => format!("{}:{}", v4, SWARM_PORT),
            IpAddr::V6(v6) => format!("[{}]:{}", v6, SWARM_PORT),
        };
        let output = self
            .runner
            .run(&self.docker, &["swarm", "join", "--token", token.expose(), &remote])
            .await?;
        if output.is_success() {
            return Ok(());
        }
        if output.diagnostic().contains("already part of a swarm") {
            warn!("Local engine already joined a swarm");
            return Ok(());
        }
        Err(classify_failure("docker swarm join", &output))
    }

    async fn issue_join_token(&self, role: JoinRole) -> Result<JoinToken> {
        let out = self.docker(&["swarm", "join-token", "-q", role.as_str()]).await?;
        let token = JoinToken::new(out.trim());
        if token.is_empty() {
            return Err(ClusterError::control_plane("empty join token"));
        }
        Ok(token)
    }

    async fn force_service_update(&self, service: &str) -> Result<()> {
        self.docker(&["service", "update", "--force", "--detach", service])
            .await
            .map(|_| ())
    }

    async fn create_overlay_network(&self, name: &str) -> Result<()> {
        let output = self
            .runner
            .run(
                &self.docker,
                &["network", "create", "--driver", "overlay", "--attachable", name],
            )
            .await?;
        if output.is_success() || output.diagnostic().contains("already exists") {
            return Ok(());
        }
        Err(classify_failure("docker network create", &output))
    }

    async fn limit_service_memory(&self, service: &str, limit: &str) -> Result<()> {
        self.docker(&["service", "update", "--detach", "--limit-memory", limit, service])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl LocalRuntime for DockerCli {
    async fn restart_agent(&self) -> Result<()> {
        let output = self
            .runner
            .run(&self.systemctl, &["restart", &self.agent_unit])
            .await?;
        if output.is_success() {
            Ok(())
        } else {
            Err(ClusterError::command(
                format!("{} restart {}", self.systemctl, self.agent_unit),
                output.diagnostic(),
            ))
        }
    }

    async fn run_cleanup(&self) -> Result<CleanupSummary> {
        let mut summary = CleanupSummary::default();
        for line in &self.cleanup_commands {
            let Some((program, args)) = split_command_line(line) else {
                continue;
            };
            summary.commands_run += 1;
            match self.runner.run(program, &args).await {
                Ok(output) if output.is_success() => debug!("Cleanup `{}` done", line),
                Ok(output) => {
                    summary.commands_failed += 1;
                    warn!("Cleanup `{}` failed: {}", line, output.diagnostic());
                }
                Err(e) => {
                    summary.commands_failed += 1;
                    warn!("Cleanup `{}` failed: {}", line, e);
                }
            }
        }
        Ok(summary)
    }

    async fn list_exited_managed(&self) -> Result<Vec<String>> {
        let label = format!("label={}", self.managed_label);
        let out = self
            .docker(&[
                "ps",
                "-a",
                "--filter",
                "status=exited",
                "--filter",
                &label,
                "--format",
                "{{.ID}}",
            ])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn remove_unit(&self, id: &str) -> Result<()> {
        self.docker(&["rm", id]).await.map(|_| ())
    }
}
