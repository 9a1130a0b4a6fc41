use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::cluster::NodeRole;

/// Placement rule attached to a service declaration
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placement {
    Role { role: NodeRole },
    Hostname { hostname: String },
    Label { key: String, value: String },
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Role { role } => {
                let role = match role {
                    NodeRole::Manager => "manager",
                    NodeRole::Worker => "worker",
                    NodeRole::Candidate | NodeRole::Unknown => "unknown",
                };
                write!(f, "node.role=={}", role)
            }
            Placement::Hostname { hostname } => write!(f, "node.hostname=={}", hostname),
            Placement::Label { key, value } => write!(f, "node.labels.{}=={}", key, value),
        }
    }
}

/// Declared service intent. Read-only to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub desired_replicas: u32,
    #[serde(default)]
    pub constraints: BTreeSet<Placement>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, desired_replicas: u32) -> Self {
        Self {
            name: name.into(),
            desired_replicas,
            constraints: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Pending,
    Failed,
}

impl TaskState {
    /// Map a scheduler task state word onto the three tracked states.
    ///
    /// Terminal states that are expected (`complete`, `shutdown`, `remove`)
    /// yield `None`.
    pub fn from_scheduler(word: &str) -> Option<Self> {
        match word.trim().to_lowercase().as_str() {
            "running" => Some(TaskState::Running),
            "new" | "pending" | "assigned" | "accepted" | "ready" | "preparing" | "starting" => {
                Some(TaskState::Pending)
            }
            "failed" | "rejected" | "orphaned" => Some(TaskState::Failed),
            _ => None,
        }
    }
}

/// Freshly queried state of a service. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceObservation {
    pub name: String,
    pub running_replicas: u32,
    pub task_states: Vec<TaskState>,
}

impl ServiceObservation {
    pub fn from_tasks(name: impl Into<String>, task_states: Vec<TaskState>) -> Self {
        let running_replicas = task_states
            .iter()
            .filter(|state| **state == TaskState::Running)
            .count() as u32;
        Self {
            name: name.into(),
            running_replicas,
            task_states,
        }
    }

    pub fn is_under_replicated(&self, desired: u32) -> bool {
        self.running_replicas < desired
    }
}
