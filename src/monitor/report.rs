use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::bootstrap::{read_json, write_json_atomic};
use crate::error::{ClusterError, Result};
use crate::types::{Alert, NodeRecord, ResourceSample, VolumeStatus};

/// A report section: either data, or why it could not be gathered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Section<T> {
    Available { data: T },
    Unavailable { reason: String },
}

impl<T> Section<T> {
    pub fn available(data: T) -> Self {
        Section::Available { data }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Section::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Section::Available { data } => Some(data),
            Section::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Section::Available { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub name: String,
    pub desired: u32,
    /// `None` when the task listing failed for this service
    pub running: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSummary {
    pub volume: String,
    pub status: VolumeStatus,
}

/// Timestamped snapshot written by every monitor cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub hostname: String,
    pub nodes: Section<Vec<NodeRecord>>,
    pub services: Section<Vec<ServiceSummary>>,
    pub resources: Section<ResourceSample>,
    pub storage: Section<StorageSummary>,
    pub alerts: Vec<Alert>,
    /// Local precondition failure that ends a daemon loop
    #[serde(skip)]
    pub fatal: Option<ClusterError>,
}

impl HealthReport {
    pub fn node_count(&self) -> Option<usize> {
        self.nodes.data().map(Vec::len)
    }

    pub fn service_count(&self) -> Option<usize> {
        self.services.data().map(Vec::len)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        read_json(path)?.ok_or_else(|| ClusterError::Io(format!("no health report at {:?}", path)))
    }
}
