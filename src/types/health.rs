use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Point-in-time local resource usage.
///
/// Each metric is `None` when it could not be read; a partial sample is
/// still a valid sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ResourceSample {
    pub fn new(memory: Option<f64>, disk: Option<f64>, cpu: Option<f64>) -> Self {
        Self {
            memory_percent: memory,
            disk_percent: disk,
            cpu_percent: cpu,
            timestamp: Utc::now(),
        }
    }

    pub fn unavailable() -> Self {
        Self::new(None, None, None)
    }

    pub fn memory_over(&self, threshold: f64) -> bool {
        self.memory_percent.map(|m| m > threshold).unwrap_or(false)
    }

    pub fn disk_over(&self, threshold: f64) -> bool {
        self.disk_percent.map(|d| d > threshold).unwrap_or(false)
    }

    /// Memory or disk above the given high-water mark.
    pub fn under_pressure(&self, threshold: f64) -> bool {
        self.memory_over(threshold) || self.disk_over(threshold)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    NodeDown,
    ServiceUnderReplicated,
    DiskPressure,
    MemoryPressure,
    NetworkUnreachable,
    StorageDegraded,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertKind::NodeDown => "node_down",
            AlertKind::ServiceUnderReplicated => "service_under_replicated",
            AlertKind::DiskPressure => "disk_pressure",
            AlertKind::MemoryPressure => "memory_pressure",
            AlertKind::NetworkUnreachable => "network_unreachable",
            AlertKind::StorageDegraded => "storage_degraded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A violated health condition found during one monitor cycle.
///
/// Alerts are re-emitted every cycle the condition holds; consumers
/// deduplicate downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub detail: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            detail: detail.into(),
            raised_at: Utc::now(),
        }
    }
}

/// Health of a distributed storage volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    Online,
    Degraded,
    Offline,
}
