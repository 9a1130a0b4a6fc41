//! Alert classification and delivery.
//!
//! Classification is pure: each function turns one observation into at most
//! one alert per violated condition.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::{ClusterError, Result};
use crate::types::{Alert, AlertKind, NodeRecord, NodeStatus, ResourceSample, Severity, VolumeStatus};

/// Usage thresholds, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub memory: f64,
    pub disk: f64,
    pub memory_critical: f64,
    pub disk_critical: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            memory: 90.0,
            disk: 90.0,
            memory_critical: 95.0,
            disk_critical: 95.0,
        }
    }
}

fn usage_alert(kind: AlertKind, what: &str, value: Option<f64>, warn_at: f64, critical_at: f64) -> Option<Alert> {
    let value = value?;
    if value <= warn_at {
        return None;
    }
    let severity = if value >= critical_at {
        Severity::Critical
    } else {
        Severity::Warning
    };
    Some(Alert::new(
        kind,
        severity,
        format!("{} usage {:.1}% over threshold {:.1}%", what, value, warn_at),
    ))
}

pub fn classify_resources(sample: &ResourceSample, thresholds: &Thresholds) -> Vec<Alert> {
    [
        usage_alert(
            AlertKind::DiskPressure,
            "disk",
            sample.disk_percent,
            thresholds.disk,
            thresholds.disk_critical,
        ),
        usage_alert(
            AlertKind::MemoryPressure,
            "memory",
            sample.memory_percent,
            thresholds.memory,
            thresholds.memory_critical,
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
}

pub fn classify_node(node: &NodeRecord, status: Option<&NodeStatus>) -> Option<Alert> {
    if node.healthy {
        return None;
    }
    let detail = match status {
        Some(NodeStatus { state, message: Some(message) }) => {
            format!("node {} is {}: {}", node.label(), state, message)
        }
        Some(NodeStatus { state, message: None }) => format!("node {} is {}", node.label(), state),
        None => format!("node {} is not ready", node.label()),
    };
    Some(Alert::new(AlertKind::NodeDown, Severity::Critical, detail))
}

pub fn classify_service(name: &str, running: u32, desired: u32) -> Option<Alert> {
    if running >= desired {
        return None;
    }
    let severity = if running == 0 {
        Severity::Critical
    } else {
        Severity::Warning
    };
    Some(Alert::new(
        AlertKind::ServiceUnderReplicated,
        severity,
        format!("service {} running {}/{} replicas", name, running, desired),
    ))
}

pub fn classify_storage(volume: &str, status: &Result<VolumeStatus>) -> Option<Alert> {
    match status {
        Ok(VolumeStatus::Online) => None,
        Ok(VolumeStatus::Degraded) => Some(Alert::new(
            AlertKind::StorageDegraded,
            Severity::Warning,
            format!("volume {} is degraded", volume),
        )),
        Ok(VolumeStatus::Offline) => Some(Alert::new(
            AlertKind::StorageDegraded,
            Severity::Critical,
            format!("volume {} is offline", volume),
        )),
        Err(e) => Some(Alert::new(
            AlertKind::StorageDegraded,
            Severity::Warning,
            format!("volume {} status unknown: {}", volume, e),
        )),
    }
}

pub fn network_unreachable(error: &ClusterError) -> Alert {
    Alert::new(
        AlertKind::NetworkUnreachable,
        Severity::Critical,
        format!("control plane unreachable: {}", error),
    )
}

/// Destination for the alerts raised in one cycle.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, hostname: &str, alerts: &[Alert]) -> Result<()>;
}

/// Writes each alert to the log at a level matching its severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn emit(&self, hostname: &str, alerts: &[Alert]) -> Result<()> {
        for alert in alerts {
            match alert.severity {
                Severity::Critical => error!(
                    kind = %alert.kind,
                    host = hostname,
                    "[{}] {}", alert.severity, alert.detail
                ),
                Severity::Warning => warn!(
                    kind = %alert.kind,
                    host = hostname,
                    "[{}] {}", alert.severity, alert.detail
                ),
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    host: &'a str,
    alerts: &'a [Alert],
}

/// Posts the alert batch as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterError::Http(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn emit(&self, hostname: &str, alerts: &[Alert]) -> Result<()> {
        if alerts.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { host: hostname, alerts })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClusterError::Http(format!("webhook answered {}", response.status())));
        }
        Ok(())
    }
}
