//! Health Monitor & Alert Emitter
//!
//! Each cycle gathers nodes, services, local resources and storage status
//! into a [`HealthReport`], raises one alert per violated condition and
//! hands the alerts to the configured sinks. A failing sub-query marks only
//! its own section unavailable.

mod alerts;
mod report;
mod tracker;

pub use alerts::{
    classify_node, classify_resources, classify_service, classify_storage, network_unreachable, AlertSink,
    LogAlertSink, Thresholds, WebhookAlertSink,
};
pub use report::{HealthReport, Section, ServiceSummary, StorageSummary};
pub use tracker::NodeTracker;

use chrono::Utc;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::control_plane::{ControlPlane, StorageLayer};
use crate::error::{ClusterError, Result};
use crate::identity::NodeProbe;
use crate::periodic::run_periodic;
use crate::types::{Alert, NodeRecord, ResourceSample, ServiceObservation, ServiceSpec};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub thresholds: Thresholds,
    /// Services to check; empty means "every replicated service"
    pub services: Vec<ServiceSpec>,
    pub storage_volume: Option<String>,
    pub report_path: Option<PathBuf>,
    pub departure_timeout: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            thresholds: Thresholds {
                memory: config.monitor.memory_threshold,
                disk: config.monitor.disk_threshold,
                memory_critical: config.monitor.memory_critical,
                disk_critical: config.monitor.disk_critical,
            },
            services: config.services.clone(),
            storage_volume: config.monitor.storage_volume.clone(),
            report_path: Some(config.monitor.report_path.clone()),
            departure_timeout: Duration::from_secs(config.monitor.node_departure_timeout_secs),
        }
    }
}

pub struct HealthMonitor {
    control_plane: Arc<dyn ControlPlane>,
    storage: Option<Arc<dyn StorageLayer>>,
    probe: NodeProbe,
    sinks: Vec<Arc<dyn AlertSink>>,
    settings: MonitorSettings,
    tracker: Mutex<NodeTracker>,
}

impl HealthMonitor {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        storage: Option<Arc<dyn StorageLayer>>,
        probe: NodeProbe,
        sinks: Vec<Arc<dyn AlertSink>>,
        settings: MonitorSettings,
    ) -> Self {
        let tracker = Mutex::new(NodeTracker::new(settings.departure_timeout));
        Self {
            control_plane,
            storage,
            probe,
            sinks,
            settings,
            tracker,
        }
    }

    /// Run cycles every `interval` until `stop` is set or a cycle hits a
    /// fatal local error.
    pub async fn run_loop(
        &self,
        interval: Duration,
        budget: Duration,
        stop: watch::Receiver<bool>,
    ) -> Result<u64> {
        run_periodic("monitor", interval, budget, stop, || async {
            match self.run_cycle().await.fatal {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
        .await
    }

    /// Run one monitor cycle, emit its alerts and write the report.
    #[instrument(skip(self), name = "monitor")]
    pub async fn run_cycle(&self) -> HealthReport {
        let mut alerts = Vec::new();
        let mut fatal: Option<ClusterError> = None;

        let reachable = match self.control_plane.ping().await {
            Ok(()) => true,
            Err(e) => {
                alerts.push(network_unreachable(&e));
                if e.is_fatal() {
                    fatal = Some(e);
                }
                false
            }
        };

        let nodes = if reachable {
            self.check_nodes(&mut alerts).await
        } else {
            Section::unavailable("control plane unreachable")
        };
        let services = if reachable {
            self.check_services(&mut alerts).await
        } else {
            Section::unavailable("control plane unreachable")
        };
        let resources = self.check_resources(&mut alerts).await;
        let storage = self.check_storage(&mut alerts, &mut fatal).await;
        if let Some(e) = &fatal {
            error!("Monitor cycle hit a fatal local error: {}", e);
        }

        let report = HealthReport {
            generated_at: Utc::now(),
            hostname: self.probe.hostname().await.unwrap_or_else(|| "unknown".to_string()),
            nodes,
            services,
            resources,
            storage,
            alerts,
            fatal,
        };

        self.emit(&report).await;

        if let Some(path) = &self.settings.report_path {
            match report.write_to(path) {
                Ok(()) => debug!("Health report written to {:?}", path),
                Err(e) => warn!("Failed to write health report to {:?}: {}", path, e),
            }
        }

        info!(
            "Monitor cycle done: {} alert(s), nodes {}, services {}",
            report.alerts.len(),
            report.node_count().map_or("unavailable".to_string(), |n| n.to_string()),
            report.service_count().map_or("unavailable".to_string(), |n| n.to_string()),
        );
        report
    }

    async fn check_nodes(&self, alerts: &mut Vec<Alert>) -> Section<Vec<NodeRecord>> {
        let listing = match self.control_plane.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => return Section::unavailable(format!("list nodes: {}", e)),
        };

        for node in listing.iter().filter(|n| !n.healthy) {
            let status = match &node.id {
                Some(id) => match self.control_plane.inspect_node(id).await {
                    Ok(status) => Some(status),
                    Err(e) => {
                        debug!("Cannot inspect node {}: {}", id, e);
                        None
                    }
                },
                None => None,
            };
            alerts.extend(classify_node(node, status.as_ref()));
        }

        let departed = self.tracker.lock().observe(&listing, Utc::now());
        for node in departed {
            info!("Node {} departed, no heartbeat within timeout", node.label());
        }
        Section::available(listing)
    }

    async fn check_services(&self, alerts: &mut Vec<Alert>) -> Section<Vec<ServiceSummary>> {
        let specs = if self.settings.services.is_empty() {
            let names = match self.control_plane.list_services().await {
                Ok(names) => names,
                Err(e) => return Section::unavailable(format!("list services: {}", e)),
            };
            let mut specs = Vec::new();
            for name in names {
                match self.control_plane.inspect_service(&name).await {
                    Ok(Some(desired)) => specs.push(ServiceSpec::new(name, desired)),
                    Ok(None) => {}
                    Err(e) => debug!("Cannot inspect service {}: {}", name, e),
                }
            }
            specs
        } else {
            self.settings.services.clone()
        };

        let mut summaries = Vec::with_capacity(specs.len());
        for spec in specs {
            let running = match self.control_plane.list_tasks(&spec.name).await {
                Ok(states) => {
                    let running = ServiceObservation::from_tasks(&spec.name, states).running_replicas;
                    alerts.extend(classify_service(&spec.name, running, spec.desired_replicas));
                    Some(running)
                }
                Err(e) => {
                    warn!("Cannot list tasks of {}: {}", spec.name, e);
                    None
                }
            };
            summaries.push(ServiceSummary {
                name: spec.name,
                desired: spec.desired_replicas,
                running,
            });
        }
        Section::available(summaries)
    }

    async fn check_resources(&self, alerts: &mut Vec<Alert>) -> Section<ResourceSample> {
        let sample = self.probe.sample_resources().await;
        if sample.memory_percent.is_none() && sample.disk_percent.is_none() && sample.cpu_percent.is_none() {
            return Section::unavailable("no resource metric readable");
        }
        alerts.extend(classify_resources(&sample, &self.settings.thresholds));
        Section::available(sample)
    }

    async fn check_storage(
        &self,
        alerts: &mut Vec<Alert>,
        fatal: &mut Option<ClusterError>,
    ) -> Section<StorageSummary> {
        let (Some(storage), Some(volume)) = (&self.storage, &self.settings.storage_volume) else {
            return Section::unavailable("no storage volume configured");
        };
        let status = storage.volume_status(volume).await;
        alerts.extend(classify_storage(volume, &status));
        match status {
            Ok(status) => Section::available(StorageSummary {
                volume: volume.clone(),
                status,
            }),
            Err(e) => {
                if e.is_fatal() && fatal.is_none() {
                    *fatal = Some(e.clone());
                }
                Section::unavailable(format!("volume status: {}", e))
            }
        }
    }

    async fn emit(&self, report: &HealthReport) {
        if report.alerts.is_empty() {
            return;
        }
        for sink in &self.sinks {
            if let Err(e) = sink.emit(&report.hostname, &report.alerts).await {
                warn!("Alert sink failed: {}", e);
            }
        }
    }
}
