mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use swarmkeeper::control_plane::{DockerCli, SwarmState};
use swarmkeeper::error::ClusterError;
use swarmkeeper::monitor::HealthReport;
use swarmkeeper::types::{AlertKind, Severity, ServiceSpec, VolumeStatus};

fn kinds(report: &HealthReport) -> Vec<AlertKind> {
    report.alerts.iter().map(|a| a.kind).collect()
}

#[test_log::test(tokio::test)]
async fn test_disk_over_threshold_raises_disk_pressure() {
    let harness = Harness::new(FakeControlPlane::manager());
    harness.resources.set(Some(40.0), Some(95.0));

    let report = harness.monitor(Vec::new(), None).run_cycle().await;

    assert_eq!(kinds(&report), vec![AlertKind::DiskPressure]);
    assert_eq!(report.alerts[0].severity, Severity::Critical);
    let batches = harness.sink.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_healthy_node_raises_nothing() {
    let harness = Harness::new(FakeControlPlane::manager());
    harness
        .control_plane
        .nodes
        .lock()
        .unwrap()
        .replace(vec![node("a", 1, true), node("b", 2, true)]);

    let report = harness.monitor(Vec::new(), None).run_cycle().await;

    assert!(report.alerts.is_empty());
    assert!(harness.sink.batches.lock().unwrap().is_empty());
    assert_eq!(report.node_count(), Some(2));
}

#[test_log::test(tokio::test)]
async fn test_failed_service_query_leaves_other_sections() {
    let harness = Harness::new(FakeControlPlane::manager());
    harness
        .control_plane
        .nodes
        .lock()
        .unwrap()
        .replace(vec![node("a", 1, true), node("b", 2, false)]);
    *harness.control_plane.services.lock().unwrap() = None;

    let report = harness.monitor(Vec::new(), None).run_cycle().await;

    assert!(report.nodes.is_available());
    assert!(!report.services.is_available());
    assert!(report.resources.is_available());
    assert_eq!(report.node_count(), Some(2));
    assert_eq!(report.service_count(), None);

    let down: Vec<_> = report
        .alerts
        .iter()
        .filter(|a| a.kind == AlertKind::NodeDown)
        .collect();
    assert_eq!(down.len(), 1);
    assert!(down[0].detail.contains("host-b"));
    assert!(down[0].detail.contains("heartbeat failure"));
}

#[test_log::test(tokio::test)]
async fn test_under_replicated_service_severity() {
    let harness = Harness::new(FakeControlPlane::manager());
    harness.control_plane.with_service("web", 3, 1);
    harness.control_plane.with_service("worker", 2, 0);
    harness.control_plane.with_service("db", 1, 1);

    let report = harness
        .monitor(
            vec![
                ServiceSpec::new("web", 3),
                ServiceSpec::new("worker", 2),
                ServiceSpec::new("db", 1),
            ],
            None,
        )
        .run_cycle()
        .await;

    let severities: Vec<_> = report
        .alerts
        .iter()
        .filter(|a| a.kind == AlertKind::ServiceUnderReplicated)
        .map(|a| a.severity)
        .collect();
    assert_eq!(severities, vec![Severity::Warning, Severity::Critical]);
    assert_eq!(report.service_count(), Some(3));
}

#[test_log::test(tokio::test)]
async fn test_unreachable_control_plane_raises_network_alert() {
    let harness = Harness::new(FakeControlPlane::manager());
    harness.control_plane.go_down();

    let report = harness.monitor(Vec::new(), None).run_cycle().await;

    assert_eq!(kinds(&report), vec![AlertKind::NetworkUnreachable]);
    assert!(!report.nodes.is_available());
    assert!(!report.services.is_available());
    assert!(report.resources.is_available());
}

#[test_log::test(tokio::test)]
async fn test_storage_status_alerts() {
    let harness = Harness::new(FakeControlPlane::manager());
    let monitor = harness.monitor(Vec::new(), Some("shared"));

    let report = monitor.run_cycle().await;
    assert!(report.alerts.is_empty());
    assert!(report.storage.is_available());

    *harness.storage.status.lock().unwrap() = Ok(VolumeStatus::Degraded);
    let report = monitor.run_cycle().await;
    assert_eq!(kinds(&report), vec![AlertKind::StorageDegraded]);
    assert_eq!(report.alerts[0].severity, Severity::Warning);

    *harness.storage.status.lock().unwrap() = Err(ClusterError::storage("glusterd not running"));
    let report = monitor.run_cycle().await;
    assert_eq!(kinds(&report), vec![AlertKind::StorageDegraded]);
    assert!(!report.storage.is_available());
}

#[test_log::test(tokio::test)]
async fn test_report_written_and_readable() {
    let harness = Harness::new(FakeControlPlane::manager());
    harness
        .control_plane
        .nodes
        .lock()
        .unwrap()
        .replace(vec![node("a", 1, true), node("b", 2, false)]);
    harness.control_plane.with_service("web", 2, 2);
    harness.resources.set(Some(93.0), Some(50.0));

    let report = harness.monitor(Vec::new(), None).run_cycle().await;
    let read = HealthReport::read_from(&harness.dir.path().join("health-report.json")).unwrap();

    assert_eq!(read.node_count(), Some(2));
    assert_eq!(read.service_count(), Some(1));
    assert_eq!(read.alerts, report.alerts);
    assert_eq!(
        kinds(&read),
        vec![AlertKind::NodeDown, AlertKind::MemoryPressure]
    );
}

#[test_log::test(tokio::test)]
async fn test_worker_node_still_reports_local_sections() {
    let harness = Harness::new(FakeControlPlane::not_joined());
    harness.control_plane.set_state(SwarmState::Active, false, Some(ip(9)));
    *harness.control_plane.nodes.lock().unwrap() = None;
    *harness.control_plane.services.lock().unwrap() = None;

    let report = harness.monitor(Vec::new(), None).run_cycle().await;

    assert!(!report.nodes.is_available());
    assert!(!report.services.is_available());
    assert!(report.resources.is_available());
    assert!(report.alerts.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_daemon_loop_exits_when_tool_missing() {
    let harness = Harness::new(FakeControlPlane::manager());
    let docker = Arc::new(DockerCli::new(Arc::new(MissingTools::default())));
    let monitor = harness.monitor_with(docker, Vec::new(), None);

    let report = monitor.run_cycle().await;
    assert_eq!(kinds(&report), vec![AlertKind::NetworkUnreachable]);
    assert!(report.fatal.as_ref().is_some_and(|e| e.is_fatal()));

    let (_stop_tx, stop) = watch::channel(false);
    let err = tokio::time::timeout(
        Duration::from_secs(10),
        monitor.run_loop(Duration::from_secs(3600), Duration::from_secs(60), stop),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert_eq!(err.exit_code(), 2);
}
