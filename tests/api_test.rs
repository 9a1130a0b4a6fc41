mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use std::future::IntoFuture;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use common::*;
use swarmkeeper::api::{router, ApiResponse, ApiState};
use swarmkeeper::bootstrap::{CredentialSource, HttpCredentialSource, JoinGrant};
use swarmkeeper::control_plane::SwarmState;
use swarmkeeper::types::{ClusterMembership, JoinRole, JoinToken, MembershipState};

fn state(harness: &Harness) -> ApiState {
    ApiState {
        control_plane: harness.control_plane.clone(),
        store: harness.store(),
        report_path: harness.dir.path().join("health-report.json"),
        advertise_address: Some(ip(LOCAL)),
        allow_manager_join: false,
    }
}

fn manager_join_state(harness: &Harness) -> ApiState {
    ApiState {
        allow_manager_join: true,
        ..state(harness)
    }
}

async fn get<T: DeserializeOwned>(state: ApiState, uri: &str) -> (StatusCode, ApiResponse<T>) {
    let response = router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[test_log::test(tokio::test)]
async fn test_manager_issues_join_token() {
    let harness = Harness::new(FakeControlPlane::manager());

    let (status, body) = get::<JoinGrant>(manager_join_state(&harness), "/v1/join-token?role=manager").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.success);
    let grant = body.data.unwrap();
    assert_eq!(grant.role, JoinRole::Manager);
    assert_eq!(grant.manager_address, ip(LOCAL));
    assert_eq!(grant.token.expose(), "SWMTKN-1-manager");
}

#[test_log::test(tokio::test)]
async fn test_manager_tokens_disabled_by_default() {
    let harness = Harness::new(FakeControlPlane::manager());

    let (status, body) = get::<JoinGrant>(state(&harness), "/v1/join-token?role=manager").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(!body.success);
    assert!(harness.control_plane.calls_matching("token").is_empty());

    let (status, body) = get::<JoinGrant>(state(&harness), "/v1/join-token?role=worker").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.data.unwrap().role, JoinRole::Worker);
}

#[test_log::test(tokio::test)]
async fn test_worker_refuses_join_token() {
    let harness = Harness::new(FakeControlPlane::not_joined());
    harness.control_plane.set_state(SwarmState::Active, false, Some(ip(9)));

    let (status, body) = get::<JoinGrant>(state(&harness), "/v1/join-token").await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(!body.success);
    assert!(body.data.is_none());
    assert!(harness.control_plane.calls_matching("token").is_empty());
}

#[test_log::test(tokio::test)]
async fn test_join_token_unavailable_without_control_plane() {
    let harness = Harness::new(FakeControlPlane::manager());
    harness.control_plane.go_down();

    let (status, _) = get::<JoinGrant>(state(&harness), "/v1/join-token").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[test_log::test(tokio::test)]
async fn test_membership_hides_token() {
    let harness = Harness::new(FakeControlPlane::manager());
    let mut membership = ClusterMembership::default();
    membership
        .establish(
            JoinRole::Manager,
            ip(LOCAL),
            Some(JoinToken::new("SWMTKN-1-secret")),
            chrono::Utc::now(),
        )
        .unwrap();
    harness.store().save(&membership).unwrap();

    let (status, body) = get::<ClusterMembership>(state(&harness), "/v1/membership").await;

    assert_eq!(status, StatusCode::OK);
    let served = body.data.unwrap();
    assert_eq!(served.state, MembershipState::Manager);
    assert!(served.join_token.is_none());
}

#[test_log::test(tokio::test)]
async fn test_health_not_found_before_first_cycle() {
    let harness = Harness::new(FakeControlPlane::manager());

    let (status, body) = get::<serde_json::Value>(state(&harness), "/v1/health").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!body.success);
}

#[test_log::test(tokio::test)]
async fn test_health_serves_latest_report() {
    let harness = Harness::new(FakeControlPlane::manager());
    harness.resources.set(Some(40.0), Some(95.0));
    harness.monitor(Vec::new(), None).run_cycle().await;

    let (status, body) = get::<swarmkeeper::HealthReport>(state(&harness), "/v1/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.data.unwrap().alerts.len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_credential_client_against_token_service() {
    let manager = Harness::new(FakeControlPlane::manager());
    let worker = Harness::new(FakeControlPlane::not_joined());
    worker.control_plane.set_state(SwarmState::Active, false, Some(ip(LOCAL)));

    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let manager_listener = tokio::net::TcpListener::bind((localhost, 0)).await.unwrap();
    let worker_listener = tokio::net::TcpListener::bind((localhost, 0)).await.unwrap();
    let manager_port = manager_listener.local_addr().unwrap().port();
    let worker_port = worker_listener.local_addr().unwrap().port();
    tokio::spawn(axum::serve(manager_listener, router(state(&manager))).into_future());
    tokio::spawn(axum::serve(worker_listener, router(state(&worker))).into_future());

    let client = HttpCredentialSource::new(manager_port, Duration::from_secs(5)).unwrap();
    let grant = client.request_token(localhost, JoinRole::Worker).await.unwrap();
    assert_eq!(grant.role, JoinRole::Worker);
    assert_eq!(grant.manager_address, ip(LOCAL));

    let client: Arc<dyn CredentialSource> =
        Arc::new(HttpCredentialSource::new(worker_port, Duration::from_secs(5)).unwrap());
    let err = client.request_token(localhost, JoinRole::Worker).await.unwrap_err();
    assert!(err.is_policy_rejection());
}
