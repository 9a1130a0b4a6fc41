//! Join-token service.
//!
//! Served by every node on the well-known service port. Only managers hand
//! out tokens; other nodes answer 403 so a joining peer moves on to the
//! next candidate. Manager-role tokens are refused unless the node opts in.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, Level};

use crate::bootstrap::{JoinGrant, MembershipStore};
use crate::control_plane::ControlPlane;
use crate::error::{ClusterError, Result};
use crate::monitor::HealthReport;
use crate::types::{ClusterMembership, JoinRole};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

fn reply<T: Serialize>(status: StatusCode, body: ApiResponse<T>) -> Response {
    (status, Json(body)).into_response()
}

#[derive(Clone)]
pub struct ApiState {
    pub control_plane: Arc<dyn ControlPlane>,
    pub store: MembershipStore,
    pub report_path: PathBuf,
    /// Address handed to joiners when the control plane does not report one
    pub advertise_address: Option<IpAddr>,
    pub allow_manager_join: bool,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub role: Option<JoinRole>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/join-token", get(join_token))
        .route("/v1/health", get(health))
        .route("/v1/membership", get(membership))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
}

async fn join_token(State(state): State<ApiState>, Query(query): Query<TokenQuery>) -> Response {
    let role = query.role.unwrap_or_default();
    if role == JoinRole::Manager && !state.allow_manager_join {
        return reply::<JoinGrant>(
            StatusCode::FORBIDDEN,
            ApiResponse::err("manager join tokens are disabled on this node"),
        );
    }

    let local = match state.control_plane.local_state().await {
        Ok(local) => local,
        Err(e) => {
            return reply::<JoinGrant>(
                StatusCode::SERVICE_UNAVAILABLE,
                ApiResponse::err(format!("control plane unavailable: {}", e)),
            )
        }
    };
    if !local.is_manager {
        return reply::<JoinGrant>(StatusCode::FORBIDDEN, ApiResponse::err("not a manager"));
    }
    let Some(manager_address) = local.manager_address.or(state.advertise_address) else {
        return reply::<JoinGrant>(
            StatusCode::SERVICE_UNAVAILABLE,
            ApiResponse::err("manager address unknown"),
        );
    };

    match state.control_plane.issue_join_token(role).await {
        Ok(token) => {
            info!("Issued {} join token", role);
            reply(
                StatusCode::OK,
                ApiResponse::ok(JoinGrant {
                    token,
                    manager_address,
                    role,
                }),
            )
        }
        Err(e) if e.is_policy_rejection() => {
            reply::<JoinGrant>(StatusCode::FORBIDDEN, ApiResponse::err(e.to_string()))
        }
        Err(e) => reply::<JoinGrant>(StatusCode::SERVICE_UNAVAILABLE, ApiResponse::err(e.to_string())),
    }
}

async fn health(State(state): State<ApiState>) -> Response {
    match HealthReport::read_from(&state.report_path) {
        Ok(report) => reply(StatusCode::OK, ApiResponse::ok(report)),
        Err(e) => reply::<HealthReport>(StatusCode::NOT_FOUND, ApiResponse::err(e.to_string())),
    }
}

async fn membership(State(state): State<ApiState>) -> Response {
    match state.store.load() {
        Ok(mut membership) => {
            membership.join_token = None;
            reply(StatusCode::OK, ApiResponse::ok(membership))
        }
        Err(e) => reply::<ClusterMembership>(StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::err(e.to_string())),
    }
}

/// Serve until `stop` flips to `true`.
pub async fn serve(addr: SocketAddr, state: ApiState, mut stop: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ClusterError::precondition(format!("cannot bind token service on {}: {}", addr, e)))?;
    info!("Token service listening on {}", addr);

    let shutdown = async move {
        while !*stop.borrow() {
            if stop.changed().await.is_err() {
                break;
            }
        }
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!("Token service error: {}", e);
            ClusterError::Io(e.to_string())
        })?;
    info!("Token service stopped");
    Ok(())
}
