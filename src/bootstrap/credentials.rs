use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

use crate::api::ApiResponse;
use crate::error::{ClusterError, Result};
use crate::types::{JoinRole, JoinToken};

/// Credential handed out by a manager to a joining node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinGrant {
    pub token: JoinToken,
    /// Manager to join through; may differ from the peer that was asked
    pub manager_address: IpAddr,
    pub role: JoinRole,
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn request_token(&self, peer: IpAddr, role: JoinRole) -> Result<JoinGrant>;
}

/// Fetches join tokens from a peer's token service.
#[derive(Debug, Clone)]
pub struct HttpCredentialSource {
    client: reqwest::Client,
    port: u16,
}

impl HttpCredentialSource {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| ClusterError::Http(e.to_string()))?;
        Ok(Self { client, port })
    }

    fn url(&self, peer: IpAddr, role: JoinRole) -> String {
        let host = match peer {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{}]", v6),
        };
        format!("http://{}:{}/v1/join-token?role={}", host, self.port, role)
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn request_token(&self, peer: IpAddr, role: JoinRole) -> Result<JoinGrant> {
        let url = self.url(peer, role);
        debug!("Requesting {} token from {}", role, url);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            status if status.is_success() => {
                let body: ApiResponse<JoinGrant> = response.json().await?;
                let Some(grant) = body.data else {
                    return Err(ClusterError::Http(format!(
                        "{} returned no grant: {}",
                        peer,
                        body.error.unwrap_or_default()
                    )));
                };
                if grant.token.is_empty() {
                    return Err(ClusterError::rejected(format!("{} returned an empty token", peer)));
                }
                Ok(grant)
            }
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                let reason = response
                    .json::<ApiResponse<JoinGrant>>()
                    .await
                    .ok()
                    .and_then(|body| body.error)
                    .unwrap_or_else(|| "forbidden".to_string());
                Err(ClusterError::rejected(format!("{} refused token request: {}", peer, reason)))
            }
            status if status.is_server_error() => Err(ClusterError::transient(format!(
                "{} token service error {}",
                peer, status
            ))),
            status => Err(ClusterError::Http(format!("{} answered {}", peer, status))),
        }
    }
}
