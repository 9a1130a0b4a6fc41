//! Cluster Membership Types
//!
//! Core types for cluster membership:
//! - Node identification and roles
//! - Local membership state and its transitions
//! - Join credentials

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::error::{ClusterError, Result};

/// Node roles as observed in the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Role not yet resolved
    #[default]
    Unknown,
    /// Manager nodes hold control-plane state
    Manager,
    /// Worker nodes run tasks only
    Worker,
    /// Discovered peer whose membership is not yet confirmed
    Candidate,
}

/// A node known to this process, either discovered or listed by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Control-plane node identifier, absent for discovered candidates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub address: IpAddr,
    pub role: NodeRole,
    pub last_seen_at: DateTime<Utc>,
    pub healthy: bool,
}

impl NodeRecord {
    /// Record for a peer found by discovery.
    pub fn candidate(address: IpAddr) -> Self {
        Self {
            id: None,
            hostname: None,
            address,
            role: NodeRole::Candidate,
            last_seen_at: Utc::now(),
            healthy: true,
        }
    }

    /// Name used in logs and alert details.
    pub fn label(&self) -> String {
        match (&self.hostname, &self.id) {
            (Some(host), _) => format!("{} ({})", host, self.address),
            (None, Some(id)) => format!("{} ({})", id, self.address),
            (None, None) => self.address.to_string(),
        }
    }
}

/// Detailed status of a single node as reported by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Role requested when joining through a peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinRole {
    Manager,
    #[default]
    Worker,
}

impl JoinRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinRole::Manager => "manager",
            JoinRole::Worker => "worker",
        }
    }
}

impl fmt::Display for JoinRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JoinRole {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "manager" => Ok(JoinRole::Manager),
            "worker" => Ok(JoinRole::Worker),
            other => Err(ClusterError::Config(format!("Invalid join role: {}", other))),
        }
    }
}

/// Short-lived credential proving authorization to join in a given role.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JoinToken(String);

impl JoinToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JoinToken(<redacted>)")
    }
}

/// Membership state of the local node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipState {
    #[default]
    NotJoined,
    Joining,
    Manager,
    Worker,
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MembershipState::NotJoined => "not_joined",
            MembershipState::Joining => "joining",
            MembershipState::Manager => "manager",
            MembershipState::Worker => "worker",
        };
        f.write_str(s)
    }
}

impl From<JoinRole> for MembershipState {
    fn from(role: JoinRole) -> Self {
        match role {
            JoinRole::Manager => MembershipState::Manager,
            JoinRole::Worker => MembershipState::Worker,
        }
    }
}

/// The local node's cluster membership.
///
/// Only the bootstrap coordinator mutates this record. A node moves into
/// `Manager` or `Worker` at most once; leaving that state requires an
/// explicit [`ClusterMembership::reset`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMembership {
    pub state: MembershipState,
    #[serde(default)]
    pub manager_address: Option<IpAddr>,
    #[serde(default)]
    pub join_token: Option<JoinToken>,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
    /// Digest of the service descriptor in force when membership was established
    #[serde(default)]
    pub last_applied_version: Option<String>,
    /// Set when the control plane could not be asked; `state` is then a guess
    #[serde(skip)]
    pub unknown: bool,
}

impl ClusterMembership {
    /// Membership reported when the control plane cannot be reached.
    pub fn unknown() -> Self {
        Self {
            unknown: true,
            ..Self::default()
        }
    }

    pub fn is_member(&self) -> bool {
        matches!(self.state, MembershipState::Manager | MembershipState::Worker)
    }

    pub fn begin_join(&mut self) -> Result<()> {
        match self.state {
            MembershipState::NotJoined | MembershipState::Joining => {
                self.state = MembershipState::Joining;
                Ok(())
            }
            other => Err(ClusterError::InvalidTransition(format!(
                "cannot start joining while {}",
                other
            ))),
        }
    }

    /// Enter `Manager` or `Worker`. Refused when already a member.
    pub fn establish(
        &mut self,
        role: JoinRole,
        manager_address: IpAddr,
        token: Option<JoinToken>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if self.is_member() {
            return Err(ClusterError::InvalidTransition(format!(
                "already {}; reset before becoming {}",
                self.state, role
            )));
        }
        self.state = role.into();
        self.manager_address = Some(manager_address);
        self.join_token = token;
        self.joined_at = Some(at);
        self.unknown = false;
        Ok(())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn test_single_transition_until_reset() {
        let mut membership = ClusterMembership::default();
        membership.begin_join().unwrap();
        membership
            .establish(JoinRole::Worker, addr(), None, Utc::now())
            .unwrap();
        assert_eq!(membership.state, MembershipState::Worker);

        let err = membership
            .establish(JoinRole::Manager, addr(), None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidTransition(_)));
        assert_eq!(membership.state, MembershipState::Worker);
        assert!(membership.begin_join().is_err());

        membership.reset();
        assert_eq!(membership.state, MembershipState::NotJoined);
        membership
            .establish(JoinRole::Manager, addr(), None, Utc::now())
            .unwrap();
        assert_eq!(membership.state, MembershipState::Manager);
    }

    #[test]
    fn test_token_is_redacted() {
        let token = JoinToken::new("SWMTKN-1-secret");
        assert_eq!(format!("{:?}", token), "JoinToken(<redacted>)");
        assert_eq!(token.expose(), "SWMTKN-1-secret");
    }

    #[test]
    fn test_unknown_flag_not_persisted() {
        let membership = ClusterMembership::unknown();
        let json = serde_json::to_string(&membership).unwrap();
        let parsed: ClusterMembership = serde_json::from_str(&json).unwrap();
        assert!(membership.unknown);
        assert!(!parsed.unknown);
        assert_eq!(parsed.state, MembershipState::NotJoined);
    }

    #[test]
    fn test_enum_defaults() {
        assert_eq!(NodeRole::default(), NodeRole::Unknown);
        assert_eq!(JoinRole::default(), JoinRole::Worker);
        assert_eq!(MembershipState::default(), MembershipState::NotJoined);
    }

    #[test]
    fn test_join_role_parse() {
        assert_eq!("Manager".parse::<JoinRole>().unwrap(), JoinRole::Manager);
        assert!("observer".parse::<JoinRole>().is_err());
    }
}
