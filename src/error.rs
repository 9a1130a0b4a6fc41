use std::io;
use thiserror::Error;

/// Errors raised by the cluster lifecycle components.
///
/// Variants map onto four handling classes: transient failures are retried
/// by the next cycle, policy rejections are never retried against the same
/// target, local precondition failures end the process, and everything else
/// is isolated to the item that produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// Network timeout or a dependency that is momentarily unreachable
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Operation timed out after {0:?}: {1}")]
    Timeout(std::time::Duration, String),

    /// Join token invalid, permission denied or a similar refusal
    #[error("Rejected by policy: {0}")]
    PolicyRejected(String),

    #[error("No usable non-loopback network address")]
    NoAddress,

    #[error("Local precondition failed: {0}")]
    Precondition(String),

    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Invalid membership transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Control error: {0}")]
    Control(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    pub fn transient(msg: impl Into<String>) -> Self {
        ClusterError::Transient(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        ClusterError::PolicyRejected(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        ClusterError::Precondition(msg.into())
    }

    pub fn control_plane(msg: impl Into<String>) -> Self {
        ClusterError::ControlPlane(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        ClusterError::Storage(msg.into())
    }

    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        ClusterError::Command {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Failures the next cycle may recover from on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Transient(_)
                | ClusterError::Timeout(..)
                | ClusterError::ControlPlane(_)
                | ClusterError::Http(_)
                | ClusterError::Command { .. }
                | ClusterError::Discovery(_)
                | ClusterError::Storage(_)
        )
    }

    pub fn is_policy_rejection(&self) -> bool {
        matches!(self, ClusterError::PolicyRejected(_))
    }

    /// Local precondition failures end the process instance.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::NoAddress | ClusterError::Precondition(_) | ClusterError::Config(_)
        )
    }

    /// Process exit code for a one-shot invocation that ended with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ClusterError::NoAddress | ClusterError::Precondition(_) => 2,
            ClusterError::Config(_) => 3,
            _ => 1,
        }
    }
}

impl From<io::Error> for ClusterError {
    fn from(e: io::Error) -> Self {
        ClusterError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for ClusterError {
    fn from(e: serde_yaml::Error) -> Self {
        ClusterError::Yaml(e.to_string())
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ClusterError::Transient(e.to_string())
        } else {
            ClusterError::Http(e.to_string())
        }
    }
}

impl From<mdns_sd::Error> for ClusterError {
    fn from(e: mdns_sd::Error) -> Self {
        ClusterError::Discovery(e.to_string())
    }
}

impl From<ctrlc::Error> for ClusterError {
    fn from(e: ctrlc::Error) -> Self {
        ClusterError::Control(e.to_string())
    }
}
