use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bootstrap::{read_json, write_json_atomic};
use crate::error::Result;

/// Service descriptor version most recently rolled out by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub last_applied_version: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct DeploymentStore {
    path: PathBuf,
}

impl DeploymentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<DeploymentState>> {
        read_json(&self.path)
    }

    pub fn record(&self, version: &str) -> Result<()> {
        write_json_atomic(
            &self.path,
            &DeploymentState {
                last_applied_version: Some(version.to_string()),
                applied_at: Some(Utc::now()),
            },
        )
    }
}
