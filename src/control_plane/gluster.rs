use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::StorageLayer;
use crate::command::CommandRunner;
use crate::error::{ClusterError, Result};
use crate::types::VolumeStatus;

/// GlusterFS through the `gluster` CLI.
#[derive(Clone)]
pub struct GlusterCli {
    runner: Arc<dyn CommandRunner>,
    gluster: String,
    mount: String,
}

impl GlusterCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            gluster: "gluster".to_string(),
            mount: "mount".to_string(),
        }
    }

    pub fn with_binaries(mut self, gluster: impl Into<String>, mount: impl Into<String>) -> Self {
        self.gluster = gluster.into();
        self.mount = mount.into();
        self
    }

    async fn gluster(&self, args: &[&str]) -> Result<String> {
        let output = self.runner.run(&self.gluster, args).await?;
        if output.is_success() {
            Ok(output.stdout)
        } else {
            Err(ClusterError::storage(format!(
                "gluster {}: {}",
                args.join(" "),
                output.diagnostic()
            )))
        }
    }
}

/// Classify `gluster volume status` output by the Online column of its
/// brick rows.
pub fn parse_volume_status(output: &str) -> VolumeStatus {
    let online: Vec<bool> = output
        .lines()
        .filter(|line| line.trim_start().starts_with("Brick"))
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.len().checked_sub(2).map(|i| cols[i]) {
                Some("Y") => Some(true),
                Some("N") => Some(false),
                _ => None,
            }
        })
        .collect();

    if online.is_empty() || online.iter().all(|up| !up) {
        VolumeStatus::Offline
    } else if online.iter().all(|up| *up) {
        VolumeStatus::Online
    } else {
        VolumeStatus::Degraded
    }
}

#[async_trait]
impl StorageLayer for GlusterCli {
    async fn volume_status(&self, name: &str) -> Result<VolumeStatus> {
        match self.gluster(&["volume", "status", name]).await {
            Ok(out) => Ok(parse_volume_status(&out)),
            Err(e) if e.to_string().contains("does not exist") => {
                warn!("Volume {} does not exist", name);
                Ok(VolumeStatus::Offline)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_volume(&self, name: &str, bricks: &[String]) -> Result<()> {
        if bricks.is_empty() {
            return Err(ClusterError::storage(format!("volume {} needs at least one brick", name)));
        }
        let mut args = vec!["volume", "create", name];
        args.extend(bricks.iter().map(String::as_str));
        args.push("force");

        if let Err(e) = self.gluster(&args).await {
            if !e.to_string().contains("already exists") {
                return Err(e);
            }
        }
        if let Err(e) = self.gluster(&["volume", "start", name]).await {
            if !e.to_string().contains("already started") {
                return Err(e);
            }
        }
        info!("Storage volume {} ready on {} brick(s)", name, bricks.len());
        Ok(())
    }

    async fn mount(&self, name: &str, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        let source = format!("localhost:/{}", name);
        let target = path.to_string_lossy();
        let output = self
            .runner
            .run(&self.mount, &["-t", "glusterfs", &source, &target])
            .await?;
        if output.is_success() || output.diagnostic().contains("already mounted") {
            Ok(())
        } else {
            Err(ClusterError::storage(format!("mount {}: {}", source, output.diagnostic())))
        }
    }
}
