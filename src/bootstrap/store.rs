use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::types::ClusterMembership;

/// Write `value` as pretty JSON through a sibling temp file and rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_json(path, value, false)
}

/// Like [`write_json_atomic`], readable by the owner only.
pub(crate) fn write_private_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_json(path, value, true)
}

fn write_json<T: Serialize>(path: &Path, value: &T, private: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let temp_path = path.with_extension("tmp");
    // The mode only applies when the file is created
    let _ = fs::remove_file(&temp_path);

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if private {
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read JSON from `path`; a missing file yields `None`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ClusterError::from(e)),
    }
}

/// Locally persisted membership record.
#[derive(Debug, Clone)]
pub struct MembershipStore {
    path: PathBuf,
}

impl MembershipStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persisted membership, or `NotJoined` when nothing was saved yet.
    pub fn load(&self) -> Result<ClusterMembership> {
        let membership = read_json(&self.path)?.unwrap_or_default();
        debug!("Loaded membership from {:?}", self.path);
        Ok(membership)
    }

    /// Saved owner-only, since the record carries the join token.
    pub fn save(&self, membership: &ClusterMembership) -> Result<()> {
        write_private_json_atomic(&self.path, membership)
    }

    /// Persist `NotJoined`, permitting a new membership transition.
    pub fn reset(&self) -> Result<ClusterMembership> {
        let membership = ClusterMembership::default();
        self.save(&membership)?;
        Ok(membership)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JoinRole, JoinToken, MembershipState};
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_missing_file_is_not_joined() {
        let dir = tempfile::tempdir().unwrap();
        let store = MembershipStore::new(dir.path().join("membership.json"));
        assert_eq!(store.load().unwrap().state, MembershipState::NotJoined);
    }

    #[test]
    fn test_save_load_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = MembershipStore::new(dir.path().join("state").join("membership.json"));

        let mut membership = ClusterMembership::default();
        membership
            .establish(
                JoinRole::Worker,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                Some(JoinToken::new("SWMTKN-1-abc")),
                Utc::now(),
            )
            .unwrap();
        membership.last_applied_version = Some("v1".into());
        store.save(&membership).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, membership);
        assert!(!store.path().with_extension("tmp").exists());

        store.reset().unwrap();
        assert_eq!(store.load().unwrap().state, MembershipState::NotJoined);
    }

    #[cfg(unix)]
    #[test]
    fn test_membership_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("membership.json");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let store = MembershipStore::new(&path);
        let mut membership = ClusterMembership::default();
        membership
            .establish(
                JoinRole::Manager,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                Some(JoinToken::new("SWMTKN-1-secret")),
                Utc::now(),
            )
            .unwrap();
        store.save(&membership).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(store.load().unwrap().join_token.unwrap().expose(), "SWMTKN-1-secret");
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("membership.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(MembershipStore::new(path).load(), Err(ClusterError::Json(_))));
    }
}
