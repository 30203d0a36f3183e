//! Persisted server list
//!
//! A plain JSON file in the user's config directory, written `0600`
//! since it may sit next to credentials the UI chooses to store.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use wiresocket_core::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Default location: `<config_dir>/wiresocket/servers.json`.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("wiresocket")
        .join("servers.json")
}

pub fn load(path: &Path) -> Result<Vec<ServerEntry>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|e| CoreError::InvalidConfig(format!("corrupt server list: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

pub fn save(path: &Path, servers: &[ServerEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(servers)
        .map_err(|e| CoreError::Internal(format!("server list encode failed: {e}")))?;
    std::fs::write(path, raw)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        let servers = vec![ServerEntry {
            name: "Hong Kong 1".into(),
            address: "hk-01.example.com:8080".into(),
            username: Some("alice".into()),
        }];
        save(&path, &servers).unwrap();
        assert_eq!(load(&path).unwrap(), servers);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent.json")).unwrap().is_empty());
    }
}
