//! Configuration Storage
//!
//! Reads the provisioning configuration from a JSON file and resolves
//! `~`-prefixed local paths.

use std::path::{Path, PathBuf};
use tokio::fs;

use super::types::ProvisionConfig;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Expand a leading `~` to the current user's home directory
pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Load a provisioning configuration file
///
/// Missing fields take their defaults; a missing file is an error because
/// the caller named it explicitly.
pub async fn load_config(path: &Path) -> Result<ProvisionConfig, StorageError> {
    let contents = fs::read_to_string(path)
        .await
        .map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let config = serde_json::from_str::<ProvisionConfig>(&contents).map_err(|source| {
        StorageError::Json {
            path: path.to_path_buf(),
            source,
        }
    })?;

    tracing::debug!("Loaded provisioning config from {:?}", path);
    Ok(config)
}
