//! Application configuration management.
//!
//! Remote endpoint, application origin, offline-cache manifest, and the last
//! signed-in email. Stored at `~/.config/finsync/config.json`.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/data/cache directory paths
const APP_NAME: &str = "finsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the remote document store.
    pub remote_url: String,
    /// Origin used to classify responses for the offline cache.
    pub app_origin: String,
    /// URL of the application shell served when the network is down.
    pub entry_point: String,
    /// Offline cache version tag. Bumping it is the only cache invalidation.
    pub cache_version: String,
    /// Resources fetched during cache install.
    pub manifest: Vec<String>,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_url: "https://api.finsync.example".to_string(),
            app_origin: "https://app.finsync.example".to_string(),
            entry_point: "https://app.finsync.example/index.html".to_string(),
            cache_version: "v1".to_string(),
            manifest: Vec::new(),
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the per-dataset JSON files and the session file.
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir =
            dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Root under which offline cache versions live.
    pub fn cache_dir() -> Result<PathBuf> {
        let cache_dir =
            dirs::cache_dir().ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}
