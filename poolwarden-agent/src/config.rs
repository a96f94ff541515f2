//! Agent configuration
//!
//! TOML file in the OS configuration directory
//! (`~/.config/poolwarden-agent/config.toml` on Linux), every field
//! overridable from the command line.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub kernel_url: String,
    pub api_key: String,
    /// Sent as `x-remote-user`.
    pub principal: String,
    pub poll_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kernel_url: "http://127.0.0.1:8080".to_string(),
            api_key: String::new(),
            principal: std::env::var("USER").unwrap_or_default(),
            poll_interval_secs: 60,
        }
    }
}

impl AgentConfig {
    /// Load from `path`, or from the OS location. A missing file yields defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file_path()?,
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("poolwarden-agent");
        path.push("config.toml");
        Ok(path)
    }
}
