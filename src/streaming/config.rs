//! Streaming configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Tunables for one streamed octree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Maximum number of node loads in flight. Default 4.
    pub max_nodes_loading: usize,
    /// Resident payload budget in megabytes, used for pressure reporting.
    pub memory_budget_mb: usize,
    /// Digits per hierarchy chunk when the metadata does not say. Default 5.
    pub default_hierarchy_step_size: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_nodes_loading: 4,
            memory_budget_mb: 512,
            default_hierarchy_step_size: 5,
        }
    }
}

impl StreamingConfig {
    /// Reject settings that would stall every load
    pub fn validate(&self) -> Result<()> {
        if self.max_nodes_loading == 0 {
            return Err(Error::Config("max_nodes_loading must be at least 1".into()));
        }
        if self.default_hierarchy_step_size == 0 {
            return Err(Error::Config("default_hierarchy_step_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file (sync); missing fields take their defaults
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}
