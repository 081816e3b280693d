use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use procpool_core::{Charset, PoolSettings};

/// `charset = "latin1" | "utf8-lossy"` in the `[pool]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CharsetSetting {
    Latin1,
    Utf8Lossy,
}

impl Default for CharsetSetting {
    fn default() -> Self {
        Self::Latin1
    }
}

impl From<CharsetSetting> for Charset {
    fn from(value: CharsetSetting) -> Self {
        match value {
            CharsetSetting::Latin1 => Charset::Latin1,
            CharsetSetting::Utf8Lossy => Charset::Utf8Lossy,
        }
    }
}

/// The `[pool]` table of a pool config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfigSection {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub reserve_size: usize,
    pub keep_alive_ms: u64,
    pub verbose: bool,
    pub charset: CharsetSetting,
}

impl Default for PoolConfigSection {
    fn default() -> Self {
        Self {
            min_pool_size: 0,
            max_pool_size: 1,
            reserve_size: 0,
            keep_alive_ms: 0,
            verbose: false,
            charset: CharsetSetting::default(),
        }
    }
}

/// Top-level shape of a pool config TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub pool: PoolConfigSection,
}

impl PoolConfig {
    /// Parse a TOML document already read into memory.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse pool config TOML")
    }

    /// Load from a path. Returns `Ok(None)` if the file does not exist, so
    /// callers can fall back to [`PoolSettings::default`] without treating a
    /// missing config as an error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(Self::from_toml_str(&content)?))
    }

    /// Save to a path, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).context("failed to serialize pool config")?;
        std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Convert into the validated settings `procpool-core` expects. Callers
    /// should still call [`PoolSettings::validate`] -- this conversion is
    /// purely mechanical.
    pub fn to_settings(&self) -> PoolSettings {
        PoolSettings {
            min_pool_size: self.pool.min_pool_size,
            max_pool_size: self.pool.max_pool_size,
            reserve_size: self.pool.reserve_size,
            keep_alive: Duration::from_millis(self.pool.keep_alive_ms),
            verbose: self.pool.verbose,
            charset: self.pool.charset.into(),
        }
    }
}
