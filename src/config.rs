use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::AlarmError;

/// Upper bound for [`Config::expired_batch`].
pub const MAX_EXPIRED_BATCH: usize = 4096;
/// Upper bound for [`Config::max_groups`]; every group owns a thread.
pub const MAX_GROUPS: usize = 1024;

/// What a change command does to an alarm's expiry.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangePolicy {
    /// only interval and message change, the alarm keeps its expiry
    #[default]
    Cosmetic,
    /// the expiry is recomputed from the new interval
    Restart,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub monitor_period_ms: u64,
    pub display_period_ms: u64,
    pub max_groups: usize,
    /// most expired alarms the monitor removes in one pass
    pub expired_batch: usize,
    pub change_policy: ChangePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor_period_ms: 1000,
            display_period_ms: 5000,
            max_groups: 10,
            expired_batch: 32,
            change_policy: ChangePolicy::Cosmetic,
        }
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_period_ms)
    }

    #[must_use]
    pub const fn display_period(&self) -> Duration {
        Duration::from_millis(self.display_period_ms)
    }

    /// Rejects settings the monitor and display workers can't run with.
    ///
    /// # Errors
    ///
    /// [`AlarmError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), AlarmError> {
        let invalid = |field, reason| Err(AlarmError::InvalidConfig { field, reason });
        if self.monitor_period_ms == 0 {
            return invalid("monitor_period_ms", "must be positive");
        }
        if self.display_period_ms == 0 {
            return invalid("display_period_ms", "must be positive");
        }
        if self.max_groups == 0 {
            return invalid("max_groups", "must be at least 1");
        }
        if self.max_groups > MAX_GROUPS {
            return invalid("max_groups", "must be at most 1024");
        }
        if self.expired_batch == 0 {
            return invalid("expired_batch", "must be at least 1");
        }
        if self.expired_batch > MAX_EXPIRED_BATCH {
            return invalid("expired_batch", "must be at most 4096");
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the file can't be read, isn't valid config toml or holds
    /// settings [`Config::validate`] rejects.
    pub fn load(path: &Path) -> Result<Self, AlarmError> {
        let config = std::fs::read_to_string(path).map_err(|source| AlarmError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&config).map_err(|source| AlarmError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise falls back to the defaults.
    ///
    /// # Errors
    ///
    /// Fails if an existing file can't be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self, AlarmError> {
        if path.exists() {
            Self::load(path)
        } else {
            log::info!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// # Errors
    ///
    /// Fails if the config directory or file can't be written.
    pub fn save(&self, path: &Path) -> Result<(), AlarmError> {
        let config = toml::to_string(self)?;
        let write_err = |source| AlarmError::ConfigWrite {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, config).map_err(write_err)
    }

    /// # Errors
    ///
    /// Fails if the platform has no config directory.
    pub fn config_path() -> Result<PathBuf, AlarmError> {
        let mut path = directories::ProjectDirs::from("", "", "roosty_alarms")
            .ok_or(AlarmError::NoConfigDir)?
            .config_dir()
            .to_path_buf();
        path.push("config.toml");
        Ok(path)
    }
}
