//! Ledger configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file is a
//! valid configuration. Call [`LedgerConfig::validate`] after building one by
//! hand, [`LedgerConfig::load`] does it for you.

use super::error::ConfigError;
use super::stock::{DEFAULT_CRITICAL_THRESHOLD, DEFAULT_MINIMUM_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// Directory of the sled database.
    pub db_path: PathBuf,
    /// Minimum threshold given to ledgers created on first access.
    pub minimum_threshold: u32,
    /// Critical threshold given to ledgers created on first access.
    pub critical_threshold: u32,
    /// Number of movements returned per history page.
    pub history_page_size: usize,
    pub donation_shelf_life_days: u32,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("blood-ledger.db"),
            minimum_threshold: DEFAULT_MINIMUM_THRESHOLD,
            critical_threshold: DEFAULT_CRITICAL_THRESHOLD,
            history_page_size: 50,
            donation_shelf_life_days: 35,
            log_filter: "info".to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: LedgerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.db_path = db_path.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let both_zero = self.minimum_threshold == 0 && self.critical_threshold == 0;
        if self.critical_threshold >= self.minimum_threshold && !both_zero {
            return Err(ConfigError::Invalid(format!(
                "critical_threshold ({}) must be below minimum_threshold ({})",
                self.critical_threshold, self.minimum_threshold
            )));
        }
        if self.history_page_size == 0 {
            return Err(ConfigError::Invalid(
                "history_page_size must be at least 1".into(),
            ));
        }
        if self.donation_shelf_life_days == 0 {
            return Err(ConfigError::Invalid(
                "donation_shelf_life_days must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
