//! Per-stage configuration.
//!
//! Everything that tunes a pre-stage travels in a [`ReduceConfig`] handed
//! over at construction, including the debug switch; there is no global
//! state. Configurations can be read from JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a partition writer receives for every reduced pair.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// The key is not derivable from the value: write `(key, value)`.
    #[default]
    Volatile,
    /// The key extractor recovers the key from the value: write the value.
    Robust,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceConfig {
    /// Fraction of all slots that may hold items before the largest
    /// partition is spilled.
    pub max_fill_rate: f64,
    /// Whether partitions may be written to local storage. Without it a
    /// full table is an error.
    pub spill_enabled: bool,
    /// Directory holding spill files.
    pub spill_dir: PathBuf,
    /// False-positive tuning constant of the fingerprint exchange.
    pub fpr_parameter: f64,
    /// Run the fingerprint exchange during `flush_all`.
    pub detect_duplicates: bool,
    pub key_mode: KeyMode,
    /// Log every encoded and decoded fingerprint at trace level.
    pub debug: bool,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            max_fill_rate: 0.5,
            spill_enabled: true,
            spill_dir: std::env::temp_dir(),
            fpr_parameter: 8.0,
            detect_duplicates: true,
            key_mode: KeyMode::Volatile,
            debug: false,
        }
    }
}

impl ReduceConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidParameter(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.max_fill_rate > 0.0 && self.max_fill_rate <= 1.0) {
            return Err(Error::InvalidParameter(format!(
                "max_fill_rate must be in (0, 1], got {}",
                self.max_fill_rate
            )));
        }
        if !(self.fpr_parameter >= 1.0) {
            return Err(Error::InvalidParameter(format!(
                "fpr_parameter must be at least 1, got {}",
                self.fpr_parameter
            )));
        }
        Ok(())
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = dir.into();
        self
    }

    pub fn with_key_mode(mut self, key_mode: KeyMode) -> Self {
        self.key_mode = key_mode;
        self
    }

    pub fn with_duplicate_detection(mut self, enabled: bool) -> Self {
        self.detect_duplicates = enabled;
        self
    }

    pub fn with_spilling(mut self, enabled: bool) -> Self {
        self.spill_enabled = enabled;
        self
    }
}
