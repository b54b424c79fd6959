//! Engine configuration.
//!
//! [`SimConfig`] is plain serde data with defaults for every field, so a
//! config file only needs to name what it changes. With the `config-files`
//! feature, [`load_config`] reads RON, TOML or JSON files, detecting the
//! format from the extension.

use serde::{Deserialize, Serialize};

use crate::movement::MovementPolicy;

/// Largest supported number of pins per edge.
pub const MAX_PINS_PER_EDGE: u8 = 4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while validating or loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("pins_per_edge must be in 1..=4, got {0}")]
    PinsPerEdge(u8),

    #[error("event_capacity must be positive")]
    EventCapacity,

    #[cfg(feature = "config-files")]
    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: std::path::PathBuf },

    #[cfg(feature = "config-files")]
    #[error("parse error in {file}: {detail}")]
    Parse {
        file: std::path::PathBuf,
        detail: String,
    },

    #[cfg(feature = "config-files")]
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// SimConfig
// ---------------------------------------------------------------------------

/// Tunables of an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Pins on every edge of a particle.
    pub pins_per_edge: u8,
    pub movement_policy: MovementPolicy,
    /// Turn panics inside behavior callbacks into `AlgorithmFault` errors.
    pub catch_panics: bool,
    /// Ring buffer capacity per event kind.
    pub event_capacity: usize,
    /// Default round limit for [`Engine::run`](crate::engine::Engine::run).
    pub max_rounds: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            pins_per_edge: 2,
            movement_policy: MovementPolicy::Strict,
            catch_panics: true,
            event_capacity: 1024,
            max_rounds: 1000,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_PINS_PER_EDGE).contains(&self.pins_per_edge) {
            return Err(ConfigError::PinsPerEdge(self.pins_per_edge));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::EventCapacity);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File loading
// ---------------------------------------------------------------------------

/// Supported config file formats.
#[cfg(feature = "config-files")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file based on its extension.
#[cfg(feature = "config-files")]
pub fn detect_format(path: &std::path::Path) -> Result<Format, ConfigError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(ConfigError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

/// Parse config text in the given format and validate it.
#[cfg(feature = "config-files")]
pub fn parse_config(
    content: &str,
    format: Format,
    file: &std::path::Path,
) -> Result<SimConfig, ConfigError> {
    let parse_err = |detail: String| ConfigError::Parse {
        file: file.to_path_buf(),
        detail,
    };
    let config: SimConfig = match format {
        Format::Ron => ron::from_str(content).map_err(|e| parse_err(e.to_string()))?,
        Format::Toml => toml::from_str(content).map_err(|e| parse_err(e.to_string()))?,
        Format::Json => serde_json::from_str(content).map_err(|e| parse_err(e.to_string()))?,
    };
    config.validate()?;
    Ok(config)
}

/// Read and validate a config file.
#[cfg(feature = "config-files")]
pub fn load_config(path: &std::path::Path) -> Result<SimConfig, ConfigError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    parse_config(&content, format, path)
}

// ===========================================================================
// Tests
// ===========================================================================
