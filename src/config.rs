//! TOML configuration for stream strategies and pipe options.
//!
//! ```toml
//! [readable]
//! high_water_mark = 16.0
//! size = "count"
//!
//! [writable]
//! high_water_mark = 4096.0
//! size = "bytes"
//!
//! [pipe]
//! prevent_close = false
//! timeout_ms = 30000
//! ```

use crate::error::Result as StreamResult;
use crate::streaming::{AbortSignal, PipeOptions, QueuingStrategy, DEFAULT_HIGH_WATER_MARK};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {table} strategy: {message}")]
    Strategy { table: &'static str, message: String },
}

/// How chunk sizes are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeMode {
    /// Every chunk counts as one
    #[default]
    Count,
    /// A chunk counts as its byte length
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrategyConfig {
    pub high_water_mark: f64,
    pub size: SizeMode,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            size: SizeMode::Count,
        }
    }
}

impl StrategyConfig {
    /// Count strategy with the configured high-water mark; `size` is
    /// ignored since arbitrary chunks have no byte length.
    pub fn count_strategy<T: 'static>(&self) -> StreamResult<QueuingStrategy<T>> {
        QueuingStrategy::count(self.high_water_mark)
    }

    /// Strategy honouring `size`, for byte-like chunks.
    pub fn byte_strategy<T: AsRef<[u8]> + 'static>(&self) -> StreamResult<QueuingStrategy<T>> {
        match self.size {
            SizeMode::Count => QueuingStrategy::count(self.high_water_mark),
            SizeMode::Bytes => QueuingStrategy::byte_length(self.high_water_mark),
        }
    }

    fn validate(&self, table: &'static str) -> Result<(), ConfigError> {
        if self.high_water_mark.is_nan() || self.high_water_mark < 0.0 {
            return Err(ConfigError::Strategy {
                table,
                message: format!(
                    "high_water_mark must be non-negative, got {}",
                    self.high_water_mark
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipeConfig {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
    /// Abort the pipe after this many milliseconds
    pub timeout_ms: Option<u64>,
}

impl PipeConfig {
    /// Build pipe options. A configured timeout spawns a timer, so this must
    /// run inside a tokio runtime when `timeout_ms` is set.
    pub fn options(&self) -> PipeOptions {
        PipeOptions {
            prevent_close: self.prevent_close,
            prevent_abort: self.prevent_abort,
            prevent_cancel: self.prevent_cancel,
            signal: self
                .timeout_ms
                .map(|ms| AbortSignal::timeout(Duration::from_millis(ms))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub readable: StrategyConfig,
    pub writable: StrategyConfig,
    pub pipe: PipeConfig,
}

impl StreamConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: StreamConfig = toml::from_str(text)?;
        config.readable.validate("readable")?;
        config.writable.validate("writable")?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loading stream config");
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
