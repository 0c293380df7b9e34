//! Transport configuration
//!
//! Loaded from YAML; every field has a default so an empty file (or no file
//! at all) is a valid configuration. CLI flags override file values.
//!
//! ```yaml
//! mode:
//!   standard: pal
//!   density: high
//!   format: ep
//!   timeout_secs: 5
//! ring_units: 16
//! integrity: halt
//! record_size: 4096
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapters::TransferStyle;
use crate::domain::EventPublisher;
use crate::error::{Error, Result};
use crate::format::{Density, FormatVariant, ModeWord, VideoStandard, MAX_TIMEOUT_SECS};
use crate::stream::{
    Driver, IntegrityPolicy, RetryStrategy, StreamOptions, DEFAULT_FILLER, DEFAULT_RING_UNITS,
};

/// Mode fields as written in a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub standard: Option<VideoStandard>,
    pub density: Option<Density>,
    pub format: Option<FormatVariant>,
    /// Advisory I/O timeout; `None` waits indefinitely
    pub timeout_secs: Option<u32>,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            standard: Some(VideoStandard::Ntsc),
            density: Some(Density::High),
            format: Some(FormatVariant::Ep),
            timeout_secs: None,
        }
    }
}

/// Top-level configuration for a tape transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: ModeConfig,

    /// Ring depth of each node, in units
    pub ring_units: usize,

    /// Padding byte for incomplete and concealed sectors
    pub filler: u8,

    pub integrity: IntegrityPolicy,

    /// Drive the device in fixed-size records; `None` passes transfers through
    pub record_size: Option<usize>,

    /// Admit at most one field per field period
    pub pace: bool,

    /// Put the device descriptor in non-blocking mode
    pub nonblocking: bool,

    pub retry: RetryStrategy,

    /// Bytes buffered between the application thread and the chain
    #[serde(default = "default_pipeline_buffer")]
    pub pipeline_buffer: usize,
}

fn default_pipeline_buffer() -> usize {
    64 * 1024
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: ModeConfig::default(),
            ring_units: DEFAULT_RING_UNITS,
            filler: DEFAULT_FILLER,
            integrity: IntegrityPolicy::default(),
            record_size: None,
            pace: false,
            nonblocking: false,
            retry: RetryStrategy::default(),
            pipeline_buffer: default_pipeline_buffer(),
        }
    }
}

impl TransportConfig {
    /// Load and validate a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("cannot read {}: {}", path.display(), err))
        })?;
        let config = Self::from_yaml(&text)?;
        debug!(path = %path.display(), ?config, "Configuration loaded");
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        // An empty document parses as null rather than an empty mapping
        let config: Self = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ring_units == 0 {
            return Err(Error::Config("ring_units must be at least 1".into()));
        }
        if self.pipeline_buffer == 0 {
            return Err(Error::Config("pipeline_buffer must be at least 1".into()));
        }
        if self.record_size == Some(0) {
            return Err(Error::Config("record_size must be at least 1".into()));
        }
        if let Some(secs) = self.mode.timeout_secs {
            if secs > MAX_TIMEOUT_SECS {
                return Err(Error::Config(format!(
                    "timeout_secs {} exceeds the maximum of {}",
                    secs, MAX_TIMEOUT_SECS
                )));
            }
        }
        Ok(())
    }

    pub fn to_mode_word(&self) -> ModeWord {
        ModeWord::pack(
            self.mode.standard,
            self.mode.density,
            self.mode.format,
            self.mode.timeout_secs,
        )
    }

    pub fn stream_options(&self, publisher: Arc<dyn EventPublisher>) -> StreamOptions {
        StreamOptions {
            ring_units: self.ring_units,
            filler: self.filler,
            integrity: self.integrity,
            publisher,
        }
    }

    pub fn transfer_style(&self) -> TransferStyle {
        self.record_size
            .map_or(TransferStyle::Raw, TransferStyle::Record)
    }

    pub fn driver(&self) -> Driver {
        Driver::for_mode(self.to_mode_word(), self.retry)
    }
}
