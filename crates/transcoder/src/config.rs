//! Top-level configuration.

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::health::HealthConfig;
use crate::monitor::MonitorConfig;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Everything a [`crate::Transcoder`] needs besides the request itself.
///
/// Every section has defaults, so an empty document is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscoderConfig {
    pub engine: EngineConfig,
    pub retry: RetryPolicy,
    pub monitor: MonitorConfig,
    pub health: HealthConfig,
}

impl TranscoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.engine.binary_path.trim().is_empty() {
            return Err(Error::config("engine.binary_path must not be empty"));
        }
        self.retry.validate()?;
        if self.monitor.hls_stall_timeout_ms == 0 || self.monitor.file_stall_timeout_ms == 0 {
            return Err(Error::config("stall timeouts must be greater than zero"));
        }
        Ok(())
    }
}
