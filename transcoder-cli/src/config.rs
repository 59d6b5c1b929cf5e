use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use transcoder_engine::TranscoderConfig;

/// `<config dir>/transcoder/config.toml`, if the platform has a config dir.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("transcoder").join("config.toml"))
}

/// Load the configuration file.
///
/// An explicit path must exist. Without one, the default location is used
/// when present and built-in defaults otherwise.
pub fn load(explicit: Option<&Path>) -> Result<TranscoderConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_path().filter(|path| path.is_file()) {
            Some(path) => path,
            None => {
                debug!("No configuration file found, using defaults");
                return Ok(TranscoderConfig::default());
            }
        },
    };
    load_from(&path)
}

pub fn load_from(path: &Path) -> Result<TranscoderConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: TranscoderConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}
