//! Agent Configuration
//!
//! Loaded once at startup from TOML and passed down explicitly.
//!
//! ## Loading Order
//!
//! 1. `--config <path>`
//! 2. `NAV_UPLINK_CONFIG` environment variable
//! 3. `<config_dir>/nav-uplink/config.toml`
//!
//! The device access token is read separately: `NAV_UPLINK_ACCESS_TOKEN`, or
//! `[device] access_token` in `<data_dir>/credentials.toml`.

mod agent_config;
pub mod defaults;
pub mod validation;

pub use agent_config::*;

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Platform config directory for the agent (e.g. `~/.config/nav-uplink`).
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(defaults::APP_DIR_NAME))
}

/// Platform data directory for the agent (e.g. `~/.local/share/nav-uplink`).
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join(defaults::APP_DIR_NAME))
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    device: DeviceCredentials,
}

#[derive(Debug, Deserialize)]
struct DeviceCredentials {
    access_token: String,
}

/// Resolve the device access token.
///
/// `$NAV_UPLINK_ACCESS_TOKEN` wins over the credentials file.
pub fn load_access_token(data_dir: &Path) -> Result<String, ConfigError> {
    if let Ok(token) = std::env::var(defaults::ACCESS_TOKEN_ENV) {
        let token = token.trim();
        if !token.is_empty() {
            return Ok(token.to_string());
        }
    }
    read_credentials_file(&data_dir.join(defaults::CREDENTIALS_FILE_NAME))
}

fn read_credentials_file(path: &Path) -> Result<String, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::MissingCredentials(path.to_path_buf()));
        }
        Err(e) => return Err(ConfigError::Io(path.to_path_buf(), e)),
    };

    let creds: CredentialsFile =
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
    let token = creds.device.access_token.trim().to_string();
    if token.is_empty() {
        return Err(ConfigError::MissingCredentials(path.to_path_buf()));
    }
    Ok(token)
}
