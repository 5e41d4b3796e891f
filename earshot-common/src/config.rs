//! Configuration loading and data folder resolution

use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Data folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file (`data_folder` key)
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_data_folder(
    cli_arg: Option<&str>,
    env_var_name: &str,
    config_file: Option<&Path>,
) -> Result<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Ok(PathBuf::from(path));
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        return Ok(PathBuf::from(path));
    }

    // Priority 3: TOML config file (explicit path or platform default location)
    let config_path = match config_file {
        Some(path) => Ok(path.to_path_buf()),
        None => default_config_file(),
    };
    if let Ok(config_path) = config_path {
        if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
            if let Ok(config) = toml::from_str::<toml::Value>(&toml_content) {
                if let Some(data_folder) = config.get("data_folder").and_then(|v| v.as_str()) {
                    return Ok(PathBuf::from(data_folder));
                }
            }
        }
    }

    // Priority 4: OS-dependent compiled default
    Ok(get_default_data_folder())
}

/// Get default configuration file path for the platform
fn default_config_file() -> Result<PathBuf> {
    if cfg!(target_os = "linux") {
        // Try ~/.config/earshot/config.toml first, then /etc/earshot/config.toml
        let user_config = dirs::config_dir().map(|d| d.join("earshot").join("config.toml"));
        let system_config = PathBuf::from("/etc/earshot/config.toml");

        if let Some(path) = user_config {
            if path.exists() {
                return Ok(path);
            }
        }
        if system_config.exists() {
            return Ok(system_config);
        }
        return Err(Error::Config("No config file found".to_string()));
    }

    let config_path = dirs::config_dir()
        .map(|d| d.join("earshot").join("config.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    if config_path.exists() {
        Ok(config_path)
    } else {
        Err(Error::Config(format!(
            "Config file not found: {:?}",
            config_path
        )))
    }
}

/// Get OS-dependent default data folder path
fn get_default_data_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/earshot (or /var/lib/earshot for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("earshot"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/earshot"))
    } else if cfg!(target_os = "macos") {
        // ~/Library/Application Support/earshot
        dirs::data_dir()
            .map(|d| d.join("earshot"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/earshot"))
    } else if cfg!(target_os = "windows") {
        // %LOCALAPPDATA%\earshot
        dirs::data_local_dir()
            .map(|d| d.join("earshot"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\earshot"))
    } else {
        PathBuf::from("./earshot_data")
    }
}
