//! Configuration module
//!
//! Driver settings loaded from TOML

mod settings;

pub use settings::{ConfigError, DriverConfig, PortAgentConfig, UnitConfig};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the driver configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "seacomm", "Seacomm").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default configuration file, `config.toml` in [`config_dir`]
pub fn config_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}
