//! Driver settings

use crate::core::coordinator::{CoordinatorSettings, LifecycleCommand};
use crate::core::session::SessionSettings;
use crate::core::timebase::TimeBaseSettings;
use crate::core::transport::TcpConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    /// TOML did not parse
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be serialized
    #[error("config serialize: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values are inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),

    /// No platform config directory
    #[error("could not determine config directory")]
    NoConfigDir,
}

/// Port agent endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortAgentConfig {
    /// Port agent host
    pub host: String,
    /// Data port
    pub data_port: u16,
    /// Command port
    pub command_port: u16,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for PortAgentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            data_port: 4001,
            command_port: 4002,
            connect_timeout_secs: 10,
        }
    }
}

impl PortAgentConfig {
    /// TCP settings for the data port
    pub fn data_tcp(&self) -> TcpConfig {
        TcpConfig::new(&self.host, self.data_port).timeout(self.connect_timeout_secs)
    }

    /// TCP settings for the command port
    pub fn command_tcp(&self) -> TcpConfig {
        TcpConfig::new(&self.host, self.command_port).timeout(self.connect_timeout_secs)
    }
}

/// One coordinated unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Unit id
    pub id: String,
    /// Port agent for this unit; the top-level one when absent
    #[serde(default)]
    pub port_agent: Option<PortAgentConfig>,
}

/// Complete driver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Default port agent
    pub port_agent: PortAgentConfig,
    /// Session settings
    pub session: SessionSettings,
    /// Counter time base
    pub timebase: TimeBaseSettings,
    /// Multi-unit coordination
    pub coordinator: CoordinatorSettings,
    /// Coordinated units
    pub units: Vec<UnitConfig>,
}

impl DriverConfig {
    /// Parse and validate TOML
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Load `config.toml` from the default directory, or defaults if it
    /// does not exist
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        Self::load_or_default(&path)
    }

    /// Load from `path`, or defaults if the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save to a file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Port agent of a unit
    pub fn unit_port_agent(&self, id: &str) -> Option<&PortAgentConfig> {
        self.units
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.port_agent.as_ref().unwrap_or(&self.port_agent))
    }

    /// Check value ranges and unit references
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tb = &self.timebase;
        if !(tb.tick_rate.is_finite() && tb.tick_rate > 0.0) {
            return Err(ConfigError::Invalid(format!("tick_rate must be positive, got {}", tb.tick_rate)));
        }
        if !(1..=32).contains(&tb.counter_width) {
            return Err(ConfigError::Invalid(format!(
                "counter_width must be 1..=32, got {}",
                tb.counter_width
            )));
        }
        if !(tb.rollover_tolerance.is_finite() && tb.rollover_tolerance >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "rollover_tolerance must be at least 1, got {}",
                tb.rollover_tolerance
            )));
        }
        if self.session.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("read_chunk_size must be non-zero".into()));
        }
        if self.session.desync_window == 0 {
            return Err(ConfigError::Invalid("desync_window must be non-zero".into()));
        }

        let mut ids = HashSet::new();
        for unit in &self.units {
            if !ids.insert(unit.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate unit {:?}", unit.id)));
            }
        }

        let coordinator = &self.coordinator;
        let mut lists = vec![("order", coordinator.order.as_slice())];
        for (name, command) in [
            ("connect", LifecycleCommand::Connect),
            ("disconnect", LifecycleCommand::Disconnect),
            ("reset", LifecycleCommand::Reset),
            ("start", LifecycleCommand::Start),
            ("stop", LifecycleCommand::Stop),
        ] {
            if let Some(list) = coordinator.overrides.get(command) {
                lists.push((name, list));
            }
        }
        for (name, list) in lists {
            if let Some(unknown) = list.iter().find(|id| !ids.contains(id.as_str())) {
                return Err(ConfigError::Invalid(format!("{} order names unknown unit {:?}", name, unknown)));
            }
        }
        Ok(())
    }
}
