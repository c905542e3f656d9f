//! Conveyor configuration (conveyor.toml)

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which scheduler variant to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Exactly one line
    Solo,
    /// Bounded pool of lines
    #[default]
    Multi,
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConveyorConfig {
    /// Conveyor name, used for thread names and logs
    #[serde(default = "default_name")]
    pub name: String,

    /// Scheduler variant
    #[serde(default)]
    pub kind: PoolKind,

    /// Number of lines in a multi conveyor; a solo conveyor always has one
    #[serde(default = "default_lines")]
    pub lines: usize,

    /// OS niceness applied to every line thread
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// How long a failing task stays frozen before it is retried
    #[serde(default = "default_freeze_ms")]
    pub freeze_ms: u64,
}

fn default_name() -> String {
    "conveyor".to_string()
}

fn default_lines() -> usize {
    num_cpus::get()
}

fn default_freeze_ms() -> u64 {
    60_000
}

impl Default for ConveyorConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            kind: PoolKind::default(),
            lines: default_lines(),
            priority: None,
            freeze_ms: default_freeze_ms(),
        }
    }
}

impl ConveyorConfig {
    /// Configuration for a solo conveyor
    pub fn solo(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PoolKind::Solo,
            lines: 1,
            ..Self::default()
        }
    }

    /// Configuration for a multi conveyor with `lines` lines
    pub fn multi(name: impl Into<String>, lines: usize) -> Self {
        Self {
            name: name.into(),
            kind: PoolKind::Multi,
            lines,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: ConveyorConfig = toml::from_str(content)?;
        if config.kind == PoolKind::Solo {
            config.lines = 1;
        }
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Check the configuration for values the scheduler can't run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        if self.lines == 0 {
            return Err(ConfigError::Invalid("lines must be at least 1".to_string()));
        }
        if let Some(priority) = self.priority {
            if !(-20..=19).contains(&priority) {
                return Err(ConfigError::Invalid(format!(
                    "priority {} is outside -20..=19",
                    priority
                )));
            }
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize TOML
    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    /// Semantically invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_minimal_config() {
        let config = ConveyorConfig::from_toml_str("name = \"ingest\"\nlines = 4\n").unwrap();
        assert_eq!(config.name, "ingest");
        assert_eq!(config.kind, PoolKind::Multi);
        assert_eq!(config.lines, 4);
        assert_eq!(config.freeze_ms, 60_000);
        assert_eq!(config.priority, None);
    }

    #[test]
    fn test_parse_solo_config() {
        let config =
            ConveyorConfig::from_toml_str("kind = \"solo\"\nlines = 1\nfreeze_ms = 250\n").unwrap();
        assert_eq!(config.kind, PoolKind::Solo);
        assert_eq!(config.freeze_ms, 250);
    }

    #[test]
    fn test_reject_zero_lines() {
        let err = ConveyorConfig::from_toml_str("lines = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_solo_forces_one_line() {
        let config = ConveyorConfig::from_toml_str("kind = \"solo\"\n").unwrap();
        assert_eq!(config.lines, 1);
        let config = ConveyorConfig::from_toml_str("kind = \"solo\"\nlines = 3\n").unwrap();
        assert_eq!(config.lines, 1);

        let mut config = ConveyorConfig::solo("direct");
        config.lines = 8;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reject_bad_toml() {
        let err = ConveyorConfig::from_toml_str("lines = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_round_trip_keeps_priority() {
        let mut config = ConveyorConfig::multi("render", 2);
        config.priority = Some(5);
        let text = config.to_toml_string().unwrap();
        assert_eq!(ConveyorConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"from-file\"").unwrap();
        writeln!(file, "lines = 2").unwrap();
        let config = ConveyorConfig::load(file.path()).unwrap();
        assert_eq!(config.name, "from-file");
        assert_eq!(config.lines, 2);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConveyorConfig::load("/nonexistent/conveyor.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
