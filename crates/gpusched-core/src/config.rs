//! Scheduler configuration (TOML).
//!
//! ```toml
//! fence_timeout_ms = 10000
//! reschedule_timeout_ms = 1000
//! liveness = "forced_reschedule"
//! idle_poll_interval_ms = 2
//!
//! [log]
//! level = "debug"
//! format = "json"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error};
use crate::logging::LogConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Which liveness workaround the scheduler runs while unscheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessMode {
    /// No forced recovery; the scheduler stays unscheduled until every
    /// reason clears.
    #[default]
    Disabled,
    /// Force the scheduler back to scheduled after
    /// `reschedule_timeout_ms` of continuous unscheduling.
    ForcedReschedule,
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Age after which an unschedule fence is retired even if the GPU has
    /// not signaled it.
    pub fence_timeout_ms: u64,
    /// Delay before the forced reschedule fires.
    pub reschedule_timeout_ms: u64,
    /// Liveness workaround selection.
    pub liveness: LivenessMode,
    /// Service loop tick while the scheduler reports more work.
    pub idle_poll_interval_ms: u64,
    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fence_timeout_ms: 10_000,
            reschedule_timeout_ms: 1_000,
            liveness: LivenessMode::Disabled,
            idle_poll_interval_ms: 2,
            log: LogConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::from(ConfigError::ReadFailed(
                path.display().to_string(),
                e.to_string(),
            ))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), liveness = ?config.liveness, "Loaded scheduler config");
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fence_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "fence_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.reschedule_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reschedule_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.idle_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "idle_poll_interval_ms must be > 0".to_string(),
            ));
        }
        self.log
            .level()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(())
    }

    #[must_use]
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    #[must_use]
    pub fn reschedule_timeout(&self) -> Duration {
        Duration::from_millis(self.reschedule_timeout_ms)
    }

    #[must_use]
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fence_timeout(), Duration::from_secs(10));
        assert_eq!(config.reschedule_timeout(), Duration::from_secs(1));
        assert_eq!(config.liveness, LivenessMode::Disabled);
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = SchedulerConfig::from_toml_str("").unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            fence_timeout_ms = 250
            liveness = "forced_reschedule"

            [log]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.fence_timeout_ms, 250);
        assert_eq!(config.liveness, LivenessMode::ForcedReschedule);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.reschedule_timeout_ms, 1_000);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = SchedulerConfig::from_toml_str("fence_timeout_ms = 0").unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::ValidationError(ref msg)) if msg.contains("fence_timeout_ms")
        ));
    }

    #[test]
    fn unknown_liveness_mode_is_a_parse_error() {
        let err = SchedulerConfig::from_toml_str(r#"liveness = "sometimes""#).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ParseFailed(_))));
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let err = SchedulerConfig::from_toml_str("[log]\nlevel = \"loud\"").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ValidationError(_))));
    }

    #[test]
    fn load_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = SchedulerConfig::load(&tmp.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("gpusched.toml");
        std::fs::write(&path, "reschedule_timeout_ms = 40\nidle_poll_interval_ms = 5\n").unwrap();
        let config = SchedulerConfig::load(&path).unwrap();
        assert_eq!(config.reschedule_timeout(), Duration::from_millis(40));
        assert_eq!(config.idle_poll_interval(), Duration::from_millis(5));
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn config_serde_json_roundtrip() {
        let config = SchedulerConfig {
            liveness: LivenessMode::ForcedReschedule,
            ..SchedulerConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"forced_reschedule\""));
        let back: SchedulerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
