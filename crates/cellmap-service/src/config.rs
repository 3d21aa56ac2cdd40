//! Service configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cellmap_core::{AirplanePolicy, JoinOptions};
use cellmap_types::DeviceContext;

use crate::preferences::{DEFAULT_MAX_LOCATION_AGE, Preferences};

/// Service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage settings.
    pub storage: StorageConfig,
    /// Sampling preferences (see [`crate::preferences::keys`]).
    pub sampling: Preferences,
    /// Join settings.
    pub join: JoinConfig,
    /// Simulated providers used when the host has no radio.
    pub simulator: SimulatorConfig,
    /// Overrides for the per-install device description.
    pub device: DeviceContext,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// Sampling preferences are not checked here; bad values fall back to
    /// defaults when the schedule is derived.
    ///
    /// ```
    /// use cellmap_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.storage.validate());
        errors.extend(self.join.validate());
        errors.extend(self.simulator.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Configured device context with unset fields taken from the host.
    pub fn device_context(&self) -> DeviceContext {
        self.device.clone().or(DeviceContext::host())
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: cellmap_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Join configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Largest accepted distance between a fix timestamp and the clock.
    pub allowed_time_drift_ms: i64,
    /// Number of signal readings kept for joining.
    pub signal_history_len: usize,
    /// Last-known fixes older than this are ignored by burst polling.
    pub max_location_age_ms: u64,
    /// What to do with fixes while airplane mode is on.
    pub airplane_mode: AirplanePolicy,
}

impl Default for JoinConfig {
    fn default() -> Self {
        let defaults = JoinOptions::default();
        Self {
            allowed_time_drift_ms: defaults.allowed_drift.as_millis() as i64,
            signal_history_len: defaults.history_len,
            max_location_age_ms: DEFAULT_MAX_LOCATION_AGE.as_millis() as u64,
            airplane_mode: defaults.airplane,
        }
    }
}

impl JoinConfig {
    /// Validate join configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.allowed_time_drift_ms < 0 {
            errors.push(ValidationError {
                field: "join.allowed_time_drift_ms".to_string(),
                message: format!(
                    "allowed drift {} cannot be negative",
                    self.allowed_time_drift_ms
                ),
            });
        }
        if self.signal_history_len == 0 {
            errors.push(ValidationError {
                field: "join.signal_history_len".to_string(),
                message: "signal history must hold at least one reading".to_string(),
            });
        }
        if self.max_location_age_ms == 0 {
            errors.push(ValidationError {
                field: "join.max_location_age_ms".to_string(),
                message: "max location age cannot be 0".to_string(),
            });
        }

        errors
    }

    /// Options for the sample joiner.
    pub fn options(&self) -> JoinOptions {
        JoinOptions {
            allowed_drift: Duration::from_millis(self.allowed_time_drift_ms.max(0) as u64),
            history_len: self.signal_history_len,
            airplane: self.airplane_mode,
        }
    }

    pub fn max_location_age(&self) -> Duration {
        Duration::from_millis(self.max_location_age_ms)
    }
}

/// Simulator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Latitude the random walk starts at.
    pub latitude: f64,
    /// Longitude the random walk starts at.
    pub longitude: f64,
    /// Operator name reported by the simulated radio.
    pub carrier: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            latitude: 52.5200,
            longitude: 13.4050,
            carrier: "Simnet".to_string(),
        }
    }
}

impl SimulatorConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !(-90.0..=90.0).contains(&self.latitude) {
            errors.push(ValidationError {
                field: "simulator.latitude".to_string(),
                message: format!("latitude {} is out of range", self.latitude),
            });
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            errors.push(ValidationError {
                field: "simulator.longitude".to_string(),
                message: format!("longitude {} is out of range", self.longitude),
            });
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `join.signal_history_len`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
///
/// - Linux: `~/.config/cellmap/service.toml`
/// - macOS: `~/Library/Application Support/cellmap/service.toml`
/// - Windows: `C:\Users\<user>\AppData\Roaming\cellmap\service.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cellmap")
        .join("service.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::{ScheduleConfig, SamplingPolicy, keys};

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.sampling.is_empty());
        assert_eq!(config.join.allowed_time_drift_ms, 30_000);
        assert_eq!(config.join.signal_history_len, 100);
        assert_eq!(config.join.max_location_age_ms, 30_000);
        assert_eq!(config.join.airplane_mode, AirplanePolicy::Drop);
        assert!(config.storage.path.ends_with("cellmap/CellMapper.db"));
    }

    #[test]
    fn test_default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            [storage]
            path = "/data/CellMapper.db"

            [sampling]
            update_duration = 20
            sleep_between_measures = "15"
            use_gps = false
            sampling_policy = "burst"

            [join]
            allowed_time_drift_ms = 15000
            signal_history_len = 1000
            airplane_mode = "keep_first"

            [device]
            manufacturer = "HTC"
            model = "HTC Desire"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.path, PathBuf::from("/data/CellMapper.db"));
        assert_eq!(config.join.signal_history_len, 1000);
        assert_eq!(config.join.max_location_age_ms, 30_000);
        assert_eq!(config.join.airplane_mode, AirplanePolicy::KeepFirst);
        assert_eq!(config.device.manufacturer.as_deref(), Some("HTC"));
        assert_eq!(config.device.device, None);

        let options = config.join.options();
        assert_eq!(options.allowed_drift, Duration::from_secs(15));
        assert_eq!(options.history_len, 1000);

        let schedule = ScheduleConfig::from_preferences(&config.sampling);
        assert_eq!(schedule.update_duration, Duration::from_secs(20));
        assert_eq!(schedule.sleep_between_measures, Duration::from_secs(15));
        assert!(!schedule.use_gps);
        assert_eq!(schedule.policy, SamplingPolicy::Burst);
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("service.toml");

        let mut config = Config::default();
        config.storage.path = PathBuf::from("/tmp/test.db");
        config.sampling.set(keys::UPDATE_DURATION, 12);
        config.join.airplane_mode = AirplanePolicy::KeepFirst;
        config.device.model = Some("bravo".to_string());

        config.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/service.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid { toml").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_unknown_airplane_policy_is_parse_error() {
        let result: Result<Config, _> = toml::from_str("[join]\nairplane_mode = \"sometimes\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.storage.path = PathBuf::new();
        config.join.allowed_time_drift_ms = -1;
        config.join.signal_history_len = 0;

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "storage.path",
                "join.allowed_time_drift_ms",
                "join.signal_history_len"
            ]
        );

        let message = ConfigError::Validation(errors).to_string();
        assert!(message.contains("  - storage.path: database path cannot be empty"));
    }

    #[test]
    fn test_simulator_coordinates_validated() {
        let config: Config =
            toml::from_str("[simulator]\nlatitude = 91.0\ncarrier = \"Testnet\"").unwrap();
        assert_eq!(config.simulator.carrier, "Testnet");

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "simulator.latitude");
    }

    #[test]
    fn test_device_context_falls_back_to_host() {
        let mut config = Config::default();
        config.device.model = Some("bravo".to_string());

        let context = config.device_context();
        assert_eq!(context.model.as_deref(), Some("bravo"));
        assert_eq!(context.device.as_deref(), Some(std::env::consts::OS));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("cellmap/service.toml"));
    }
}
