//! Configuration for the EMG Intent Agent.

use crate::serial::ChannelMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial device and recovery settings
    pub serial: SerialConfig,
    /// Sampling and windowing
    pub acquisition: AcquisitionConfig,
    /// Independent component analysis settings
    pub separation: SeparationConfig,
    /// Which classifier drives inference
    pub classifier: ClassifierConfig,
    /// Rate limiting of decisions
    pub decision: DecisionConfig,
    /// Outbound actuator links
    pub dispatch: DispatchConfig,
    /// Recording file naming
    pub recording: RecordingConfig,
    /// Directory for recordings, datasets and statistics
    pub data_path: PathBuf,
    /// Directory for trained model artifacts
    pub models_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("emg-intent-agent");

        Self {
            serial: SerialConfig::default(),
            acquisition: AcquisitionConfig::default(),
            separation: SeparationConfig::default(),
            classifier: ClassifierConfig::default(),
            decision: DecisionConfig::default(),
            dispatch: DispatchConfig::default(),
            recording: RecordingConfig::default(),
            models_path: data_dir.join("models"),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit file, falling back to defaults if it is missing.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("emg-intent-agent")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        std::fs::create_dir_all(&self.models_path)?;
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.acquisition.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".into()));
        }
        if self.acquisition.min_samples < 2 {
            return Err(ConfigError::Invalid("min_samples must be at least 2".into()));
        }
        if self.serial.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        let labels = &self.classifier.labels;
        if labels.affirmative.trim().is_empty() || labels.negative.trim().is_empty() {
            return Err(ConfigError::Invalid("intent labels must not be empty".into()));
        }
        if labels.affirmative == labels.negative {
            return Err(ConfigError::Invalid(
                "affirmative and negative labels must differ".into(),
            ));
        }
        if let ClassifierMode::Simulated {
            affirmative_prior, ..
        } = self.classifier.mode
        {
            if !(0.0..=1.0).contains(&affirmative_prior) {
                return Err(ConfigError::Invalid(
                    "affirmative_prior must be within [0, 1]".into(),
                ));
            }
        }
        if self.dispatch.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Serial device settings, including the reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Explicit device path; discovered automatically when absent
    pub port: Option<String>,
    pub baud_rate: u32,
    /// One integer per line, or two comma-separated integers
    pub channels: ChannelMode,
    /// RTS/CTS flow control
    pub hardware_flow_control: bool,
    /// Bound on a single blocking read so stop requests are seen promptly
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    pub max_attempts: u32,
    /// Wait after terminating other port holders
    #[serde(with = "duration_ms")]
    pub cleanup_settle: Duration,
    /// Wait between failed open attempts
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    /// Wait after a successful open while the board resets
    #[serde(with = "duration_ms")]
    pub connect_settle: Duration,
    /// Terminate other processes holding the port before opening it
    pub reclaim_port: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            channels: ChannelMode::Single,
            hardware_flow_control: false,
            read_timeout: Duration::from_millis(100),
            max_attempts: 3,
            cleanup_settle: Duration::from_secs(1),
            retry_delay: Duration::from_secs(2),
            connect_settle: Duration::from_secs(2),
            reclaim_port: true,
        }
    }
}

/// Sampling and windowing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Samples per second; also the inference window length in samples
    pub sample_rate: usize,
    /// Length of one recording session
    #[serde(with = "duration_ms")]
    pub recording_duration: Duration,
    /// Windows shorter than this are not decomposed
    pub min_samples: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 1000,
            recording_duration: Duration::from_secs(15),
            min_samples: 8,
        }
    }
}

impl AcquisitionConfig {
    /// Nominal duration of an inference window.
    pub fn inference_window(&self) -> Duration {
        Duration::from_secs_f64(self.sample_rate as f64 / 1000.0)
    }
}

/// FastICA settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-4,
        }
    }
}

/// The two labels a classifier may emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentLabels {
    /// Label that asks the actuator to move
    pub affirmative: String,
    /// Label that asks the actuator to stay
    pub negative: String,
}

impl Default for IntentLabels {
    fn default() -> Self {
        Self {
            affirmative: "YES".to_string(),
            negative: "NO".to_string(),
        }
    }
}

impl IntentLabels {
    pub fn new(affirmative: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            affirmative: affirmative.into(),
            negative: negative.into(),
        }
    }

    /// Both labels, affirmative first.
    pub fn all(&self) -> [&str; 2] {
        [&self.affirmative, &self.negative]
    }

    pub fn contains(&self, label: &str) -> bool {
        self.affirmative == label || self.negative == label
    }
}

/// Which classifier variant is constructed for inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierMode {
    /// A model artifact produced by `train`
    Trained { model: String },
    /// Random labels drawn from a fixed prior
    Simulated {
        affirmative_prior: f64,
        seed: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub mode: ClassifierMode,
    pub labels: IntentLabels,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            mode: ClassifierMode::Trained {
                model: "nbest".to_string(),
            },
            labels: IntentLabels::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Minimum spacing between accepted decisions
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(1),
        }
    }
}

/// Outbound actuator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// WebSocket endpoints that receive every accepted decision
    pub actuator_urls: Vec<String>,
    pub move_command: String,
    pub stay_command: String,
    /// Decisions buffered per subscriber before it starts lagging
    pub channel_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            actuator_urls: Vec::new(),
            move_command: "MOVE".to_string(),
            stay_command: "STAY".to_string(),
            channel_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Prepended to the lowercase label to name a recording file
    pub file_prefix: String,
    /// Name of the combined training dataset
    pub dataset_file: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            file_prefix: "n".to_string(),
            dataset_file: "ndata.csv".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.max_attempts, 3);
        assert_eq!(config.acquisition.sample_rate, 1000);
        assert_eq!(config.acquisition.recording_duration, Duration::from_secs(15));
        assert_eq!(config.decision.cooldown, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let config = Config::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["serial"]["read_timeout"], 100);
        assert_eq!(json["decision"]["cooldown"], 1000);

        let back: Config = serde_json::from_value(json).unwrap();
        assert_eq!(back.serial.read_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{ "serial": { "port": "/dev/ttyACM0", "channels": "dual" } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.serial.channels, ChannelMode::Dual);
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.acquisition.sample_rate, 1000);
    }

    #[test]
    fn test_simulated_mode_parsing() {
        let json = r#"{ "classifier": { "mode": { "kind": "simulated", "affirmative_prior": 0.6, "seed": 7 },
                        "labels": { "affirmative": "GO", "negative": "STOP" } } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        match config.classifier.mode {
            ClassifierMode::Simulated {
                affirmative_prior,
                seed,
            } => {
                assert!((affirmative_prior - 0.6).abs() < 1e-12);
                assert_eq!(seed, Some(7));
            }
            other => panic!("unexpected mode: {other:?}"),
        }
        assert!(config.classifier.labels.contains("GO"));
        assert!(!config.classifier.labels.contains("YES"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.classifier.labels = IntentLabels::new("SAME", "SAME");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.classifier.mode = ClassifierMode::Simulated {
            affirmative_prior: 1.5,
            seed: None,
        };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.serial.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inference_window_follows_sample_rate() {
        let acquisition = AcquisitionConfig {
            sample_rate: 500,
            ..Default::default()
        };
        assert_eq!(acquisition.inference_window(), Duration::from_millis(500));
    }
}
