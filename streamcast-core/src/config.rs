use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub rewind: RewindConfig,
    pub persistence: PersistenceConfig,
    pub handoff: HandoffConfig,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Defaults applied to every stream unless overridden in `streams`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewindConfig {
    /// Seconds of audio retained per stream
    pub seconds: u32,
    /// Seconds delivered immediately to a newly attached listener
    pub burst: u32,
    /// Nominal chunk duration, used until a source or snapshot reports its own
    pub chunk_duration_ms: u32,
    /// Listeners with more unflushed bytes than this are disconnected
    pub max_buffered_bytes: usize,
    /// How often listener backlogs are checked
    pub backpressure_poll_ms: u64,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            seconds: 3600,
            burst: 30,
            chunk_duration_ms: 500,
            max_buffered_bytes: 4 * 1024 * 1024,
            backpressure_poll_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    /// Periodic dump interval. Zero or negative disables periodic dumps.
    pub interval_seconds: i64,
    pub dump_on_shutdown: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            interval_seconds: 300,
            dump_on_shutdown: true,
        }
    }
}

impl PersistenceConfig {
    /// Periodic dump interval, `None` when periodic dumps are disabled.
    #[must_use]
    pub fn interval(&self) -> Option<std::time::Duration> {
        u64::try_from(self.interval_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .map(std::time::Duration::from_secs)
    }
}

/// Live buffer transfer between an outgoing and an incoming process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Address this process serves its buffers on (outgoing side)
    pub listen: Option<String>,
    /// Address of the outgoing process to pull buffers from (incoming side)
    pub source: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            listen: None,
            source: None,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub key: String,
    pub seconds: Option<u32>,
    pub burst: Option<u32>,
    pub hls: bool,
}

impl StreamConfig {
    #[must_use]
    pub fn seconds(&self, defaults: &RewindConfig) -> u32 {
        self.seconds.unwrap_or(defaults.seconds)
    }

    #[must_use]
    pub fn burst(&self, defaults: &RewindConfig) -> u32 {
        self.burst.unwrap_or(defaults.burst)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        // A file that was asked for must exist
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(Path::new(path)).required(true));
        }

        // STREAMCAST_REWIND__SECONDS, STREAMCAST_PERSISTENCE__DIR, ...
        builder = builder.add_source(
            Environment::with_prefix("STREAMCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration, collecting every problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => errors.push(format!("logging.format must be \"json\" or \"pretty\", got {other:?}")),
        }

        if self.rewind.chunk_duration_ms == 0 {
            errors.push("rewind.chunk_duration_ms must be greater than zero".to_string());
        }
        if self.rewind.backpressure_poll_ms == 0 {
            errors.push("rewind.backpressure_poll_ms must be greater than zero".to_string());
        }

        if self.persistence.enabled && self.persistence.dir.is_none() {
            errors.push("persistence.dir is required when persistence is enabled".to_string());
        }

        if self.handoff.listen.is_some() && self.handoff.listen == self.handoff.source {
            errors.push("handoff.listen and handoff.source must differ".to_string());
        }

        let mut seen = HashSet::new();
        for (idx, stream) in self.streams.iter().enumerate() {
            if stream.key.trim().is_empty() {
                errors.push(format!("streams[{idx}].key must not be empty"));
                continue;
            }
            if !seen.insert(stream.key.as_str()) {
                errors.push(format!("duplicate stream key {:?}", stream.key));
            }
            let seconds = stream.seconds(&self.rewind);
            let burst = stream.burst(&self.rewind);
            if burst > seconds {
                errors.push(format!(
                    "stream {:?}: burst ({burst}s) exceeds retained seconds ({seconds}s)",
                    stream.key
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn stream(key: &str) -> StreamConfig {
        StreamConfig {
            key: key.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rewind.seconds, 3600);
        assert_eq!(config.rewind.burst, 30);
        assert!(!config.persistence.enabled);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = Config {
            logging: LoggingConfig {
                format: "xml".to_string(),
                ..Default::default()
            },
            persistence: PersistenceConfig {
                enabled: true,
                dir: None,
                ..Default::default()
            },
            streams: vec![
                stream("radio"),
                stream("radio"),
                stream(""),
                StreamConfig {
                    key: "talk".to_string(),
                    seconds: Some(10),
                    burst: Some(20),
                    hls: false,
                },
            ],
            ..Default::default()
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 5, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("duplicate stream key")));
        assert!(errors.iter().any(|e| e.contains("burst")));
    }

    #[test]
    fn test_interval_disabled_when_not_positive() {
        let mut persistence = PersistenceConfig::default();
        assert_eq!(
            persistence.interval(),
            Some(std::time::Duration::from_secs(300))
        );
        persistence.interval_seconds = 0;
        assert_eq!(persistence.interval(), None);
        persistence.interval_seconds = -5;
        assert_eq!(persistence.interval(), None);
    }

    #[test]
    fn test_stream_overrides_fall_back_to_defaults() {
        let defaults = RewindConfig::default();
        let overridden = StreamConfig {
            key: "a".to_string(),
            seconds: Some(120),
            burst: None,
            hls: true,
        };
        assert_eq!(overridden.seconds(&defaults), 120);
        assert_eq!(overridden.burst(&defaults), defaults.burst);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "rewind:\n  seconds: 600\n  burst: 15\nstreams:\n  - key: jazz\n    hls: true\n  - key: news\n    seconds: 60"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.rewind.seconds, 600);
        assert_eq!(config.rewind.burst, 15);
        assert_eq!(config.streams.len(), 2);
        assert!(config.streams[0].hls);
        assert_eq!(config.streams[1].seconds, Some(60));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("streamcast.yaml");
        assert!(Config::from_file(missing.to_str().unwrap()).is_err());
    }
}
