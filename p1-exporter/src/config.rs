//! Configuration for the P1 exporter.

use std::net::SocketAddr;
use std::path::Path;

use p1_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] p1_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// HTTP endpoint settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Where telegrams come from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Address to listen on (default: "0.0.0.0:9832").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for the metrics endpoint (default: "/metrics").
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

fn default_listen() -> String {
    "0.0.0.0:9832".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            metrics_path: default_metrics_path(),
        }
    }
}

/// Telegram source selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Newline-delimited JSON telegrams from a file, FIFO or `-` for stdin.
    Stream {
        #[serde(default = "default_stream_path")]
        path: String,
    },
    /// Synthetic meter.
    Demo {
        #[serde(default = "default_demo_interval")]
        interval_ms: u64,
    },
}

fn default_stream_path() -> String {
    "-".to_string()
}

fn default_demo_interval() -> u64 {
    1000
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Stream {
            path: default_stream_path(),
        }
    }
}

impl SourceConfig {
    /// Demo source with the default interval.
    pub fn demo() -> Self {
        SourceConfig::Demo {
            interval_ms: default_demo_interval(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ExporterConfig = p1_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = p1_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        if !self.web.metrics_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if self.web.metrics_path == "/" {
            return Err(ConfigError::Validation(
                "Metrics path must not be / (reserved for the landing page)".to_string(),
            ));
        }

        if let SourceConfig::Demo { interval_ms: 0 } = self.source {
            return Err(ConfigError::Validation(
                "Demo interval_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.web.listen.parse().map_err(|_| {
            ConfigError::Validation(format!("Invalid listen address: {}", self.web.listen))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p1_common::LogFormat;
    use std::io::Write;

    #[test]
    fn test_parse_minimal_config() {
        let config = ExporterConfig::parse("{}").unwrap();

        assert_eq!(config.web.listen, "0.0.0.0:9832");
        assert_eq!(config.web.metrics_path, "/metrics");
        assert_eq!(
            config.source,
            SourceConfig::Stream {
                path: "-".to_string()
            }
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            web: {
                listen: "127.0.0.1:9100",
                metrics_path: "/p1/metrics",
            },
            source: {
                type: "stream",
                path: "/run/p1/telegrams.jsonl",
            },
            logging: {
                level: "debug",
                format: "json"
            }
        }"#;

        let config = ExporterConfig::parse(json).unwrap();

        assert_eq!(config.web.listen, "127.0.0.1:9100");
        assert_eq!(config.web.metrics_path, "/p1/metrics");
        assert_eq!(
            config.source,
            SourceConfig::Stream {
                path: "/run/p1/telegrams.jsonl".to_string()
            }
        );
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(
            config.listen_addr().unwrap(),
            "127.0.0.1:9100".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_demo_source() {
        let config = ExporterConfig::parse(r#"{ source: { type: "demo", interval_ms: 250 } }"#)
            .unwrap();
        assert_eq!(config.source, SourceConfig::Demo { interval_ms: 250 });

        let config = ExporterConfig::parse(r#"{ source: { type: "demo" } }"#).unwrap();
        assert_eq!(config.source, SourceConfig::demo());
    }

    #[test]
    fn test_validate_invalid_listen() {
        let result = ExporterConfig::parse(r#"{ web: { listen: "not-an-address" } }"#);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid listen address")
        );
    }

    #[test]
    fn test_validate_invalid_path() {
        let result = ExporterConfig::parse(r#"{ web: { metrics_path: "metrics" } }"#);
        assert!(result.unwrap_err().to_string().contains("must start with /"));

        let result = ExporterConfig::parse(r#"{ web: { metrics_path: "/" } }"#);
        assert!(result.unwrap_err().to_string().contains("must not be /"));
    }

    #[test]
    fn test_validate_zero_demo_interval() {
        let result = ExporterConfig::parse(r#"{ source: { type: "demo", interval_ms: 0 } }"#);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_unknown_source_type() {
        let result = ExporterConfig::parse(r#"{ source: { type: "serial" } }"#);
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ web: {{ listen: "127.0.0.1:0" }} }}"#).unwrap();

        let config = ExporterConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.web.listen, "127.0.0.1:0");
    }

    #[test]
    fn test_load_missing_file() {
        let result = ExporterConfig::load_from_file("/nonexistent/p1-exporter.json5");
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
