//! # Exporter Configuration
//!
//! The configuration is a YAML document:
//!
//! ```yaml
//! connection:
//!   type: knxd
//!   endpoint: 127.0.0.1:6720
//! metrics_prefix: knx_
//! poll_interval: 10s
//! address_configs:
//!   1/1/1:
//!     name: living_room_light
//!     dpt: 1.001
//!     comment: Light switch
//!   2/0/1:
//!     name: living_room_temperature
//!     dpt: 9.001
//!     read_active: true
//!     max_age: 5m
//!     labels:
//!       room: living
//! ```
//!
//! Group addresses and datapoint types are kept as text here and validated when
//! the address mapping is built, so that their errors carry their own kinds.

use crate::constants::{
    DEFAULT_MAX_AGE, DEFAULT_METRICS_PREFIX, DEFAULT_POLL_INTERVAL,
    DEFAULT_READ_STARTUP_INTERVAL,
};
use crate::error::BridgeError;
use crate::knx::session::SessionConfig;
use crate::mapping::MetricKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Kind of bus access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// knxd group socket over TCP
    #[default]
    Knxd,
}

/// Where and how to reach the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(rename = "type", default)]
    pub kind: ConnectionType,
    /// `host:port` of the gateway.
    pub endpoint: String,
}

/// One monitored group address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressConfig {
    /// Metric name without prefix.
    pub name: String,
    #[serde(default)]
    pub comment: String,
    /// Datapoint type, e.g. `9.001`.
    #[serde(deserialize_with = "dpt_text")]
    pub dpt: String,
    /// Whether the address is exported at all.
    #[serde(default = "default_true")]
    pub export: bool,
    #[serde(default)]
    pub metric_type: MetricKind,
    /// Periodically read the address instead of only listening.
    #[serde(default)]
    pub read_active: bool,
    /// Age after which an actively read value is re-read.
    #[serde(default = "default_max_age", with = "duration")]
    pub max_age: Duration,
    /// Read the address once at startup.
    #[serde(default)]
    pub read_startup: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Accepts `dpt: 9.001` unquoted. YAML reads that as a float, so it is turned
/// back into `main.sub` with a three digit sub number.
fn dpt_text<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => format!("{number:.3}"),
    })
}

fn default_true() -> bool {
    true
}

fn default_max_age() -> Duration {
    DEFAULT_MAX_AGE
}

fn default_metrics_prefix() -> String {
    DEFAULT_METRICS_PREFIX.to_string()
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_read_startup_interval() -> Duration {
    DEFAULT_READ_STARTUP_INTERVAL
}

/// Complete exporter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    pub connection: ConnectionConfig,
    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,
    /// Group address (`main/middle/sub`) to its metric settings.
    #[serde(default)]
    pub address_configs: BTreeMap<String, AddressConfig>,
    #[serde(default = "default_poll_interval", with = "duration")]
    pub poll_interval: Duration,
    #[serde(default = "default_read_startup_interval", with = "duration")]
    pub read_startup_interval: Duration,
    #[serde(default)]
    pub session: SessionConfig,
}

impl ExporterConfig {
    /// Reads and validates a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| BridgeError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parses and validates a YAML configuration document.
    pub fn from_yaml_str(text: &str) -> Result<Self, BridgeError> {
        let config: ExporterConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings that serde cannot express.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.connection.endpoint.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                "connection.endpoint must not be empty".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "poll_interval must be greater than zero".into(),
            ));
        }
        if self.session.initial_backoff.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "session.initial_backoff must be greater than zero".into(),
            ));
        }
        if self.session.max_backoff < self.session.initial_backoff {
            return Err(BridgeError::InvalidConfig(
                "session.max_backoff must not be below session.initial_backoff".into(),
            ));
        }
        if self.session.request_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "session.request_timeout must be greater than zero".into(),
            ));
        }
        for (address, entry) in &self.address_configs {
            if entry.read_active && entry.max_age.is_zero() {
                return Err(BridgeError::InvalidConfig(format!(
                    "{address}: max_age must be greater than zero for read_active addresses"
                )));
            }
        }
        Ok(())
    }
}

/// Serde helpers for durations written as `500ms`, `10s`, `5m`, `1h30m` or as
/// plain integer seconds.
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }

    /// Parses a sequence of `<number><unit>` pairs. Units: `ms`, `s`, `m`, `h`.
    /// A bare number means seconds.
    pub fn parse_duration(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty duration".into());
        }
        if let Ok(secs) = text.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        let mut total_ms = 0f64;
        let mut rest = text;
        while !rest.is_empty() {
            let number_len = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(rest.len());
            let (number, tail) = rest.split_at(number_len);
            let unit_len = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_len);

            let value: f64 = number
                .parse()
                .map_err(|_| format!("invalid duration: {text}"))?;
            let factor = match unit {
                "ms" => 1.0,
                "s" => 1_000.0,
                "m" => 60_000.0,
                "h" => 3_600_000.0,
                _ => return Err(format!("invalid duration unit in {text}")),
            };
            total_ms += value * factor;
            rest = tail;
        }
        if total_ms.fract() == 0.0 {
            Ok(Duration::from_millis(total_ms as u64))
        } else {
            Ok(Duration::from_secs_f64(total_ms / 1_000.0))
        }
    }

    /// Formats a duration in the largest unit that represents it exactly.
    pub fn format_duration(value: Duration) -> String {
        let millis = value.as_millis();
        if millis % 1000 != 0 {
            format!("{millis}ms")
        } else if millis != 0 && millis % 3_600_000 == 0 {
            format!("{}h", millis / 3_600_000)
        } else if millis != 0 && millis % 60_000 == 0 {
            format!("{}m", millis / 60_000)
        } else {
            format!("{}s", millis / 1000)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::duration::{format_duration, parse_duration};
    use super::*;

    const SAMPLE: &str = r#"
connection:
  type: knxd
  endpoint: 127.0.0.1:6720
metrics_prefix: home_
poll_interval: 5s
address_configs:
  1/1/1:
    name: light_switch
    dpt: 1.001
  2/0/1:
    name: temperature
    dpt: 9.001
    comment: Living room temperature
    metric_type: gauge
    read_active: true
    max_age: 2m
    labels:
      room: living
session:
  initial_backoff: 500ms
  max_backoff: 30s
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = ExporterConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.connection.kind, ConnectionType::Knxd);
        assert_eq!(config.connection.endpoint, "127.0.0.1:6720");
        assert_eq!(config.metrics_prefix, "home_");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.read_startup_interval, DEFAULT_READ_STARTUP_INTERVAL);
        assert_eq!(config.address_configs.len(), 2);

        let light = &config.address_configs["1/1/1"];
        assert!(light.export);
        assert!(!light.read_active);
        assert_eq!(light.metric_type, MetricKind::Gauge);
        assert_eq!(light.max_age, DEFAULT_MAX_AGE);

        let temperature = &config.address_configs["2/0/1"];
        assert!(temperature.read_active);
        assert_eq!(temperature.max_age, Duration::from_secs(120));
        assert_eq!(temperature.labels["room"], "living");

        assert_eq!(config.session.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.session.max_backoff, Duration::from_secs(30));
        assert_eq!(
            config.session.request_timeout,
            crate::constants::DEFAULT_REQUEST_TIMEOUT
        );
    }

    #[test]
    fn test_unquoted_dpt_keeps_sub_number() {
        let text = "connection:\n  endpoint: localhost:6720\naddress_configs:\n  1/1/1:\n    name: x\n    dpt: 1.010\n  1/1/2:\n    name: y\n    dpt: \"14.1200\"\n";
        let config = ExporterConfig::from_yaml_str(text).unwrap();
        assert_eq!(config.address_configs["1/1/1"].dpt, "1.010");
        assert_eq!(config.address_configs["1/1/2"].dpt, "14.1200");
    }

    #[test]
    fn test_missing_connection_is_parse_error() {
        let err = ExporterConfig::from_yaml_str("metrics_prefix: knx_\n").unwrap_err();
        assert!(matches!(err, BridgeError::ConfigParse(_)));
    }

    #[test]
    fn test_validation_rejects_bad_backoff() {
        let text = "connection:\n  endpoint: localhost:6720\nsession:\n  initial_backoff: 10s\n  max_backoff: 1s\n";
        let err = ExporterConfig::from_yaml_str(text).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_from_missing_file() {
        let err = ExporterConfig::from_file("/nonexistent/knx.yaml").unwrap_err();
        assert!(matches!(err, BridgeError::ConfigIo { .. }));
    }

    #[test]
    fn test_parse_durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("ms").is_err());
    }

    #[test]
    fn test_format_durations() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(10)), "10s");
        assert_eq!(format_duration(Duration::from_secs(600)), "10m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
