//! # Bridge Error Handling
//!
//! This module defines the BridgeError enum, which represents the different error
//! types that can occur in the knx-bridge crate.
//!
//! Configuration-time variants (`UnknownDatapointType`, `DuplicateMetricIdentity`,
//! `InvalidConfig`, ...) abort startup. Bus-time variants (`SessionUnavailable`,
//! `RequestTimeout`, `SessionClosed`) are logged by the bridge and never reach
//! the scrape path.

use thiserror::Error;

/// Represents the different error types that can occur in the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The payload length does not match the datapoint type's width, or the
    /// value variant does not fit the datapoint type.
    #[error("Malformed payload for DPT {dpt}: {reason}")]
    MalformedPayload { dpt: String, reason: String },

    /// The raw or encoded value lies outside the datapoint type's range.
    #[error("Value out of range for DPT {dpt}: {value}")]
    ValueOutOfRange { dpt: String, value: String },

    /// A configured datapoint type name is not recognized.
    #[error("Unknown datapoint type: {0}")]
    UnknownDatapointType(String),

    /// Two configured addresses produce the same metric name and label set.
    #[error("Duplicate metric identity {metric} for group addresses {first} and {second}")]
    DuplicateMetricIdentity {
        metric: String,
        first: String,
        second: String,
    },

    /// A group address could not be parsed.
    #[error("Invalid group address: {0}")]
    InvalidGroupAddress(String),

    /// The configuration is structurally valid YAML but semantically wrong.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file could not be read.
    #[error("Cannot read configuration file {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("Cannot parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// No bus connection exists at call time.
    #[error("Bus session unavailable")]
    SessionUnavailable,

    /// No response arrived within the request timeout.
    #[error("Read request for {0} timed out")]
    RequestTimeout(String),

    /// The session has been closed.
    #[error("Bus session closed")]
    SessionClosed,

    /// The underlying transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The metrics registry rejected a collector.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl BridgeError {
    /// Returns true for errors that must abort startup.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BridgeError::UnknownDatapointType(_)
                | BridgeError::DuplicateMetricIdentity { .. }
                | BridgeError::InvalidGroupAddress(_)
                | BridgeError::InvalidConfig(_)
                | BridgeError::ConfigIo { .. }
                | BridgeError::ConfigParse(_)
        )
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Transport(err.to_string())
    }
}
