//! # knx-bridge - KNX Group Values as Prometheus Metrics
//!
//! The knx-bridge crate listens to a KNX installation through knxd, decodes the
//! group telegrams of configured group addresses according to their datapoint
//! types, and exposes the latest values as Prometheus metrics.
//!
//! ## Features
//!
//! - Decode and encode the common KNX datapoint types (DPT 1, 5-9, 12-14, 16, 17, 20)
//! - Map group addresses to metric names, help texts and static labels
//! - Keep the latest value per address in a lock-per-address cache
//! - Survive bus outages with a reconnecting session and bounded backoff
//! - Actively read addresses periodically or once at startup
//! - Serve the registry over HTTP on `/metrics`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use knx_bridge::{init_logger, ExporterConfig, MetricsBridge, Poller};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), knx_bridge::BridgeError> {
//! init_logger();
//! let config = ExporterConfig::from_file("config.yaml")?;
//! let bridge = MetricsBridge::from_config(config)?;
//! let registry = prometheus::Registry::new();
//! bridge.register_into(&registry)?;
//!
//! let runner = bridge.clone();
//! tokio::spawn(async move { runner.run().await });
//! let poller = Poller::new(bridge.clone());
//! poller.start();
//!
//! tokio::signal::ctrl_c().await?;
//! poller.stop().await;
//! bridge.close().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod cache;
pub mod collector;
pub mod config;
pub mod constants;
pub mod dpt;
pub mod error;
pub mod exposition;
pub mod knx;
pub mod logging;
pub mod mapping;
pub mod poller;
pub mod util;

pub use crate::error::BridgeError;
pub use crate::logging::{init_logger, log_info};

pub use bridge::MetricsBridge;
pub use cache::{CachedValue, ValueCache};
pub use config::{AddressConfig, ConnectionConfig, ExporterConfig};
pub use dpt::{DatapointType, DatapointValue};
pub use knx::{BusSession, GroupAddress, SessionState, Telegram, TelegramKind};
pub use mapping::{AddressMapping, MetricDescriptor, MetricKind};
pub use poller::Poller;

/// Decodes a group value payload.
///
/// # Arguments
/// * `payload` - Value bytes of a GroupValueWrite or GroupValueResponse
/// * `dpt` - Datapoint type, e.g. `"9.001"`
pub fn decode_value(payload: &[u8], dpt: &str) -> Result<DatapointValue, BridgeError> {
    dpt::codec::decode(payload, dpt.parse()?)
}

/// Encodes a value into group value payload bytes.
pub fn encode_value(value: &DatapointValue, dpt: &str) -> Result<Vec<u8>, BridgeError> {
    dpt::codec::encode(value, dpt.parse()?)
}
