//! # Bus Transport
//!
//! The bus session talks to the bus only through these two traits, which keeps
//! the physical protocol (knxd socket, KNXnet/IP tunnel, test double) out of the
//! session logic.

use crate::config::{ConnectionConfig, ConnectionType};
use crate::error::BridgeError;
use crate::knx::address::GroupAddress;
use crate::knx::knxd::KnxdTransport;
use crate::knx::telegram::Telegram;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Opens connections to the bus. Called again after every connection loss.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Performs the transport handshake and returns a live connection.
    async fn connect(&self) -> Result<Box<dyn BusConnection>, BridgeError>;

    /// Human readable endpoint used in log messages.
    fn describe(&self) -> String;
}

/// One live connection to the bus.
#[async_trait]
pub trait BusConnection: Send {
    /// Sends a GroupValueRead for `address`. The answer arrives through
    /// [`BusConnection::recv`] as a response telegram.
    async fn send_read(&mut self, address: GroupAddress) -> Result<(), BridgeError>;

    /// Waits for the next group telegram.
    ///
    /// Must be cancel-safe: the session polls it inside `tokio::select!` and a
    /// telegram must not be lost when another branch wins.
    /// An error means the connection is gone.
    async fn recv(&mut self) -> Result<Telegram, BridgeError>;

    /// Closes the connection.
    async fn close(&mut self) -> Result<(), BridgeError>;
}

/// Builds the transport selected by `connection.type`.
pub fn from_config(connection: &ConnectionConfig, handshake_timeout: Duration) -> Arc<dyn BusTransport> {
    match connection.kind {
        ConnectionType::Knxd => Arc::new(KnxdTransport::new(
            connection.endpoint.clone(),
            handshake_timeout,
        )),
    }
}
