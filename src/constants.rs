//! Bridge Constants
//!
//! Defaults for the exporter configuration and the knxd group socket protocol.

use std::time::Duration;

/// Prefix prepended to every configured metric name.
pub const DEFAULT_METRICS_PREFIX: &str = "knx_";

/// Default HTTP port for the `/metrics` endpoint.
pub const DEFAULT_EXPORTER_PORT: u16 = 8080;

/// Age after which an actively read value is considered stale and re-read.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(600);

/// Tick of the active poll loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Spacing between the one-shot reads issued at startup.
pub const DEFAULT_READ_STARTUP_INTERVAL: Duration = Duration::from_millis(200);

/// First reconnect delay after a failed connection attempt.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound of the reconnect delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Time to wait for a GroupValueResponse.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the inbound telegram channel.
pub const DEFAULT_TELEGRAM_BUFFER: usize = 256;

/// Label carrying the group address on every exported value.
pub const GROUP_ADDRESS_LABEL: &str = "group_address";

/// Label carrying the text of string datapoints.
pub const TEXT_VALUE_LABEL: &str = "value";

// Names of the bridge's own metrics, appended to the configured prefix.
pub const BUS_CONNECTED_METRIC: &str = "bus_connected";
pub const MESSAGES_METRIC: &str = "messages_total";
pub const POLL_REQUESTS_METRIC: &str = "poll_requests_total";
pub const VALUE_STALE_METRIC: &str = "value_stale";

/// Metric names that configured addresses may not use.
pub const RESERVED_METRIC_NAMES: [&str; 4] = [
    BUS_CONNECTED_METRIC,
    MESSAGES_METRIC,
    POLL_REQUESTS_METRIC,
    VALUE_STALE_METRIC,
];

// ----------------------------------------------------------------------------
// knxd group socket protocol
// ----------------------------------------------------------------------------

/// Opens a group socket (`EIB_OPEN_GROUPCON`).
pub const KNXD_OPEN_GROUPCON: u16 = 0x0026;

/// Group telegram in either direction (`EIB_GROUP_PACKET`).
pub const KNXD_GROUP_PACKET: u16 = 0x0027;

/// Largest knxd message we accept.
pub const KNXD_MAX_MESSAGE_LEN: usize = 256;

// APCI codes for group communication (4-bit, split across two APDU bytes)
pub const APCI_GROUP_VALUE_READ: u8 = 0x0;
pub const APCI_GROUP_VALUE_RESPONSE: u8 = 0x1;
pub const APCI_GROUP_VALUE_WRITE: u8 = 0x2;

/// Mask of the 6-bit data carried inside the APCI byte.
pub const APCI_SHORT_DATA_MASK: u8 = 0x3F;
