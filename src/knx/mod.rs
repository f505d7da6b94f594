//! The knx module contains the bus-facing components: addressing, group
//! telegrams, the transport seam with its knxd and mock implementations, and the
//! reconnecting bus session.

pub mod address;
pub mod knxd;
pub mod mock;
pub mod session;
pub mod telegram;
pub mod transport;

pub use address::{GroupAddress, IndividualAddress};
pub use session::{BusSession, SessionConfig, SessionState, TelegramStream};
pub use telegram::{Telegram, TelegramKind};
pub use transport::{BusConnection, BusTransport};
