//! # Utility Modules
//!
//! Helpers shared across the crate that belong to no single component.

pub mod logging;

pub use logging::{log_frame_hex, LogThrottle, ThrottleManager};
