//! Unit tests for the logging functionality in the `knx-bridge` crate.

use knx_bridge::logging::{init_logger, init_test_logger, log_error, log_info};
use knx_bridge::util::logging::{log_frame_hex, ThrottleManager};
use std::time::Duration;

/// Tests that the logging helpers work as expected after initialization.
#[test]
fn test_logging() {
    init_test_logger();
    log_error("This is an error message");
    log_info("This is an info message");
    log_frame_hex("frame", &[0x00, 0x08, 0x00, 0x27, 0x11, 0x01, 0x0A, 0x03, 0x00, 0x81]);
    log_frame_hex("long frame", &[0xAA; 200]);
}

/// Tests that initializing twice does not panic.
#[test]
fn test_init_logger() {
    init_logger();
    init_logger();
}

/// Tests that throttled categories report how much they dropped.
#[test]
fn test_throttle_reports_suppressed() {
    let manager = ThrottleManager::new(Duration::from_millis(20), 1);
    assert_eq!(manager.allow("2/0/1"), Some(0));
    assert_eq!(manager.allow("2/0/1"), None);
    assert_eq!(manager.allow("2/0/1"), None);
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(manager.allow("2/0/1"), Some(2));
}
