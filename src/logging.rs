use env_logger::Env;
use log::{error, info, log_enabled, Level};

/// Initializes the logger with the `env_logger` crate.
///
/// The level comes from `RUST_LOG` and defaults to `info`. Calling it again is
/// harmless.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Initializes the logger for tests: captured output, `debug` by default.
pub fn init_test_logger() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}

/// Logs an error message.
pub fn log_error(message: &str) {
    if log_enabled!(Level::Error) {
        error!("{message}");
    }
}

/// Logs an informational message.
pub fn log_info(message: &str) {
    if log_enabled!(Level::Info) {
        info!("{message}");
    }
}
