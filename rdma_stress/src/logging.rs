//! Logging initialization.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Result, StressError};

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set. Calling this twice is
/// an error, since only one global subscriber may exist.
pub fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| StressError::Config(format!("logging already initialized: {e}")))
}

/// Install a subscriber that writes through the test harness capture.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        init_test_logging();
        assert!(init_logging("info").is_err());
    }
}
