//! Emits a few records the way a typical batch job would.
//!
//! Run with `DISABLE_LOG_FORMATTING=1` to see the human-readable output instead.

use std::{collections::BTreeMap, error::Error, io};

use json_log_formatter::{critical, setup_logger, update_context, LoggerConfig, LoggerError};

fn main() -> Result<(), LoggerError> {
    setup_logger(LoggerConfig {
        app: Some("json_log_formatter_demo".to_string()),
        extra_context: BTreeMap::from([("team".to_string(), "data-platform".to_string())]),
        split_threshold: std::num::NonZeroUsize::new(500).unwrap_or(std::num::NonZeroUsize::MIN),
        ..LoggerConfig::new(env!("CARGO_PKG_VERSION"))
    })?;

    tracing::info!(test = "testval1", "test");

    update_context([("SOURCE_BRANCH", "test"), ("TARGET_BRANCH", "test2")])?;

    tracing::error!(test2 = "testval_2", "error-test");

    let error = io::Error::new(io::ErrorKind::InvalidInput, "testError");
    let error: &(dyn Error + 'static) = &error;
    critical!(error, "CRITICAL FAILURE: Completely aborted: Failed to execute.");

    tracing::info!("{}", "ABAC".repeat(500));

    Ok(())
}
