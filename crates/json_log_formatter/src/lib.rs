//! `json_log_formatter` provides a drop-in logging setup for applications built on the
//! [`tracing`] ecosystem, emitting one structured JSON object per log line.
//!
//! It offers:
//! - A [`setup_logger`] function that installs the complete pipeline as the process-wide
//!   subscriber, and an [`update_context`] function to inject context fields which only
//!   become known at runtime (a request ID, for example).
//! - A [`ContextFilter`] which merges environment variables, caller-supplied context and
//!   record attributes into every record, splits oversized messages, materializes attached
//!   errors and marks jobs as failed on critical records.
//! - A [`JsonFormattingLayer`] and a [`SpanStorageLayer`] for consumers that prefer to
//!   assemble their own [`tracing_subscriber::Registry`].
//!
//! Records are shaped in-process only: transport, storage and rotation of the produced
//! lines are left to whatever consumes the standard error stream.

mod context;
mod filter;
mod formatter;
mod record;
mod setup;
mod storage;

pub use tracing::Level;

pub use self::{
    context::{ContextSnapshot, OutputFormat, SharedContext, INCLUDED_ENV_VARS},
    filter::{ContextFilter, FilteredRecord},
    formatter::JsonFormattingLayer,
    record::{ExceptionInfo, LogRecord, Severity},
    setup::{setup_logger, update_context, LoggerConfig, LoggingService},
    storage::SpanStorageLayer,
};

#[doc(hidden)]
pub use tracing as __tracing;

mod keys {
    use std::sync::LazyLock;

    use rustc_hash::FxHashSet;

    pub(crate) const MESSAGE: &str = "message";
    pub(crate) const LEVEL: &str = "level";
    pub(crate) const LOGGER: &str = "logger";
    pub(crate) const TIME: &str = "time";
    pub(crate) const FILE: &str = "file";
    pub(crate) const LINE: &str = "line";
    pub(crate) const PID: &str = "pid";
    pub(crate) const HOSTNAME: &str = "hostname";
    pub(crate) const FORMATTER_VERSION: &str = "log_formatter_version";

    pub(crate) const APP: &str = "app";
    pub(crate) const VERSION: &str = "version";
    pub(crate) const PIPELINE_STATUS: &str = "pipeline_status";
    pub(crate) const JOB_STATUS: &str = "job_status";
    pub(crate) const JOB_REMAINING_RETRIES: &str = "job_remaining_retries";
    pub(crate) const ORIGINAL_LEVEL: &str = "original_level";
    pub(crate) const FILTER_IMPORTED_MODULES: &str = "filter_imported_modules";
    pub(crate) const FILTER_ERROR: &str = "filter_error";

    /// Event field which escalates an event to [`Severity::Critical`][crate::Severity].
    pub(crate) const CRITICAL: &str = "critical";

    pub(crate) const FAILED: &str = "failed";

    pub(crate) static IMPLICIT_KEYS: LazyLock<FxHashSet<&'static str>> = LazyLock::new(|| {
        [
            MESSAGE,
            LEVEL,
            LOGGER,
            TIME,
            FILE,
            LINE,
            PID,
            HOSTNAME,
            FORMATTER_VERSION,
        ]
        .iter()
        .copied()
        .collect()
    });

    /// Keys which must be present on every record and thus can never be excluded.
    pub(crate) const NON_EXCLUDABLE_KEYS: [&str; 2] = [MESSAGE, LEVEL];
}

/// Errors that can occur within the logger.
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    /// Represents an error in configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Represents an error during JSON serialization.
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    /// Represents an error due to an invalid filtering directive.
    #[error("Failed to parse filtering directive: {0}")]
    InvalidFilteringDirective(#[from] tracing_subscriber::filter::ParseError),

    /// Represents a failure to install the process-wide subscriber, usually because
    /// another subscriber has already been installed by the host application.
    #[error("Failed to install the global subscriber: {0}")]
    SubscriberInitialization(#[from] tracing_subscriber::util::TryInitError),

    /// Represents a failure to swap the severity filter of an already installed logger.
    #[error("Failed to reload the severity filter: {0}")]
    FilterReload(#[from] tracing_subscriber::reload::Error),

    /// Represents a message template which could not be rendered with its arguments.
    #[error("Failed to render message template: {0}")]
    MessageRendering(String),
}

/// Emits an event at [`Severity::Critical`].
///
/// Critical records mark the running pipeline and job as failed. The event is emitted as
/// an `ERROR` level [`tracing`] event carrying the `critical = true` field, which the
/// [`ContextFilter`] consumes.
///
/// ```
/// json_log_formatter::critical!("disk full");
/// json_log_formatter::critical!(mount = "/data", "disk full");
/// ```
#[macro_export]
macro_rules! critical {
    ($($arg:tt)+) => {
        $crate::__tracing::error!(critical = true, $($arg)+)
    };
}
