//! One-time installation of the logging pipeline as the process-wide subscriber.

use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    sync::{Mutex, PoisonError},
};

use serde::Deserialize;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter,
    Registry,
};

use crate::{
    context::{build_context, validate_excluded_keys, ContextSnapshot, OutputFormat, SharedContext},
    JsonFormattingLayer, LoggerError, Severity, SpanStorageLayer,
};

/// The installed logging pipeline, if [`setup_logger`] has been called.
static LOGGING_SERVICE: Mutex<Option<LoggingService>> = Mutex::new(None);

/// Configuration of the process-wide logging pipeline.
///
/// All fields but `version` have defaults, so configurations can be deserialized from
/// partial configuration files.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Version of the embedding application, included in every record as `version`.
    /// Required.
    pub version: String,

    /// Name of the embedding application, included in every record as `app`.
    pub app: Option<String>,

    /// Additional context fields included in every record. These take precedence over
    /// environment variables of the same name.
    pub extra_context: BTreeMap<String, String>,

    /// Minimum severity of emitted records.
    pub logging_level: Severity,

    /// An [`EnvFilter`] directive (e.g., `"info,hyper=warn"`) for per-target filtering.
    /// `logging_level` is used for targets the directive does not mention. A directive can
    /// lower the level of a target below `logging_level`, unless `logging_level` is
    /// [`Severity::Critical`].
    pub filtering_directive: Option<String>,

    /// Write human-readable lines instead of JSON. When unset, the
    /// `DISABLE_LOG_FORMATTING` environment variable decides.
    pub disable_log_formatting: Option<bool>,

    /// Keys which never appear in the output, whether set by records or by the context.
    pub excluded_logging_context_keys: Vec<String>,

    /// Maximum message length, in characters, before a message is split into several
    /// records.
    pub split_threshold: NonZeroUsize,

    /// Emit attached errors as separate records following the message, instead of
    /// appending them to the message.
    pub ex_trace_as_new_message: bool,

    /// Logger name prefixes of first-party code. When non-empty, errors and critical
    /// records of any other logger are demoted to warnings, so that failures inside
    /// dependencies do not mark the job as failed.
    pub first_party_targets: Vec<String>,
}

impl LoggerConfig {
    /// Creates a configuration with default settings for the given application version.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Self::default()
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            version: String::new(),
            app: None,
            extra_context: BTreeMap::new(),
            logging_level: Severity::Info,
            filtering_directive: None,
            disable_log_formatting: None,
            excluded_logging_context_keys: Vec::new(),
            split_threshold: ContextSnapshot::DEFAULT_SPLIT_THRESHOLD,
            ex_trace_as_new_message: false,
            first_party_targets: Vec::new(),
        }
    }
}

/// Handle to the installed logging pipeline.
#[derive(Clone, Debug)]
pub struct LoggingService {
    shared: SharedContext,
    filter_handle: reload::Handle<EnvFilter, Registry>,
}

impl LoggingService {
    /// Merges fields into the context of every record emitted from now on, by any thread.
    pub fn update_context<I, K, V>(&self, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.shared.update_context(fields);
    }

    /// The shared context of the installed pipeline.
    pub fn shared_context(&self) -> &SharedContext {
        &self.shared
    }

    fn reconfigure(&self, prepared: PreparedConfig) -> Result<(), LoggerError> {
        self.filter_handle.reload(prepared.filter)?;
        self.shared.store(prepared.snapshot);
        Ok(())
    }
}

/// A validated configuration, ready to be installed.
#[derive(Debug)]
struct PreparedConfig {
    snapshot: ContextSnapshot,
    filter: EnvFilter,
    diagnostics: Vec<String>,
}

fn prepare(
    config: LoggerConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PreparedConfig, LoggerError> {
    let version = config.version.trim();
    if version.is_empty() {
        return Err(LoggerError::Configuration(
            "`version` is required and must not be empty".to_string(),
        ));
    }
    validate_excluded_keys(&config.excluded_logging_context_keys)?;

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.logging_level.as_level()).into())
        .parse(config.filtering_directive.as_deref().unwrap_or_default())?; // Using an empty string causes it to use the default directive

    let (context, diagnostics) = build_context(
        &config.extra_context,
        config.app.as_deref(),
        version,
        &lookup,
    );

    let min_severity = min_severity(&config);
    let snapshot = ContextSnapshot {
        context,
        excluded_keys: config.excluded_logging_context_keys,
        split_threshold: config.split_threshold,
        ex_trace_as_new_message: config.ex_trace_as_new_message,
        first_party_targets: config.first_party_targets,
        min_severity,
        output_format: OutputFormat::resolve(config.disable_log_formatting, &lookup),
    };

    Ok(PreparedConfig {
        snapshot,
        filter,
        diagnostics,
    })
}

/// Severity below which the formatting layer drops records which the [`EnvFilter`] let
/// through.
///
/// Without a directive this is the configured level. With a directive, per-target levels
/// are left to the filter alone, except for [`Severity::Critical`], which the filter cannot
/// express.
fn min_severity(config: &LoggerConfig) -> Severity {
    match (&config.filtering_directive, config.logging_level) {
        (None, level) | (Some(_), level @ Severity::Critical) => level,
        (Some(_), _) => Severity::Trace,
    }
}

fn install(prepared: PreparedConfig) -> Result<LoggingService, LoggerError> {
    let shared = SharedContext::new(prepared.snapshot);
    let (filter_layer, filter_handle) = reload::Layer::new(prepared.filter);
    let formatting_layer = JsonFormattingLayer::new(
        shared.clone(),
        std::io::stderr,
        serde_json::ser::CompactFormatter,
    )?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(SpanStorageLayer::new())
        .with(formatting_layer)
        .try_init()?;

    Ok(LoggingService {
        shared,
        filter_handle,
    })
}

/// Configures process-wide logging: every [`tracing`] event (and every `log` record) of the
/// process is passed through a [`ContextFilter`][crate::ContextFilter] and written to
/// standard error, as JSON unless formatting is disabled.
///
/// Call this once, at the very start of `main`, before anything is logged. Calling it
/// again reconfigures the installed pipeline: the last call wins, including its context.
///
/// # Example
///
/// ```
/// use json_log_formatter::{setup_logger, LoggerConfig};
///
/// let logging = setup_logger(LoggerConfig {
///     app: Some("svc".to_string()),
///     ..LoggerConfig::new("1.0.0")
/// })?;
///
/// tracing::info!("hello");
///
/// logging.update_context([("request_id", "abc")]);
/// tracing::info!("handling request");
/// # Ok::<(), json_log_formatter::LoggerError>(())
/// ```
///
/// # Errors
///
/// Returns [`LoggerError`] if the configuration is invalid (e.g., an empty `version`, an
/// excluded `message` key or an invalid filtering directive), or if a subscriber not
/// installed by this function is already set as the global default.
pub fn setup_logger(config: LoggerConfig) -> Result<LoggingService, LoggerError> {
    let prepared = prepare(config, |key| std::env::var(key).ok())?;
    let diagnostics = prepared.diagnostics.clone();

    let service = {
        let mut installed = LOGGING_SERVICE
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match installed.as_ref() {
            Some(service) => {
                service.reconfigure(prepared)?;
                service.clone()
            }
            None => {
                let service = install(prepared)?;
                *installed = Some(service.clone());
                service
            }
        }
    };

    for diagnostic in diagnostics {
        tracing::warn!("{diagnostic}");
    }

    Ok(service)
}

/// Merges fields into the context of every record emitted from now on, process-wide.
///
/// Existing keys are overwritten. Records emitted before the call are not affected.
///
/// # Errors
///
/// Returns [`LoggerError::Configuration`] if [`setup_logger`] has not been called yet.
pub fn update_context<I, K, V>(fields: I) -> Result<(), LoggerError>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let service = LOGGING_SERVICE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or_else(|| {
            LoggerError::Configuration(
                "`setup_logger` must be called before updating the logging context".to_string(),
            )
        })?;

    service.update_context(fields);
    Ok(())
}
