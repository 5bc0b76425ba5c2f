//! The record abstraction shaped by the [`ContextFilter`][crate::ContextFilter].

use std::{collections::BTreeMap, error::Error, fmt, str::FromStr};

use serde::Deserialize;
use serde_json::Value;
use time::UtcDateTime;
use tracing::Level;

/// Ordered severity of a log record.
///
/// Each variant carries a numeric value (see [`Severity::value`]) leaving room between the
/// levels, so that comparisons read the same way as the numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Severity {
    /// Very verbose diagnostics.
    Trace,

    /// Diagnostics useful while developing.
    Debug,

    /// Informational messages.
    #[default]
    Info,

    /// Something unexpected which the application could handle.
    Warning,

    /// An operation failed.
    Error,

    /// The application cannot continue. Marks the pipeline and job as failed.
    Critical,
}

impl Severity {
    /// Numeric value of the severity.
    pub fn value(self) -> u8 {
        match self {
            Self::Trace => 5,
            Self::Debug => 10,
            Self::Info => 20,
            Self::Warning => 30,
            Self::Error => 40,
            Self::Critical => 50,
        }
    }

    /// Name of the severity as it appears in the `level` output field.
    pub fn name(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    /// The most verbose [`Level`] which can still produce records of this severity.
    pub(crate) fn as_level(self) -> Level {
        match self {
            Self::Trace => Level::TRACE,
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }
}

impl From<Level> for Severity {
    fn from(level: Level) -> Self {
        match level {
            Level::TRACE => Self::Trace,
            Level::DEBUG => Self::Debug,
            Level::INFO => Self::Info,
            Level::WARN => Self::Warning,
            Level::ERROR => Self::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TRACE" => Ok(Self::Trace),
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {s}")),
        }
    }
}

impl TryFrom<String> for Severity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Error information attached to a record: the error message and its chain of sources.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExceptionInfo {
    message: String,
    causes: Vec<String>,
}

impl ExceptionInfo {
    /// Creates exception information without any causes.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Appends a cause to the chain.
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Captures an error together with every error in its [`Error::source`] chain.
    pub fn from_error(error: &(dyn Error + 'static)) -> Self {
        let mut info = Self::new(error.to_string());
        let mut source = error.source();
        while let Some(cause) = source {
            info.causes.push(cause.to_string());
            source = cause.source();
        }
        info
    }

    /// Renders the trace text which ends up in the `message` field.
    ///
    /// ```text
    /// Error: failed to load configuration
    /// Caused by:
    ///     0: failed to read file
    ///     1: permission denied
    /// ```
    pub fn render(&self) -> String {
        let mut trace = format!("Error: {}", self.message);
        if !self.causes.is_empty() {
            trace.push_str("\nCaused by:");
            for (index, cause) in self.causes.iter().enumerate() {
                trace.push_str(&format!("\n    {index}: {cause}"));
            }
        }
        trace
    }
}

/// One logging call, as handed to the [`ContextFilter`][crate::ContextFilter].
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Severity of the record.
    pub severity: Severity,

    /// The message, possibly a template with `{name}` placeholders for [`LogRecord::args`].
    pub message: String,

    /// Named arguments for the message template. Each argument is also emitted as an
    /// individual field.
    pub args: BTreeMap<String, Value>,

    /// Name of the emitting logger (the `tracing` target).
    pub logger: String,

    /// Time the record was created.
    pub timestamp: UtcDateTime,

    /// Source file of the logging call, if known.
    pub file: Option<String>,

    /// Source line of the logging call, if known.
    pub line: Option<u32>,

    /// Error attached to the record.
    pub exception: Option<ExceptionInfo>,

    /// Arbitrary attributes attached by the caller or enclosing spans.
    pub attributes: BTreeMap<String, Value>,
}

impl LogRecord {
    /// Creates a record created now, without arguments, attributes or exception.
    pub fn new(severity: Severity, logger: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            args: BTreeMap::new(),
            logger: logger.into(),
            timestamp: UtcDateTime::now(),
            file: None,
            line: None,
            exception: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Attaches an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Attaches a named message argument.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Attaches exception information.
    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }

    /// Renders the message, substituting `{name}` placeholders with [`LogRecord::args`].
    ///
    /// Records without arguments are returned verbatim, braces included.
    pub(crate) fn render_message(&self) -> Result<String, crate::LoggerError> {
        if self.args.is_empty() {
            return Ok(self.message.clone());
        }

        let mut rendered = String::with_capacity(self.message.len());
        let mut chars = self.message.chars();
        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('{') if name.is_empty() => {
                                rendered.push('{');
                                break;
                            }
                            Some('}') => {
                                let value = self.args.get(&name).ok_or_else(|| {
                                    crate::LoggerError::MessageRendering(format!(
                                        "no argument named `{name}` for message `{}`",
                                        self.message
                                    ))
                                })?;
                                match value {
                                    Value::String(s) => rendered.push_str(s),
                                    other => rendered.push_str(&other.to_string()),
                                }
                                break;
                            }
                            Some(c) => name.push(c),
                            None => {
                                return Err(crate::LoggerError::MessageRendering(format!(
                                    "unclosed `{{` in message `{}`",
                                    self.message
                                )));
                            }
                        }
                    }
                }
                '}' => {
                    if chars.next() != Some('}') {
                        return Err(crate::LoggerError::MessageRendering(format!(
                            "unmatched `}}` in message `{}`",
                            self.message
                        )));
                    }
                    rendered.push('}');
                }
                c => rendered.push(c),
            }
        }
        Ok(rendered)
    }
}
