//! Process-wide context shared by every record, and the environment it is seeded from.

use std::{collections::BTreeMap, num::NonZeroUsize, sync::Arc};

use arc_swap::ArcSwap;

use crate::{keys, LoggerError, Severity};

/// Environment variables which are added to the context when set.
pub const INCLUDED_ENV_VARS: [&str; 13] = [
    "ENVIRONMENT",
    "env",
    "JOB_INDEX",
    JOB_RETRY_COUNT_ENV,
    "JOB_MODE",
    JOB_RETRY_LIMIT_ENV,
    "CE_DOMAIN",
    "CE_JOB",
    "CE_JOBRUN",
    "CE_SUBDOMAIN",
    "HOSTNAME",
    "BRANCH_NAME",
    "TARGET_BRANCH_NAME",
];

/// Current retry of a job, as provided by the job runtime.
const JOB_RETRY_COUNT_ENV: &str = "JOB_INDEX_RETRY_COUNT";

/// Maximum number of retries of a job, as provided by the job runtime.
const JOB_RETRY_LIMIT_ENV: &str = "JOB_RETRY_LIMIT";

/// Environment flag which disables JSON formatting when not explicitly configured.
pub(crate) const DISABLE_LOG_FORMATTING_ENV: &str = "DISABLE_LOG_FORMATTING";

/// Output representation of filtered records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// One compact JSON object per line.
    #[default]
    Json,

    /// Human-readable `<time> <logger>] <LEVEL>: <message>` lines, for local development.
    Plain,
}

impl OutputFormat {
    /// Resolves the output format from the explicit setting and the environment.
    ///
    /// The [`DISABLE_LOG_FORMATTING_ENV`] flag is only consulted when formatting was not
    /// explicitly enabled.
    pub(crate) fn resolve(
        disable_log_formatting: Option<bool>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let disabled = match disable_log_formatting {
            Some(disabled) => disabled,
            None => lookup(DISABLE_LOG_FORMATTING_ENV).is_some_and(|value| is_truthy(&value)),
        };
        if disabled {
            Self::Plain
        } else {
            Self::Json
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// An immutable view of everything the [`ContextFilter`][crate::ContextFilter] needs to
/// process a record.
///
/// A snapshot is never mutated in place: updates publish a new snapshot, so a record is
/// always processed against one consistent state.
#[derive(Clone, Debug)]
pub struct ContextSnapshot {
    /// Context fields merged into every record.
    pub context: BTreeMap<String, String>,

    /// Keys which never appear in the output.
    pub excluded_keys: Vec<String>,

    /// Maximum message length, in characters, of a single output record.
    pub split_threshold: NonZeroUsize,

    /// Emit attached errors as separate records instead of appending them to the message.
    pub ex_trace_as_new_message: bool,

    /// Logger name prefixes of first-party code. When non-empty, errors from any other
    /// logger are demoted to warnings.
    pub first_party_targets: Vec<String>,

    /// Records below this severity are dropped.
    pub min_severity: Severity,

    /// Output representation of records.
    pub output_format: OutputFormat,
}

impl ContextSnapshot {
    /// The default maximum message length of a single output record.
    pub const DEFAULT_SPLIT_THRESHOLD: NonZeroUsize = match NonZeroUsize::new(3000) {
        Some(threshold) => threshold,
        None => NonZeroUsize::MIN,
    };
}

impl Default for ContextSnapshot {
    fn default() -> Self {
        Self {
            context: BTreeMap::new(),
            excluded_keys: Vec::new(),
            split_threshold: Self::DEFAULT_SPLIT_THRESHOLD,
            ex_trace_as_new_message: false,
            first_party_targets: Vec::new(),
            min_severity: Severity::default(),
            output_format: OutputFormat::default(),
        }
    }
}

/// Handle to the shared, atomically swapped [`ContextSnapshot`].
///
/// Cloning the handle shares the underlying state: an update through any clone is
/// visible to every [`ContextFilter`][crate::ContextFilter] built from it.
#[derive(Clone, Debug)]
pub struct SharedContext {
    inner: Arc<ArcSwap<ContextSnapshot>>,
}

impl SharedContext {
    /// Creates shared state holding the given snapshot.
    pub fn new(snapshot: ContextSnapshot) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    /// Returns the current snapshot.
    pub fn load(&self) -> Arc<ContextSnapshot> {
        self.inner.load_full()
    }

    /// Replaces the whole snapshot.
    pub fn store(&self, snapshot: ContextSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }

    /// Merges fields into the context: new keys are added, existing keys overwritten.
    ///
    /// Concurrent updates are applied one after the other, none of them is lost.
    /// Records processed before this call returns may or may not carry the new fields;
    /// records emitted afterwards always do.
    pub fn update_context<I, K, V>(&self, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields: Vec<(String, String)> = fields
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();

        self.inner.rcu(|current| {
            let mut next = ContextSnapshot::clone(current);
            next.context.extend(fields.iter().cloned());
            next
        });
    }
}

impl Default for SharedContext {
    fn default() -> Self {
        Self::new(ContextSnapshot::default())
    }
}

/// Ensures that no key required on every record is excluded from the output.
pub(crate) fn validate_excluded_keys(excluded_keys: &[String]) -> Result<(), LoggerError> {
    match excluded_keys
        .iter()
        .find(|key| keys::NON_EXCLUDABLE_KEYS.contains(&key.as_str()))
    {
        Some(key) => Err(LoggerError::Configuration(format!(
            "The key `{key}` is present on every record and cannot be excluded"
        ))),
        None => Ok(()),
    }
}

/// Builds the initial context from the environment, caller-supplied fields and the
/// application identity.
///
/// Caller-supplied fields take precedence over environment variables. `app` and `version`
/// take precedence over both. Returns the context and diagnostics which should be logged
/// once logging is available.
pub(crate) fn build_context(
    extra_context: &BTreeMap<String, String>,
    app: Option<&str>,
    version: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> (BTreeMap<String, String>, Vec<String>) {
    let mut context = extra_context.clone();
    let mut diagnostics = Vec::new();

    for key in INCLUDED_ENV_VARS {
        let Some(value) = lookup(key).filter(|value| !value.is_empty()) else {
            continue;
        };
        if context.contains_key(key) {
            diagnostics.push(format!(
                "Context key `{key}` set by both caller and environment, skipping environment \
                 value"
            ));
            continue;
        }
        context.insert(key.to_string(), value);
    }

    match remaining_job_retries(&lookup) {
        Ok(Some(remaining)) => {
            context.insert(keys::JOB_REMAINING_RETRIES.to_string(), remaining.to_string());
        }
        Ok(None) => (),
        Err(diagnostic) => diagnostics.push(diagnostic),
    }

    if let Some(app) = app {
        context.insert(keys::APP.to_string(), app.to_string());
    }
    context.insert(keys::VERSION.to_string(), version.to_string());

    (context, diagnostics)
}

/// Remaining retries of the current job, when the job runtime provides both the retry
/// count and the retry limit.
fn remaining_job_retries(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<i64>, String> {
    let (Some(count), Some(limit)) = (lookup(JOB_RETRY_COUNT_ENV), lookup(JOB_RETRY_LIMIT_ENV))
    else {
        return Ok(None);
    };

    let parse = |name: &str, value: &str| {
        value.trim().parse::<i64>().map_err(|error| {
            format!(
                "Unable to calculate remaining job retries, `{name}` is not an integer \
                 (`{value}`): {error}"
            )
        })
    };

    let count = parse(JOB_RETRY_COUNT_ENV, &count)?;
    let limit = parse(JOB_RETRY_LIMIT_ENV, &limit)?;
    Ok(Some(limit - count))
}
