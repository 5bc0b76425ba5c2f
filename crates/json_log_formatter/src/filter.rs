//! The record-transformation pipeline every record passes through before formatting.

use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use serde_json::Value;
use time::format_description::well_known::Iso8601;

use crate::{
    context::{ContextSnapshot, SharedContext},
    keys, LogRecord, LoggerError, Severity,
};

/// One output record produced by the [`ContextFilter`].
#[derive(Clone, Debug, PartialEq)]
pub struct FilteredRecord {
    /// Severity after filtering, which may differ from the severity of the input record.
    pub severity: Severity,

    /// The message, or one chunk of it.
    pub message: String,

    /// Every other output field, including `level`, `logger` and `time`.
    pub fields: BTreeMap<String, Value>,
}

/// Merges the shared context into records and applies the record policies.
///
/// For every record, in order:
/// 1. Record attributes, message arguments and the shared context are merged. Record
///    attributes win over context fields, implicit fields (`level`, `logger`, `time`, ...)
///    win over both.
/// 2. Errors from loggers outside of the configured first-party targets are demoted to
///    warnings.
/// 3. Critical records get `pipeline_status` and `job_status` set to `failed`.
/// 4. Excluded keys are removed.
/// 5. Attached exception information is appended to the message, or emitted as separate
///    records following the message records.
/// 6. Messages longer than the split threshold are split into several records carrying
///    identical fields.
///
/// Filtering never fails: should any step fail (or panic), the record is passed through
/// with minimal fields, followed by a diagnostic record describing the failure.
#[derive(Clone, Debug)]
pub struct ContextFilter {
    shared: SharedContext,
    pid: u32,
    hostname: String,
}

impl ContextFilter {
    /// Creates a filter reading its settings from the given shared context.
    pub fn new(shared: SharedContext) -> Self {
        Self {
            shared,
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }

    /// The shared context this filter reads from.
    pub fn shared_context(&self) -> &SharedContext {
        &self.shared
    }

    /// Processes a record against the current snapshot of the shared context.
    pub fn filter(&self, record: &LogRecord) -> Vec<FilteredRecord> {
        self.filter_with(&self.shared.load(), record)
    }

    /// Processes a record against the given snapshot.
    pub(crate) fn filter_with(
        &self,
        snapshot: &Arc<ContextSnapshot>,
        record: &LogRecord,
    ) -> Vec<FilteredRecord> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.try_filter(snapshot, record)));
        match result {
            Ok(Ok(records)) => records,
            Ok(Err(error)) => self.fallback(snapshot, record, &error.to_string()),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.fallback(
                    snapshot,
                    record,
                    &format!("panic while filtering record: {reason}"),
                )
            }
        }
    }

    fn try_filter(
        &self,
        snapshot: &ContextSnapshot,
        record: &LogRecord,
    ) -> Result<Vec<FilteredRecord>, LoggerError> {
        let message = record.render_message()?;

        // Context first, so that record attributes and arguments override it.
        let mut fields: BTreeMap<String, Value> = snapshot
            .context
            .iter()
            .filter(|(key, _)| !keys::IMPLICIT_KEYS.contains(key.as_str()))
            .map(|(key, value)| (key.clone(), Value::from(value.as_str())))
            .collect();
        for (key, value) in record.attributes.iter().chain(record.args.iter()) {
            if !keys::IMPLICIT_KEYS.contains(key.as_str()) {
                fields.insert(key.clone(), value.clone());
            }
        }

        let mut severity = record.severity;
        if severity >= Severity::Error && !is_first_party(snapshot, &record.logger) {
            fields.insert(
                keys::ORIGINAL_LEVEL.to_string(),
                Value::from(severity.name()),
            );
            fields.insert(
                keys::FILTER_IMPORTED_MODULES.to_string(),
                Value::from("Filtered"),
            );
            severity = Severity::Warning;
        }

        if severity >= Severity::Critical {
            fields.insert(keys::PIPELINE_STATUS.to_string(), Value::from(keys::FAILED));
            fields.insert(keys::JOB_STATUS.to_string(), Value::from(keys::FAILED));
        } else {
            fields.remove(keys::PIPELINE_STATUS);
            fields.remove(keys::JOB_STATUS);
        }

        self.insert_implicit_fields(&mut fields, record, severity);

        for key in &snapshot.excluded_keys {
            fields.remove(key);
        }

        Ok(materialize(snapshot, record, message, severity, &fields))
    }

    fn insert_implicit_fields(
        &self,
        fields: &mut BTreeMap<String, Value>,
        record: &LogRecord,
        severity: Severity,
    ) {
        fields.insert(keys::LEVEL.to_string(), Value::from(severity.name()));
        fields.insert(keys::LOGGER.to_string(), Value::from(record.logger.as_str()));
        if let Ok(time) = record.timestamp.format(&Iso8601::DEFAULT) {
            fields.insert(keys::TIME.to_string(), Value::from(time));
        }
        if let Some(file) = &record.file {
            fields.insert(keys::FILE.to_string(), Value::from(file.as_str()));
        }
        if let Some(line) = record.line {
            fields.insert(keys::LINE.to_string(), Value::from(line));
        }
        fields.insert(keys::PID.to_string(), Value::from(self.pid));
        fields.insert(keys::HOSTNAME.to_string(), Value::from(self.hostname.as_str()));
        fields.insert(
            keys::FORMATTER_VERSION.to_string(),
            Value::from(env!("CARGO_PKG_VERSION")),
        );
    }

    /// The record passed through untouched apart from the implicit fields, followed by a
    /// diagnostic about the failure.
    ///
    /// The attached exception and the split threshold are still honoured.
    fn fallback(
        &self,
        snapshot: &ContextSnapshot,
        record: &LogRecord,
        reason: &str,
    ) -> Vec<FilteredRecord> {
        let mut fields = BTreeMap::new();
        self.insert_implicit_fields(&mut fields, record, record.severity);
        fields.insert(keys::FILTER_ERROR.to_string(), Value::from(reason));

        let mut diagnostic_fields = BTreeMap::new();
        let diagnostic = LogRecord::new(Severity::Warning, env!("CARGO_PKG_NAME"), "");
        self.insert_implicit_fields(&mut diagnostic_fields, &diagnostic, Severity::Warning);

        for key in &snapshot.excluded_keys {
            fields.remove(key);
            diagnostic_fields.remove(key);
        }

        let mut records = materialize(
            snapshot,
            record,
            record.message.clone(),
            record.severity,
            &fields,
        );
        records.push(FilteredRecord {
            severity: Severity::Warning,
            message: format!(
                "Failed to apply logging context to a record of `{}`: {reason}",
                record.logger
            ),
            fields: diagnostic_fields,
        });
        records
    }
}

/// Attaches the exception of the record to `message` (or to records of its own), then
/// splits everything into records carrying `fields`.
fn materialize(
    snapshot: &ContextSnapshot,
    record: &LogRecord,
    mut message: String,
    severity: Severity,
    fields: &BTreeMap<String, Value>,
) -> Vec<FilteredRecord> {
    let mut trace = None;
    if let Some(exception) = &record.exception {
        let rendered = exception.render();
        if snapshot.ex_trace_as_new_message {
            trace = Some(rendered);
        } else {
            message.push('\n');
            message.push_str(&rendered);
        }
    }

    let mut records = split_into_records(&message, snapshot.split_threshold, severity, fields);
    if let Some(trace) = trace {
        records.extend(split_into_records(
            &trace,
            snapshot.split_threshold,
            severity,
            fields,
        ));
    }
    records
}

fn is_first_party(snapshot: &ContextSnapshot, logger: &str) -> bool {
    snapshot.first_party_targets.is_empty()
        || snapshot
            .first_party_targets
            .iter()
            .any(|target| logger.starts_with(target.as_str()))
}

fn split_into_records(
    message: &str,
    threshold: NonZeroUsize,
    severity: Severity,
    fields: &BTreeMap<String, Value>,
) -> Vec<FilteredRecord> {
    split_message(message, threshold)
        .into_iter()
        .map(|chunk| FilteredRecord {
            severity,
            message: chunk.to_string(),
            fields: fields.clone(),
        })
        .collect()
}

/// Splits a message into consecutive chunks of at most `threshold` characters.
///
/// Chunks always end on a character boundary. An empty message yields a single empty
/// chunk.
pub(crate) fn split_message(message: &str, threshold: NonZeroUsize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = message;
    while let Some((index, _)) = rest.char_indices().nth(threshold.get()) {
        let (head, tail) = rest.split_at(index);
        chunks.push(head);
        rest = tail;
    }
    chunks.push(rest);
    chunks
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::ExceptionInfo;

    fn threshold(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn filter_with(snapshot: ContextSnapshot) -> ContextFilter {
        ContextFilter::new(SharedContext::new(snapshot))
    }

    #[test]
    fn split_message_respects_threshold() {
        assert_eq!(split_message("", threshold(3)), vec![""]);
        assert_eq!(split_message("abc", threshold(3)), vec!["abc"]);
        assert_eq!(split_message("abcd", threshold(3)), vec!["abc", "d"]);
        assert_eq!(split_message("abcdef", threshold(3)), vec!["abc", "def"]);
        assert_eq!(split_message("äöüß", threshold(3)), vec!["äöü", "ß"]);
    }

    #[test]
    fn short_message_produces_single_record() {
        let shared = SharedContext::new(ContextSnapshot {
            context: BTreeMap::from([
                ("app".to_string(), "svc".to_string()),
                ("version".to_string(), "1.0.0".to_string()),
            ]),
            ..ContextSnapshot::default()
        });
        let filter = ContextFilter::new(shared);
        let records = filter.filter(&LogRecord::new(Severity::Info, "svc::main", "hello"));

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.message, "hello");
        assert_eq!(record.fields["level"], "INFO");
        assert_eq!(record.fields["app"], "svc");
        assert_eq!(record.fields["version"], "1.0.0");
        assert_eq!(record.fields["logger"], "svc::main");
        assert_eq!(record.fields["log_formatter_version"], env!("CARGO_PKG_VERSION"));
        assert!(record.fields.contains_key("time"));
        assert!(!record.fields.contains_key("pipeline_status"));
        assert!(!record.fields.contains_key("job_status"));
    }

    #[test]
    fn long_message_is_split_into_records_with_identical_fields() {
        let filter = filter_with(ContextSnapshot {
            split_threshold: threshold(4),
            ..ContextSnapshot::default()
        });
        let message = "ABACABACABA";
        let records = filter.filter(
            &LogRecord::new(Severity::Info, "svc", message).with_attribute("batch", 7),
        );

        assert_eq!(records.len(), 3);
        let joined: String = records.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(joined, message);
        for record in &records {
            assert!(record.message.chars().count() <= 4);
            assert_eq!(record.fields, records[0].fields);
            assert_eq!(record.fields["batch"], 7);
        }
    }

    #[test]
    fn critical_records_mark_pipeline_as_failed() {
        let filter = filter_with(ContextSnapshot::default());
        let records = filter.filter(&LogRecord::new(Severity::Critical, "svc", "disk full"));
        assert_eq!(records[0].fields["pipeline_status"], "failed");
        assert_eq!(records[0].fields["job_status"], "failed");
        assert_eq!(records[0].fields["level"], "CRITICAL");

        for severity in [Severity::Debug, Severity::Info, Severity::Warning, Severity::Error] {
            let records = filter.filter(
                &LogRecord::new(severity, "svc", "fine").with_attribute("job_status", "ok"),
            );
            assert!(!records[0].fields.contains_key("pipeline_status"));
            assert!(!records[0].fields.contains_key("job_status"));
        }
    }

    #[test]
    fn record_attributes_override_context_but_not_implicit_fields() {
        let filter = filter_with(ContextSnapshot {
            context: BTreeMap::from([("stage".to_string(), "extract".to_string())]),
            ..ContextSnapshot::default()
        });
        let records = filter.filter(
            &LogRecord::new(Severity::Info, "svc", "hello")
                .with_attribute("stage", "load")
                .with_attribute("level", "BOGUS")
                .with_attribute("message", "other"),
        );
        assert_eq!(records[0].fields["stage"], "load");
        assert_eq!(records[0].fields["level"], "INFO");
        assert!(!records[0].fields.contains_key("message"));
        assert_eq!(records[0].message, "hello");
    }

    #[test]
    fn excluded_keys_never_appear() {
        let filter = filter_with(ContextSnapshot {
            context: BTreeMap::from([("secret".to_string(), "ctx".to_string())]),
            excluded_keys: vec!["secret".to_string(), "hostname".to_string()],
            ..ContextSnapshot::default()
        });
        let records =
            filter.filter(&LogRecord::new(Severity::Info, "svc", "x").with_attribute("secret", 1));
        assert!(!records[0].fields.contains_key("secret"));
        assert!(!records[0].fields.contains_key("hostname"));
        assert!(records[0].fields.contains_key("pid"));
    }

    #[test]
    fn exception_is_appended_to_message_by_default() {
        let filter = filter_with(ContextSnapshot::default());
        let records = filter.filter(
            &LogRecord::new(Severity::Error, "svc", "load failed")
                .with_exception(ExceptionInfo::new("boom").with_cause("io")),
        );
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].message,
            "load failed\nError: boom\nCaused by:\n    0: io"
        );
    }

    #[test]
    fn exception_as_new_message_follows_original_message() {
        let filter = filter_with(ContextSnapshot {
            ex_trace_as_new_message: true,
            split_threshold: threshold(8),
            ..ContextSnapshot::default()
        });
        let records = filter.filter(
            &LogRecord::new(Severity::Error, "svc", "failed")
                .with_exception(ExceptionInfo::new("boom")),
        );

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].message, "failed");
        assert_eq!(
            format!("{}{}", records[1].message, records[2].message),
            "Error: boom"
        );
        assert!(records.iter().all(|r| r.fields == records[0].fields));
    }

    #[test]
    fn dependency_errors_are_demoted() {
        let filter = filter_with(ContextSnapshot {
            first_party_targets: vec!["svc".to_string()],
            ..ContextSnapshot::default()
        });

        let records = filter.filter(&LogRecord::new(Severity::Critical, "hyper::proto", "x"));
        assert_eq!(records[0].severity, Severity::Warning);
        assert_eq!(records[0].fields["level"], "WARNING");
        assert_eq!(records[0].fields["original_level"], "CRITICAL");
        assert_eq!(records[0].fields["filter_imported_modules"], "Filtered");
        assert!(!records[0].fields.contains_key("pipeline_status"));

        let records = filter.filter(&LogRecord::new(Severity::Critical, "svc::job", "x"));
        assert_eq!(records[0].fields["pipeline_status"], "failed");
        assert!(!records[0].fields.contains_key("original_level"));
    }

    #[test]
    fn broken_record_is_passed_through() {
        let filter = filter_with(ContextSnapshot {
            context: BTreeMap::from([("app".to_string(), "svc".to_string())]),
            ..ContextSnapshot::default()
        });
        let records = filter.filter(
            &LogRecord::new(Severity::Info, "svc", "user {missing}").with_arg("user", "alice"),
        );

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "user {missing}");
        assert_eq!(records[0].fields["level"], "INFO");
        assert!(records[0].fields.contains_key("filter_error"));
        assert!(!records[0].fields.contains_key("app"));
        assert_eq!(records[1].severity, Severity::Warning);
        assert_eq!(records[1].fields["logger"], env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn reserved_context_keys_do_not_override_implicit_fields() {
        let filter = filter_with(ContextSnapshot {
            context: BTreeMap::from([
                ("message".to_string(), "from-context".to_string()),
                ("level".to_string(), "BOGUS".to_string()),
                ("team".to_string(), "data".to_string()),
            ]),
            ..ContextSnapshot::default()
        });
        let records = filter.filter(&LogRecord::new(Severity::Info, "svc", "hello"));

        assert_eq!(records[0].message, "hello");
        assert!(!records[0].fields.contains_key("message"));
        assert_eq!(records[0].fields["level"], "INFO");
        assert_eq!(records[0].fields["team"], "data");
    }

    #[test]
    fn broken_record_keeps_exception_and_is_split() {
        let filter = filter_with(ContextSnapshot {
            split_threshold: threshold(4),
            ..ContextSnapshot::default()
        });
        let records = filter.filter(
            &LogRecord::new(Severity::Error, "svc", "load {missing}")
                .with_arg("user", "alice")
                .with_exception(ExceptionInfo::new("boom")),
        );

        let (diagnostic, passed) = records.split_last().unwrap();
        assert_eq!(diagnostic.severity, Severity::Warning);
        let joined: String = passed.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(joined, "load {missing}\nError: boom");
        for record in passed {
            assert!(record.message.chars().count() <= 4);
            assert!(record.fields.contains_key("filter_error"));
            assert_eq!(record.fields, passed[0].fields);
        }
    }

    #[test]
    fn broken_record_emits_exception_as_new_message() {
        let filter = filter_with(ContextSnapshot {
            ex_trace_as_new_message: true,
            ..ContextSnapshot::default()
        });
        let records = filter.filter(
            &LogRecord::new(Severity::Error, "svc", "load {missing}")
                .with_arg("user", "alice")
                .with_exception(ExceptionInfo::new("boom")),
        );

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].message, "load {missing}");
        assert_eq!(records[1].message, "Error: boom");
        assert_eq!(records[2].severity, Severity::Warning);
    }

    #[test]
    fn message_args_become_fields() {
        let filter = filter_with(ContextSnapshot::default());
        let records = filter.filter(
            &LogRecord::new(Severity::Info, "svc", "processed {rows} rows").with_arg("rows", 42),
        );
        assert_eq!(records[0].message, "processed 42 rows");
        assert_eq!(records[0].fields["rows"], 42);
    }

    #[test]
    fn context_update_applies_to_later_records_only() {
        let filter = filter_with(ContextSnapshot::default());
        let before = filter.filter(&LogRecord::new(Severity::Info, "svc", "before"));
        filter
            .shared_context()
            .update_context([("request_id", "abc")]);
        let after = filter.filter(&LogRecord::new(Severity::Info, "svc", "after"));

        assert!(!before[0].fields.contains_key("request_id"));
        assert_eq!(after[0].fields["request_id"], "abc");
    }

    #[test]
    fn records_never_observe_partial_updates() {
        let filter = filter_with(ContextSnapshot::default());
        std::thread::scope(|scope| {
            let writer = filter.clone();
            scope.spawn(move || {
                for i in 0..200 {
                    let value = i.to_string();
                    writer
                        .shared_context()
                        .update_context([("first", value.clone()), ("second", value)]);
                }
            });

            for _ in 0..200 {
                let records = filter.filter(&LogRecord::new(Severity::Info, "svc", "x"));
                let fields = &records[0].fields;
                assert_eq!(fields.get("first"), fields.get("second"));
            }
        });
    }
}
