//! Provides a [`tracing_subscriber::Layer`] ([`JsonFormattingLayer`]) which passes tracing
//! events through the [`ContextFilter`] and writes the resulting records.

use std::{collections::BTreeMap, io::Write};

use serde::ser::{SerializeMap, Serializer};
use serde_json::{ser::Formatter, Value};
use time::format_description::well_known::Iso8601;
use tracing::{Event, Subscriber};
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::Context,
    registry::{LookupSpan, SpanRef},
    Layer,
};

use crate::{
    context::{validate_excluded_keys, OutputFormat, SharedContext},
    filter::{ContextFilter, FilteredRecord},
    keys,
    storage::Storage,
    LogRecord, LoggerError, Severity,
};

/// A [`tracing_subscriber::Layer`] that turns tracing events into [`LogRecord`]s, passes them
/// through a [`ContextFilter`] and writes every resulting record as one line.
///
/// Depending on the [`OutputFormat`] of the shared context, lines are JSON objects (with
/// `message` as the first key) or plain `<time> <logger>] <LEVEL>: <message>` lines.
///
/// Event fields, and the fields of enclosing spans captured by a
/// [`SpanStorageLayer`][crate::SpanStorageLayer], become record attributes. Event fields win
/// over span fields.
///
/// It requires a [`MakeWriter`] to determine the output destination and a
/// [`serde_json::ser::Formatter`] to control the JSON output style
/// (e.g., compact or pretty-printed).
#[derive(Debug)]
pub struct JsonFormattingLayer<W, F>
where
    W: for<'a> MakeWriter<'a> + 'static,
    F: Formatter + Clone,
{
    dst_writer: W,
    formatter: F,
    filter: ContextFilter,
}

impl<W, F> JsonFormattingLayer<W, F>
where
    W: for<'a> MakeWriter<'a> + 'static,
    F: Formatter + Clone,
{
    /// Creates a new [`JsonFormattingLayer`] reading its settings from the shared context,
    /// with the specified writer and formatter.
    pub fn new(shared: SharedContext, dst_writer: W, formatter: F) -> Result<Self, LoggerError> {
        validate_excluded_keys(&shared.load().excluded_keys)?;

        Ok(Self {
            dst_writer,
            formatter,
            filter: ContextFilter::new(shared),
        })
    }

    /// The filter records pass through.
    pub fn filter(&self) -> &ContextFilter {
        &self.filter
    }

    /// Builds the record for an event and its parent span.
    fn build_record<S>(span: Option<&SpanRef<'_, S>>, event: &Event<'_>) -> LogRecord
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let metadata = event.metadata();

        let mut storage = Storage::default();
        event.record(&mut storage);

        let mut attributes = BTreeMap::new();
        if let Some(span) = span {
            let extensions = span.extensions();
            if let Some(span_storage) = extensions.get::<Storage<'_>>() {
                for (key, value) in span_storage.values() {
                    attributes.insert((*key).to_string(), value.clone());
                }
            }
        }
        for (key, value) in storage.values() {
            attributes.insert((*key).to_string(), value.clone());
        }

        let severity = if storage.is_critical() {
            Severity::Critical
        } else {
            Severity::from(*metadata.level())
        };

        // Obtain the value of the `message` field if set, or the `target` from metadata otherwise.
        let message = storage
            .message()
            .unwrap_or_else(|| metadata.target())
            .to_string();

        let mut record = LogRecord::new(severity, metadata.target(), message);
        record.file = metadata.file().map(ToString::to_string);
        record.line = metadata.line();
        record.exception = storage.take_exception();
        record.attributes = attributes;
        record
    }

    /// Serialize a filtered record as a JSON object.
    fn serialize_json(&self, record: &FilteredRecord) -> Result<Vec<u8>, LoggerError> {
        let mut buffer = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut buffer, self.formatter.clone());
        let mut map_serializer = serializer.serialize_map(None)?;

        map_serializer.serialize_entry(keys::MESSAGE, &record.message)?;
        for (key, value) in &record.fields {
            map_serializer.serialize_entry(key, value)?;
        }

        map_serializer.end()?;
        Ok(buffer)
    }

    /// Serialize a filtered record as a human-readable line.
    fn serialize_plain(source: &LogRecord, record: &FilteredRecord) -> Vec<u8> {
        let time = source
            .timestamp
            .format(&Iso8601::DEFAULT)
            .unwrap_or_default();
        let logger = record
            .fields
            .get(keys::LOGGER)
            .and_then(Value::as_str)
            .unwrap_or(&source.logger);

        format!("{time} {logger}] {}: {}", record.severity, record.message).into_bytes()
    }

    /// Flush memory buffer into an output stream.
    ///
    /// Should be done by a single `write_all` call to avoid fragmentation of log because of
    /// multithreading. All records produced from one event are written together, so that
    /// split messages stay contiguous.
    fn flush(&self, buffer: &[u8]) -> Result<(), std::io::Error> {
        self.dst_writer.make_writer().write_all(buffer)
    }
}

impl<S, W, F> Layer<S> for JsonFormattingLayer<W, F>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'a> MakeWriter<'a> + 'static,
    F: Formatter + Clone + 'static,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let snapshot = self.filter.shared_context().load();

        // Obtain the parent span for the event
        let span = ctx.event_span(event);
        let record = Self::build_record(span.as_ref(), event);
        if record.severity < snapshot.min_severity {
            return;
        }

        let mut buffer = Vec::new();
        for filtered in self.filter.filter_with(&snapshot, &record) {
            let serialized = match snapshot.output_format {
                OutputFormat::Json => self.serialize_json(&filtered),
                OutputFormat::Plain => Ok(Self::serialize_plain(&record, &filtered)),
            };
            if let Ok(serialized) = serialized {
                buffer.extend_from_slice(&serialized);
                buffer.push(b'\n');
            }
        }

        if !buffer.is_empty() {
            let _ = self.flush(&buffer);
        }
    }
}
