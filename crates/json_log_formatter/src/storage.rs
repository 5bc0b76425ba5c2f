//! Provides a [`tracing_subscriber::Layer`] ([`SpanStorageLayer`]) for capturing and storing
//! key-value data from tracing spans, and the visitor used to capture event fields.

use std::{collections::HashMap, error::Error, fmt};

use serde_json::Value;
use tracing::{
    field::{Field, Visit},
    span::{Attributes, Record},
    Id, Subscriber,
};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

use crate::ExceptionInfo;

/// A [`tracing_subscriber::Layer`] that stores span fields within span extensions, so that
/// they can be attached to every event emitted inside the span.
///
/// A new span inherits the fields of its parent span.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpanStorageLayer;

impl SpanStorageLayer {
    /// Creates a new [`SpanStorageLayer`].
    pub fn new() -> Self {
        Self
    }
}

/// Holds key-value data recorded for a span or an event.
#[derive(Clone, Debug, Default)]
pub(crate) struct Storage<'a> {
    /// The collected key-value pairs.
    values: HashMap<&'a str, Value>,

    /// The primary message of an event, if captured.
    message: Option<String>,

    /// The first error recorded through [`Visit::record_error`].
    exception: Option<ExceptionInfo>,

    /// The `critical` flag, if recorded.
    critical: Option<bool>,
}

impl<'a> Storage<'a> {
    pub(crate) fn record_value(&mut self, key: &'a str, value: Value) {
        self.values.insert(key, value);
    }

    pub(crate) fn values(&self) -> &HashMap<&'a str, Value> {
        &self.values
    }

    pub(crate) fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub(crate) fn take_exception(&mut self) -> Option<ExceptionInfo> {
        self.exception.take()
    }

    pub(crate) fn is_critical(&self) -> bool {
        self.critical == Some(true)
    }

    /// Spans do not escalate the events inside them, so a `critical` field recorded on a
    /// span is kept as a plain value.
    fn keep_critical_as_value(&mut self) {
        if let Some(critical) = self.critical.take() {
            self.record_value(crate::keys::CRITICAL, Value::from(critical));
        }
    }

    /// Records a message which did not arrive as a string, unless a message was already set.
    fn record_message_fallback(&mut self, value: impl fmt::Display) {
        if self.message.is_none() {
            self.message = Some(value.to_string());
        }
    }
}

// Implement `Visit` to capture span or event fields into the `Storage` map.
impl Visit for Storage<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        if field.name() == crate::keys::MESSAGE {
            self.record_message_fallback(value);
        } else {
            self.record_value(field.name(), Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == crate::keys::MESSAGE {
            self.record_message_fallback(value);
        } else {
            self.record_value(field.name(), Value::from(value));
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == crate::keys::MESSAGE {
            self.record_message_fallback(value);
        } else {
            self.record_value(field.name(), Value::from(value));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        match field.name() {
            crate::keys::MESSAGE => self.record_message_fallback(value),
            crate::keys::CRITICAL => self.critical = Some(value),
            name => self.record_value(name, Value::from(value)),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == crate::keys::MESSAGE {
            self.message = Some(value.to_string()); // `record_str()` is preferred for `message`
        } else {
            self.record_value(field.name(), Value::from(value));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn Error + 'static)) {
        if self.exception.is_none() {
            self.exception = Some(ExceptionInfo::from_error(value));
        } else {
            self.record_value(field.name(), Value::from(value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            // Only use debug if `record_str()` hasn't set it
            crate::keys::MESSAGE => self.record_message_fallback(format_args!("{value:?}")),
            // Skip fields which are already handled
            name if name.starts_with("log.") => (),
            name => {
                self.record_value(
                    name.strip_prefix("r#").unwrap_or(name),
                    Value::from(format!("{value:?}")),
                );
            }
        }
    }
}

impl<S: Subscriber + for<'a> LookupSpan<'a>> Layer<S> for SpanStorageLayer {
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        // Inherit storage from parent span if it exists, otherwise create a new one.
        let mut visitor = span
            .parent()
            .and_then(|parent_span| {
                let extensions = parent_span.extensions();
                extensions.get::<Storage<'_>>().cloned()
            })
            .unwrap_or_default();

        attrs.record(&mut visitor);
        visitor.keep_critical_as_value();
        span.extensions_mut().insert(visitor);
    }

    fn on_record(&self, span_id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(span_id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(visitor) = extensions.get_mut::<Storage<'_>>() {
            values.record(visitor);
            visitor.keep_critical_as_value();
        }
    }
}
