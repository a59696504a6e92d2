//! Process logging: `tracing` events feed both the console and the event log.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::{fmt as fmt_layer, prelude::*};

use crate::config_loader::LogConfig;
use crate::errors::{HermesError, HermesResult};
use crate::event_log::{EventLog, Fields, LogLevel, SINK_TARGET};

/// TRACE and DEBUG map to debug, INFO and WARN to info, ERROR to error.
pub fn map_level(level: Level) -> LogLevel {
    if level == Level::ERROR {
        LogLevel::Error
    } else if level == Level::WARN || level == Level::INFO {
        LogLevel::Info
    } else {
        LogLevel::Debug
    }
}

/// Layer that records every `tracing` event into an [`EventLog`].
pub struct EventLogLayer {
    events: Arc<EventLog>,
}

impl EventLogLayer {
    pub fn new(events: Arc<EventLog>) -> Self {
        Self { events }
    }
}

impl<S: Subscriber> Layer<S> for EventLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target() == SINK_TARGET {
            return;
        }
        let level = map_level(*meta.level());
        if !self.events.enabled(level) {
            return;
        }
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);
        self.events
            .write(level, visitor.message.unwrap_or_default(), visitor.fields);
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Fields,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::from(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let text = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(text);
        } else {
            self.insert(field, Value::from(text));
        }
    }
}

/// Install the global subscriber. The console layer follows the event log's
/// threshold, so changing the level at runtime changes console output too.
pub fn init_logging(config: &LogConfig, events: Arc<EventLog>) -> HermesResult<()> {
    events.set_level(&config.level);

    let threshold = events.clone();
    let console_filter = filter_fn(move |meta| threshold.enabled(map_level(*meta.level())));
    let console: Box<dyn Layer<_> + Send + Sync> = if config.json {
        Box::new(fmt_layer::layer().json().with_filter(console_filter))
    } else {
        Box::new(fmt_layer::layer().with_filter(console_filter))
    };

    tracing_subscriber::registry()
        .with(console)
        .with(EventLogLayer::new(events))
        .try_init()
        .map_err(|e| HermesError::internal(format!("logging already initialized: {e}")))
}
