//! # Logging
//!
//! Installs the process-wide `tracing` subscriber for the authentication core.
//!
//! Output goes to stdout in one of three [`LogFormat`]s. Workspace crates log
//! at [`LoggingConfig::level`] and everything else at `warn`, unless an
//! explicit `EnvFilter` directive string is supplied. When the host passes a
//! [`LoggerSink`], every event that survives the filter is also converted to a
//! [`LogEntry`] and handed to it, with field values run through
//! [`redact_if_sensitive`] first.
//!
//! ```ignore
//! use bridge_traits::time::LogLevel;
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//! use std::sync::Arc;
//!
//! init_logging(
//!     LoggingConfig::default()
//!         .with_format(LogFormat::Json)
//!         .with_level(LogLevel::Debug)
//!         .with_logger_sink(Arc::new(HostLogPipeline::new())),
//! )?;
//! tracing::info!("Broker ready");
//! ```
//!
//! Inside a Tokio runtime sink delivery is spawned; outside one it runs to
//! completion on the logging thread.

use crate::error::{Error, Result};

use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{
    filter::EnvFilter,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer,
};

/// Crates whose level follows [`LoggingConfig::level`] in the default filter.
const WORKSPACE_TARGETS: &[&str] = &["core_auth", "core_runtime", "bridge_traits"];

/// Field-name fragments whose values are never logged.
const SECRET_FIELD_MARKERS: &[&str] = &[
    "token",
    "code",
    "verifier",
    "password",
    "secret",
    "assertion",
    "authorization",
    "bearer",
];

const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, colored; for local development
    Pretty,
    /// One JSON object per event, fields flattened
    Json,
    /// Single line per event
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

#[derive(Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// `EnvFilter` directives replacing the default per-crate filter,
    /// e.g. `"core_auth=trace,warn"`
    pub filter: Option<String>,
    pub logger_sink: Option<Arc<dyn LoggerSink>>,
    /// Log span open/close (pretty) or the span stack (JSON)
    pub span_events: bool,
    pub show_target: bool,
    pub show_thread: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            filter: None,
            logger_sink: None,
            span_events: true,
            show_target: true,
            show_thread: false,
        }
    }
}

impl fmt::Debug for LoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingConfig")
            .field("format", &self.format)
            .field("level", &self.level)
            .field("filter", &self.filter)
            .field("has_logger_sink", &self.logger_sink.is_some())
            .field("span_events", &self.span_events)
            .finish_non_exhaustive()
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_filter(mut self, directives: impl Into<String>) -> Self {
        self.filter = Some(directives.into());
        self
    }

    pub fn with_logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_target(mut self, show: bool) -> Self {
        self.show_target = show;
        self
    }

    pub fn with_thread(mut self, show: bool) -> Self {
        self.show_thread = show;
        self
    }

    fn directives(&self) -> String {
        if let Some(custom) = &self.filter {
            return custom.clone();
        }
        let level = level_directive(self.level);
        std::iter::once("warn".to_string())
            .chain(
                WORKSPACE_TARGETS
                    .iter()
                    .map(|target| format!("{}={}", target, level)),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Install the global subscriber.
///
/// Fails with [`Error::Config`] on a malformed filter or when a global
/// subscriber is already installed.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = build_filter(&config)?;
    let output = output_layer(&config);

    tracing_subscriber::registry()
        .with(filter)
        .with(LoggerSinkLayer::new(config.logger_sink.clone()))
        .with(output)
        .try_init()
        .map_err(|e| Error::Config(format!("Logging already initialized: {}", e)))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_new(config.directives())
        .map_err(|e| Error::Config(format!("Invalid log filter: {}", e)))
}

fn output_layer<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let base = tracing_subscriber::fmt::layer()
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread)
        .with_thread_names(config.show_thread)
        .with_writer(io::stdout);

    match config.format {
        LogFormat::Pretty => base
            .pretty()
            .with_span_events(if config.span_events {
                FmtSpan::ACTIVE
            } else {
                FmtSpan::NONE
            })
            .boxed(),
        LogFormat::Json => base
            .json()
            .flatten_event(true)
            .with_current_span(config.span_events)
            .with_span_list(config.span_events)
            .boxed(),
        LogFormat::Compact => base.compact().boxed(),
    }
}

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn to_log_level(level: tracing::Level) -> LogLevel {
    match level {
        tracing::Level::TRACE => LogLevel::Trace,
        tracing::Level::DEBUG => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::WARN => LogLevel::Warn,
        tracing::Level::ERROR => LogLevel::Error,
    }
}

/// Mirrors filtered events into the host's [`LoggerSink`].
struct LoggerSinkLayer {
    sink: Option<Arc<dyn LoggerSink>>,
}

impl LoggerSinkLayer {
    fn new(sink: Option<Arc<dyn LoggerSink>>) -> Self {
        Self { sink }
    }

    fn deliver(sink: Arc<dyn LoggerSink>, entry: LogEntry) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = sink.log(entry).await {
                        eprintln!("host log sink rejected entry: {}", err);
                    }
                });
            }
            Err(_) => {
                if let Err(err) = futures::executor::block_on(sink.log(entry)) {
                    eprintln!("host log sink rejected entry: {}", err);
                }
            }
        }
    }
}

impl<S> Layer<S> for LoggerSinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(sink) = &self.sink else {
            return;
        };
        let metadata = event.metadata();
        let level = to_log_level(*metadata.level());
        if level < sink.min_level() {
            return;
        }

        let mut fields = RedactingVisitor::default();
        event.record(&mut fields);

        let mut entry = LogEntry::new(
            level,
            metadata.target(),
            fields.message.unwrap_or_else(|| metadata.name().to_string()),
        );
        entry.fields = fields.values;
        if let Some(span) = ctx.lookup_current() {
            entry = entry.with_span_id(span.name());
        }

        Self::deliver(Arc::clone(sink), entry);
    }
}

#[derive(Default)]
struct RedactingVisitor {
    message: Option<String>,
    values: HashMap<String, String>,
}

impl RedactingVisitor {
    fn record(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            name => {
                let value = redact_if_sensitive(name, &value);
                self.values.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for RedactingVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record(field, format!("{:?}", value));
    }
}

/// Redact a field value before it is logged.
///
/// Values of token-like fields are replaced entirely. Values that look like
/// e-mail addresses (login hints, usernames) keep only their first character.
///
/// ```
/// use core_runtime::logging::redact_if_sensitive;
///
/// assert_eq!(redact_if_sensitive("refresh_token", "0.AAA"), "[REDACTED]");
/// assert_eq!(redact_if_sensitive("login_hint", "alice@contoso.com"), "a***@[REDACTED]");
/// assert_eq!(redact_if_sensitive("scope", "mail.read"), "mail.read");
/// ```
pub fn redact_if_sensitive(field_name: &str, value: &str) -> String {
    let name = field_name.to_ascii_lowercase();
    if SECRET_FIELD_MARKERS.iter().any(|marker| name.contains(marker)) {
        return REDACTED.to_string();
    }

    match value.split_once('@') {
        Some((local, domain)) if domain.contains('.') => {
            let initial: String = local.chars().take(1).collect();
            format!("{}***@{}", initial, REDACTED)
        }
        _ => value.to_string(),
    }
}
