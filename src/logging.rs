//! Structured logging setup.
//!
//! svckit logs through `tracing`. [`init`] installs a subscriber once at
//! process start, configured by an explicit [`LogConfig`]. In the default
//! JSON format every event is one line: the upper-case level, a space, then
//! a JSON object tagged with the service name and an RFC 3339 UTC timestamp:
//!
//! ```text
//! INFO {"level":"info","message":"listening","addr":"0.0.0.0:8080","service":"orders","target":"svckit::server","timestamp":"2024-05-01T09:30:00.000Z"}
//! ```
//!
//! `RUST_LOG` takes precedence over [`LogConfig::level`] when set.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::env;
use crate::error::BoxError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// One level-prefixed JSON object per line.
    Json,
    /// `tracing-subscriber`'s human-readable output, for local development.
    Pretty,
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub service: String,
    /// Default filter directive, e.g. `info` or `svckit=debug,info`.
    pub level: String,
    pub format: LogFormat,
}

impl LogConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into(), level: "info".to_owned(), format: LogFormat::Json }
    }

    /// Service name from `SERVICE_NAME`, level from `LOG_LEVEL`.
    pub fn from_env() -> Self {
        Self {
            service: env::service_name(),
            level: env::get_or("LOG_LEVEL", "info"),
            format: LogFormat::Json,
        }
    }

    pub fn level(mut self, directive: impl Into<String>) -> Self {
        self.level = directive.into();
        self
    }

    pub fn pretty(mut self) -> Self {
        self.format = LogFormat::Pretty;
        self
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig) -> Result<(), BoxError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format {
        LogFormat::Json => builder.event_format(ServiceJson::new(&config.service)).try_init(),
        LogFormat::Pretty => builder.try_init(),
    }
}

/// Event formatter producing `LEVEL {json}` lines tagged with the service.
#[derive(Clone, Debug)]
pub struct ServiceJson {
    service: String,
}

impl ServiceJson {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }
}

impl<S, N> FormatEvent<S, N> for ServiceJson
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let mut record = Fields::default();
        event.record(&mut record);

        let mut record = record.0;
        record.insert(
            "timestamp".into(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true).into(),
        );
        record.insert("level".into(), meta.level().to_string().to_lowercase().into());
        record.insert("service".into(), self.service.clone().into());
        record.insert("target".into(), meta.target().into());
        if let Some(span) = ctx.lookup_current() {
            record.insert("span".into(), span.name().into());
        }

        let line = serde_json::to_string(&record).map_err(|_| fmt::Error)?;
        writeln!(writer, "{} {line}", meta.level())
    }
}

#[derive(Default)]
struct Fields(Map<String, Value>);

impl Visit for Fields {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().into(), format!("{value:?}").into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writes_level_prefixed_json_with_service_and_timestamp() {
        let buf = Buffer::default();
        let sink = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .event_format(ServiceJson::new("orders"))
            .with_writer(move || sink.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(attempt = 2_u64, ok = false, "outbound request failed");
        });

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let (level, json) = out.trim_end().split_once(' ').unwrap();
        assert_eq!(level, "WARN");

        let record: Value = serde_json::from_str(json).unwrap();
        assert_eq!(record["service"], "orders");
        assert_eq!(record["level"], "warn");
        assert_eq!(record["message"], "outbound request failed");
        assert_eq!(record["attempt"], 2);
        assert_eq!(record["ok"], false);
        let ts = record["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn config_builders() {
        let cfg = LogConfig::new("svc").level("debug").pretty();
        assert_eq!(cfg.level, "debug");
        assert_eq!(cfg.format, LogFormat::Pretty);
    }
}
