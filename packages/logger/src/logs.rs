use chrono::{SecondsFormat, Utc};
use env_logger::fmt::Formatter;
use log::{kv, Level, Record};
use serde::Serialize;
use std::io::Write;

/// Env. variable used to force the output format regardless of the build profile.
pub const LOG_FORMAT_ENV: &str = "PERF_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable, coloured lines. Default for debug builds.
    Pretty,
    /// One json document per line. Default for release builds.
    Json,
}

impl LogFormat {
    fn from_env_or_profile() -> Self {
        match std::env::var(LOG_FORMAT_ENV).map(|v| v.to_lowercase()) {
            Ok(v) if v == "json" => LogFormat::Json,
            Ok(v) if v == "pretty" => LogFormat::Pretty,
            _ if cfg!(debug_assertions) => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

pub trait SerdeLogging {
    fn as_json_str(&self) -> String;
}

impl<T: Serialize> SerdeLogging for T {
    #[cfg(debug_assertions)]
    fn as_json_str(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_owned())
    }

    #[cfg(not(debug_assertions))]
    fn as_json_str(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

fn level_to_str(level: Level) -> &'static str {
    match level {
        Level::Error => "Error",
        Level::Debug => "Debug",
        Level::Info => "Info",
        Level::Warn => "Warn",
        Level::Trace => "Trace",
    }
}

struct RecordParams<'a> {
    severity: &'static str,
    date: String,
    module_path: &'a str,
    file: &'a str,
    line: u32,
    thread: String,
}

fn record_params<'a>(record: &'a Record) -> RecordParams<'a> {
    RecordParams {
        severity: level_to_str(record.metadata().level()),
        date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        module_path: record.module_path().unwrap_or_default(),
        file: record.file().unwrap_or_default(),
        line: record.line().unwrap_or_default(),
        // producers and the batcher are named threads, worth seeing in every line
        thread: std::thread::current().name().unwrap_or("unnamed").to_string(),
    }
}

fn write_pretty(f: &mut Formatter, record: &Record, service: &str) -> std::io::Result<()> {
    use env_logger::fmt::Color;

    struct LogVisitor<'a, W: Write> {
        writer: &'a mut W,
    }
    impl<'kvs, 'a, W: Write> kv::Visitor<'kvs> for LogVisitor<'a, W> {
        fn visit_pair(&mut self, key: kv::Key<'kvs>, val: kv::Value<'kvs>) -> Result<(), kv::Error> {
            write!(self.writer, "\n    {} = {}", key, val).map_err(|_| kv::Error::msg("unable to write key/value pair"))
        }
    }

    let p = record_params(record);

    let mut level_style = f.default_level_style(record.level());
    level_style.set_bold(true);

    let mut general_style = f.style();
    general_style.set_color(Color::Rgb(110, 110, 110));

    let mut module_style = f.style();
    module_style.set_color(Color::Yellow);

    write!(
        f,
        "{}  {:5}  [{}/{}]  {} ({}:{})  {}",
        general_style.value(p.date),
        level_style.value(p.severity),
        service,
        p.thread,
        module_style.value(p.module_path),
        general_style.value(p.file),
        general_style.value(p.line),
        record.args()
    )?;

    let mut visitor = LogVisitor { writer: f };
    let _ = record.key_values().visit(&mut visitor);
    writeln!(f)
}

fn write_json<F: Write>(f: &mut F, record: &Record, service: &str) -> std::io::Result<()> {
    struct LogVisitor<'a, W: Write> {
        writer: &'a mut W,
    }
    impl<'kvs, 'a, W: Write> kv::Visitor<'kvs> for LogVisitor<'a, W> {
        fn visit_pair(&mut self, key: kv::Key<'kvs>, val: kv::Value<'kvs>) -> Result<(), kv::Error> {
            let vs = val.to_borrowed_str().unwrap_or_default();
            let written = if serde_json::from_str::<serde_json::Value>(vs).is_ok() {
                write!(self.writer, ",\"{}\":{}", key, val)
            } else {
                write!(self.writer, ",\"{}\":{}", key, serde_json::Value::String(val.to_string()))
            };
            written.map_err(|_| kv::Error::msg("unable to write key/value pair"))
        }
    }

    let p = record_params(record);
    let message = serde_json::Value::String(record.args().to_string());
    #[rustfmt::skip]
    write!(f, r#"{{"date":"{}","severity":"{}","service":"{}","thread":"{}","message":{},"className":"{}","file":"{}","line":{}"#,
        p.date, p.severity, service, p.thread, message, p.module_path, p.file, p.line)?;

    let mut visitor = LogVisitor { writer: f };
    let _ = record.key_values().visit(&mut visitor);
    writeln!(f, "}}")
}

/// Initialises the global logger. The level is controlled via `RUST_LOG`, the format via [`LOG_FORMAT_ENV`].
pub fn init(service: &'static str) {
    if let Err(e) = try_init(service) {
        eprintln!("Logger is already initialised: {e}");
    }
}

pub fn try_init(service: &'static str) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    match LogFormat::from_env_or_profile() {
        LogFormat::Pretty => builder.format(move |f, record| write_pretty(f, record, service)),
        LogFormat::Json => builder.format(move |f, record| write_json(f, record, service)),
    };
    builder.try_init()
}
