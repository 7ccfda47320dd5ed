//! Logger setup
//!
//! The library only emits `log` records. Applications embedding it can call
//! [`init`] to get env_logger output, either plain text or one JSON object
//! per line for jq.

use std::io::Write;
use std::time::SystemTime;

use log::LevelFilter;
use serde::{Deserialize, Serialize};

/// Output format of the installed logger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install env_logger at info level, or debug when `verbose`.
///
/// `RUST_LOG` still overrides per-module filters. Returns `false` if a
/// logger was already installed.
pub fn init(verbose: bool) -> bool {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    init_with_format(level, LogFormat::Text)
}

/// Install env_logger with an explicit level and format
pub fn init_with_format(level: LevelFilter, format: LogFormat) -> bool {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);

    if format == LogFormat::Json {
        builder.format(|buf, record| {
            let entry = json_entry(record.level(), record.target(), &record.args().to_string());
            writeln!(buf, "{}", entry)
        });
    }

    builder.try_init().is_ok()
}

fn json_entry(level: log::Level, component: &str, message: &str) -> serde_json::Value {
    serde_json::json!({
        "timestamp": humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
        "level": level.as_str(),
        "component": component,
        "message": message,
    })
}
