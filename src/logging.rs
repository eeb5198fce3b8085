// Logger setup

//! Logging initialization
//!
//! Wires env_logger to the configured level and output format. The `json`
//! format emits one object per line (`ts`, `level`, `target`, `msg`) for
//! log shippers; `text` is a timestamped human-readable line.

use crate::config::LogFormat;
use std::io::Write;

/// Initialize the global logger. Call once at startup, before any log
/// output.
pub fn setup_logging(level: &str, format: LogFormat) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    match format {
        LogFormat::Json => {
            builder.format(|buf, record| {
                let line = serde_json::json!({
                    "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    "level": record.level().to_string().to_lowercase(),
                    "target": record.target(),
                    "msg": record.args().to_string(),
                });
                writeln!(buf, "{line}")
            });
        }
        LogFormat::Text => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "{} {:<5} {} {}",
                    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    record.level(),
                    record.target(),
                    record.args()
                )
            });
        }
    }

    builder.init();
}
