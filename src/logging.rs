//! Structured logging setup.
//!
//! Records go to stderr through `tracing_subscriber`. The level comes from
//! `ZAPRET_LOG_LEVEL` when set, otherwise from the config's `debug` flag;
//! color resolution order is config value, then `ZAPRET_LOG_COLOR`, then
//! whether stderr is a terminal.

use std::io::IsTerminal;

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "ZAPRET_LOG_LEVEL";
/// Environment variable overriding colored output.
pub const ENV_LOG_COLOR: &str = "ZAPRET_LOG_COLOR";

/// Install the global subscriber. Returns an error when a subscriber is
/// already set (only relevant in tests).
pub fn init(debug: bool, log_color: Option<bool>) -> Result<()> {
    let level = level_from_env(std::env::var(ENV_LOG_LEVEL).ok().as_deref())
        .unwrap_or(if debug { Level::DEBUG } else { Level::INFO });

    let ansi = resolve_color(log_color, std::env::var(ENV_LOG_COLOR).ok().as_deref());

    // The target (module path) doubles as the component field.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn level_from_env(value: Option<&str>) -> Option<Level> {
    match value?.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" | "fatal" => Some(Level::ERROR),
        _ => None,
    }
}

fn resolve_color(config_value: Option<bool>, env_value: Option<&str>) -> bool {
    if let Some(v) = config_value {
        return v;
    }
    match env_value.map(str::to_ascii_lowercase).as_deref() {
        Some("true" | "1" | "yes" | "on") => true,
        Some("false" | "0" | "no" | "off") => false,
        _ => std::io::stderr().is_terminal(),
    }
}
