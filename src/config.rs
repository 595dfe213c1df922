//! Configuration management for the zapret controller.
//!
//! The config record is a pure value: loaded once from a YAML file, overlaid
//! with `ZAPRET_`-prefixed environment variables, path-normalized, validated,
//! and never mutated afterwards.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::ZapretError;

/// Prefix for environment variable overrides (`ZAPRET_STRATEGY`, ...).
pub const ENV_PREFIX: &str = "ZAPRET";

/// Default socket the daemon listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/zapret.sock";
/// Default PID file location.
pub const DEFAULT_PID_FILE: &str = "/var/run/zapret.pid";
/// Default daemon log file.
pub const DEFAULT_LOG_FILE: &str = "/var/log/zapret/daemon.log";

/// Directory (under the binary's directory) where bundled strategies live.
const STRATEGY_DIR: &str = "zapret-latest";

/// Main configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Strategy file (relative paths resolve under `zapret-latest/`)
    pub strategy: PathBuf,

    /// Network interface to filter, or `any` for all interfaces
    pub interface: String,

    /// Substitute `%GameFilter%` with the game port range
    pub gamefilter: bool,

    /// Path to the nfqws worker binary
    pub nfqws_path: PathBuf,

    /// Enable debug logging
    pub debug: bool,

    /// Never prompt; fail instead of asking
    pub nointeractive: bool,

    /// Colored log output (None = auto-detect)
    pub log_color: Option<bool>,

    /// Add the postrouting masquerade rule for downstream clients
    pub router_mode: bool,

    /// Unix socket the daemon listens on
    pub socket_path: PathBuf,

    /// Daemon PID file
    pub pid_file: PathBuf,

    /// Daemon log file
    pub log_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strategy: PathBuf::new(),
            interface: String::new(),
            gamefilter: false,
            nfqws_path: PathBuf::new(),
            debug: false,
            nointeractive: false,
            log_color: None,
            router_mode: false,
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file plus environment overrides.
    ///
    /// A missing file is not an error as long as the environment supplies
    /// the required fields.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => serde_yaml::from_str::<Config>(&content)
                .with_context(|| format!("failed to parse config file: {:?}", path.as_ref()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read config file: {:?}", path.as_ref())
                })
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.resolve_paths(&base_dir());
        config.validate()?;

        debug!(
            strategy = %config.strategy.display(),
            interface = %config.interface,
            gamefilter = config.gamefilter,
            nfqws_path = %config.nfqws_path.display(),
            "configuration loaded"
        );

        Ok(config)
    }

    /// Overlay `ZAPRET_*` environment variables. The lookup is injected so
    /// tests can drive it without touching process state.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}_{name}"));

        if let Some(v) = var("STRATEGY") {
            self.strategy = PathBuf::from(v);
        }
        if let Some(v) = var("INTERFACE") {
            self.interface = v;
        }
        if let Some(v) = var("GAMEFILTER") {
            self.gamefilter = parse_bool(&v);
        }
        if let Some(v) = var("NFQWS_PATH") {
            self.nfqws_path = PathBuf::from(v);
        }
        if let Some(v) = var("DEBUG") {
            self.debug = parse_bool(&v);
        }
        if let Some(v) = var("NOINTERACTIVE") {
            self.nointeractive = parse_bool(&v);
        }
        if let Some(v) = var("LOG_COLOR") {
            self.log_color = Some(parse_bool(&v));
        }
        if let Some(v) = var("ROUTER_MODE") {
            self.router_mode = parse_bool(&v);
        }
        if let Some(v) = var("SOCKET_PATH") {
            self.socket_path = PathBuf::from(v);
        }
        if let Some(v) = var("PID_FILE") {
            self.pid_file = PathBuf::from(v);
        }
        if let Some(v) = var("LOG_FILE") {
            self.log_file = PathBuf::from(v);
        }
    }

    /// Normalize relative paths against `base` (the running binary's
    /// directory). A relative strategy resolves under the bundled strategy
    /// directory; an unset worker path defaults to `<base>/nfqws`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if !self.strategy.as_os_str().is_empty() && !self.strategy.is_absolute() {
            self.strategy = base.join(STRATEGY_DIR).join(&self.strategy);
        }
        if self.nfqws_path.as_os_str().is_empty() {
            self.nfqws_path = base.join("nfqws");
        } else if !self.nfqws_path.is_absolute() {
            self.nfqws_path = base.join(&self.nfqws_path);
        }
        for path in [&mut self.socket_path, &mut self.pid_file, &mut self.log_file] {
            if !path.as_os_str().is_empty() && !path.is_absolute() {
                *path = base.join(&*path);
            }
        }
    }

    /// Check required fields and referenced files.
    ///
    /// Missing strategy/interface settings and an unreadable strategy file
    /// are fatal; a missing worker binary or network interface only warns
    /// (the binary may be fetched later, the interface may come up later).
    pub fn validate(&self) -> Result<()> {
        if self.strategy.as_os_str().is_empty() {
            return Err(ZapretError::ConfigValidation {
                field: "strategy",
                message: "strategy is required".to_string(),
            }
            .into());
        }
        if self.interface.is_empty() {
            return Err(ZapretError::ConfigValidation {
                field: "interface",
                message: "interface is required".to_string(),
            }
            .into());
        }
        if !self.strategy.is_file() {
            return Err(ZapretError::ConfigValidation {
                field: "strategy",
                message: format!("strategy file not found: {}", self.strategy.display()),
            }
            .into());
        }
        if !self.nfqws_path.is_file() {
            warn!(path = %self.nfqws_path.display(), "nfqws binary not found");
        }
        if self.interface != "any"
            && !Path::new("/sys/class/net").join(&self.interface).exists()
        {
            warn!(interface = %self.interface, "network interface not found");
        }
        Ok(())
    }

    /// The directory workers run in, and which `lists/` / `bin/` arguments
    /// resolve against: the strategy file's directory.
    pub fn strategy_dir(&self) -> PathBuf {
        self.strategy
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Directory of the running binary, used as the base for relative paths.
pub fn base_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
