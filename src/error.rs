//! Error types for the zapret controller.
//!
//! Every failure carries a kind from a closed set so callers can match on
//! category (via [`ZapretError::kind`] or [`error_kind`]) instead of parsing
//! message strings. Wrapping with `anyhow::Context` keeps the innermost kind
//! reachable through `downcast_ref`.

use std::path::PathBuf;

use thiserror::Error;

/// Category of a [`ZapretError`], usable for matching without string parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigValidation,
    StrategyParse,
    FirewallSetup,
    ProcessManagement,
    ServiceOperation,
    NotFound,
    PermissionDenied,
    Timeout,
    SessionState,
}

#[derive(Error, Debug)]
pub enum ZapretError {
    #[error("configuration validation failed: {message} (field: {field})")]
    ConfigValidation { field: &'static str, message: String },

    #[error("strategy parsing failed: {message} (file: {file}, line: {line})")]
    StrategyParse {
        file: PathBuf,
        line: usize,
        message: String,
    },

    #[error("firewall setup failed: {message} (backend: {backend}, operation: {operation})")]
    FirewallSetup {
        backend: &'static str,
        operation: &'static str,
        message: String,
    },

    #[error("process management failed: {message} (command: {command}, pid: {pid:?})")]
    ProcessManagement {
        command: String,
        pid: Option<i32>,
        message: String,
    },

    /// Only produced at the boundary with the external service installer.
    #[error("service operation failed: {message} (init: {init_system}, operation: {operation})")]
    ServiceOperation {
        init_system: String,
        operation: String,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    SessionState(String),
}

impl ZapretError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ZapretError::ConfigValidation { .. } => ErrorKind::ConfigValidation,
            ZapretError::StrategyParse { .. } => ErrorKind::StrategyParse,
            ZapretError::FirewallSetup { .. } => ErrorKind::FirewallSetup,
            ZapretError::ProcessManagement { .. } => ErrorKind::ProcessManagement,
            ZapretError::ServiceOperation { .. } => ErrorKind::ServiceOperation,
            ZapretError::NotFound(_) => ErrorKind::NotFound,
            ZapretError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ZapretError::Timeout(_) => ErrorKind::Timeout,
            ZapretError::SessionState(_) => ErrorKind::SessionState,
        }
    }

    /// Map an OS-level error to the closed taxonomy, keeping the original
    /// message. Anything without a dedicated kind becomes a process error
    /// attributed to `command`.
    pub fn from_io(command: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::NotFound => ZapretError::NotFound(format!("{command}: {err}")),
            Io::PermissionDenied => ZapretError::PermissionDenied(format!("{command}: {err}")),
            Io::TimedOut => ZapretError::Timeout(format!("{command}: {err}")),
            _ => ZapretError::ProcessManagement {
                command: command.to_string(),
                pid: None,
                message: err.to_string(),
            },
        }
    }
}

/// Recover the kind from an `anyhow` chain, if a [`ZapretError`] is inside.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<ZapretError>().map(ZapretError::kind)
}
