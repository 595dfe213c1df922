//! Command execution abstraction.
//!
//! All firewall-tool and process-sweep invocations (`nft`, `iptables`,
//! `pgrep`) go through the [`CommandExecutor`] trait so unit tests can mock
//! system commands instead of running them.

use anyhow::Result;
use std::process::{Command, Stdio};

use crate::error::ZapretError;

#[cfg(test)]
use mockall::automock;

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status 0.
    pub success: bool,
    /// Exit code, when the process was not killed by a signal.
    pub code: Option<i32>,
}

/// Runs external commands and captures their output.
///
/// Arguments are `&[String]` rather than `&[&str]` because mockall cannot
/// express the nested lifetime.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, program: &str, args: &[String]) -> Result<CmdOutput>;
}

/// Production executor backed by `std::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for SystemExecutor {
    fn execute(&self, program: &str, args: &[String]) -> Result<CmdOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| ZapretError::from_io(program, e))?;

        Ok(CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Convert a borrowed argument list into the owned form the trait takes.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};

    #[test]
    fn test_args_to_strings() {
        assert_eq!(args_to_strings(&["-L", "-n"]), vec!["-L", "-n"]);
        assert!(args_to_strings(&[]).is_empty());
    }

    #[test]
    fn test_cmd_output_default() {
        let out = CmdOutput::default();
        assert!(!out.success);
        assert!(out.code.is_none());
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn test_system_executor_captures_stdout() {
        let exec = SystemExecutor::new();
        let out = exec.execute("echo", &args_to_strings(&["-n", "hello"])).unwrap();
        assert!(out.success);
        assert_eq!(out.code, Some(0));
        assert_eq!(out.stdout, "hello");
    }

    #[test]
    fn test_system_executor_nonzero_exit_is_not_an_error() {
        let exec = SystemExecutor::new();
        let out = exec.execute("false", &[]).unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(1));
    }

    #[test]
    fn test_system_executor_missing_binary_maps_to_not_found() {
        let exec = SystemExecutor::new();
        let err = exec
            .execute("definitely-not-a-real-binary-xyz", &[])
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));
    }

    #[test]
    fn test_mock_executor_dispatch() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|program, args| program == "nft" && args == ["list".to_string(), "tables".to_string()])
            .times(1)
            .returning(|_, _| {
                Ok(CmdOutput {
                    stdout: "table inet zapretunix\n".to_string(),
                    stderr: String::new(),
                    success: true,
                    code: Some(0),
                })
            });

        let out = mock
            .execute("nft", &args_to_strings(&["list", "tables"]))
            .unwrap();
        assert!(out.success);
        assert!(out.stdout.contains("zapretunix"));
    }
}
