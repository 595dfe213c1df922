//! iptables backend.
//!
//! Ownership lives in a dedicated chain (`ZAPRET_UNIX`): every rule this
//! controller creates goes there, and the only mutation outside it is a
//! single jump appended to `OUTPUT`, removed by name on cleanup. Port sets
//! expand to one rule per element because iptables has no set syntax in a
//! plain `--dport` match.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{BackendStatus, FirewallBackend, FirewallState};
use crate::cmd::{args_to_strings, CmdOutput, CommandExecutor};
use crate::error::ZapretError;
use crate::strategy::FilterRule;

const BACKEND: &str = "iptables";

/// Chain name doubling as the ownership tag.
const CHAIN_NAME: &str = "ZAPRET_UNIX";

pub struct IptablesBackend {
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for IptablesBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IptablesBackend").finish()
    }
}

impl IptablesBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn ipt(&self, args: &[String]) -> Result<CmdOutput> {
        self.executor.execute("iptables", args)
    }

    fn ipt_checked(&self, operation: &'static str, args: &[String]) -> Result<()> {
        let out = self.ipt(args)?;
        if !out.success {
            return Err(ZapretError::FirewallSetup {
                backend: BACKEND,
                operation,
                message: out.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn chain_exists(&self) -> bool {
        self.ipt(&args_to_strings(&["-L", CHAIN_NAME, "-n"]))
            .map(|out| out.success)
            .unwrap_or(false)
    }

    fn jump_rule_exists(&self) -> bool {
        self.ipt(&args_to_strings(&["-C", "OUTPUT", "-j", CHAIN_NAME]))
            .map(|out| out.success)
            .unwrap_or(false)
    }

    fn create_chain(&self) -> Result<()> {
        let out = self.ipt(&args_to_strings(&["-N", CHAIN_NAME]))?;
        if out.success {
            return Ok(());
        }
        // Exit code 1: the chain already exists. Reuse it after a flush.
        if out.code == Some(1) {
            return self.ipt_checked("flush_chain", &args_to_strings(&["-F", CHAIN_NAME]));
        }
        Err(ZapretError::FirewallSetup {
            backend: BACKEND,
            operation: "create_chain",
            message: out.stderr.trim().to_string(),
        }
        .into())
    }

    fn add_rule(&self, rule: &FilterRule, iface: &str) -> Result<()> {
        for port in expand_ports(&rule.ports) {
            let mut args = args_to_strings(&["-A", CHAIN_NAME]);
            if !iface.is_empty() && iface != "any" {
                args.push("-o".to_string());
                args.push(iface.to_string());
            }
            args.push("-p".to_string());
            args.push(rule.protocol.as_str().to_string());
            args.push("--dport".to_string());
            args.push(port.clone());
            args.extend(args_to_strings(&["-j", "NFQUEUE", "--queue-num"]));
            args.push(rule.queue_num.to_string());

            self.ipt_checked("add_rule", &args)?;
            debug!(
                protocol = rule.protocol.as_str(),
                port = %port,
                queue = rule.queue_num,
                "added iptables rule"
            );
        }
        Ok(())
    }

    fn attach_chain_to_output(&self) -> Result<()> {
        if self.jump_rule_exists() {
            return Ok(());
        }
        self.ipt_checked(
            "attach_chain",
            &args_to_strings(&["-A", "OUTPUT", "-j", CHAIN_NAME]),
        )
    }

    fn cleanup_tagged(&self) -> Result<()> {
        if !self.chain_exists() {
            return Ok(());
        }

        // Jump first, so no packet traverses a chain mid-teardown.
        let _ = self.ipt(&args_to_strings(&["-D", "OUTPUT", "-j", CHAIN_NAME]));

        let out = self.ipt(&args_to_strings(&["-F", CHAIN_NAME]))?;
        if !out.success {
            warn!(stderr = %out.stderr.trim(), "failed to flush chain");
        }
        let _ = self.ipt(&args_to_strings(&["-X", CHAIN_NAME]));

        Ok(())
    }

    fn count_chain_rules(&self) -> Result<usize> {
        let out = self.ipt(&args_to_strings(&["-L", CHAIN_NAME, "-n", "--line-numbers"]))?;
        if !out.success {
            return Err(ZapretError::FirewallSetup {
                backend: BACKEND,
                operation: "count_rules",
                message: out.stderr.trim().to_string(),
            }
            .into());
        }
        // First two lines are the chain banner and the column header.
        Ok(out
            .stdout
            .lines()
            .skip(2)
            .filter(|line| !line.trim().is_empty())
            .count())
    }
}

/// Expand a port set expression into individual `--dport` arguments:
/// singletons as-is, ranges as `lo:hi`.
fn expand_ports(ports: &str) -> Vec<String> {
    ports
        .split(',')
        .map(str::trim)
        .filter(|element| !element.is_empty())
        .map(|element| match element.split_once('-') {
            Some((lo, hi)) => format!("{}:{}", lo.trim(), hi.trim()),
            None => element.to_string(),
        })
        .collect()
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    async fn setup(&self, rules: &[FilterRule], iface: &str) -> Result<()> {
        if let Err(e) = self.cleanup_tagged() {
            warn!(error = %e, "failed to clean up existing iptables rules");
        }

        self.create_chain()?;
        for rule in rules {
            self.add_rule(rule, iface)?;
        }
        self.attach_chain_to_output()?;

        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        debug!("cleaning up iptables rules");
        self.cleanup_tagged()
    }

    async fn status(&self) -> Result<BackendStatus> {
        if !self.chain_exists() {
            return Ok(BackendStatus {
                kind: BACKEND.to_string(),
                state: FirewallState::NoChain,
                rule_count: 0,
            });
        }

        let rule_count = self.count_chain_rules()?;
        let state = if rule_count > 0 {
            FirewallState::Active
        } else {
            FirewallState::Inactive
        };
        Ok(BackendStatus {
            kind: BACKEND.to_string(),
            state,
            rule_count,
        })
    }

    fn kind(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::MockCommandExecutor;
    use crate::error::{error_kind, ErrorKind};
    use crate::strategy::Protocol;

    fn ok_output(stdout: &str) -> CmdOutput {
        CmdOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    fn fail_output(code: i32, stderr: &str) -> CmdOutput {
        CmdOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            success: false,
            code: Some(code),
        }
    }

    fn rule(proto: Protocol, ports: &str, queue: u16) -> FilterRule {
        FilterRule {
            protocol: proto,
            ports: ports.to_string(),
            queue_num: queue,
            bypass_on_stall: true,
        }
    }

    fn joined(args: &[String]) -> String {
        args.join(" ")
    }

    #[test]
    fn test_expand_ports_singletons() {
        assert_eq!(expand_ports("443"), vec!["443"]);
        assert_eq!(expand_ports("80,443,8080"), vec!["80", "443", "8080"]);
    }

    #[test]
    fn test_expand_ports_ranges() {
        assert_eq!(expand_ports("1-65535"), vec!["1:65535"]);
        assert_eq!(
            expand_ports("443,50000-65000"),
            vec!["443", "50000:65000"]
        );
    }

    #[test]
    fn test_expand_ports_skips_empty_elements() {
        assert_eq!(expand_ports(""), Vec::<String>::new());
        assert_eq!(expand_ports("443,"), vec!["443"]);
    }

    #[tokio::test]
    async fn test_setup_expands_ranges_and_attaches_jump() {
        let mut mock = MockCommandExecutor::new();

        // cleanup probe: chain not there yet
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-L ZAPRET_UNIX -n")
            .returning(|_, _| Ok(fail_output(1, "No chain/target/match by that name.")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-N ZAPRET_UNIX")
            .times(1)
            .returning(|_, _| Ok(ok_output("")));
        mock.expect_execute()
            .withf(|_, args| {
                joined(args)
                    == "-A ZAPRET_UNIX -o eth0 -p udp --dport 443 -j NFQUEUE --queue-num 0"
            })
            .times(1)
            .returning(|_, _| Ok(ok_output("")));
        mock.expect_execute()
            .withf(|_, args| {
                joined(args)
                    == "-A ZAPRET_UNIX -o eth0 -p udp --dport 50000:65000 -j NFQUEUE --queue-num 0"
            })
            .times(1)
            .returning(|_, _| Ok(ok_output("")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-C OUTPUT -j ZAPRET_UNIX")
            .returning(|_, _| Ok(fail_output(1, "")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-A OUTPUT -j ZAPRET_UNIX")
            .times(1)
            .returning(|_, _| Ok(ok_output("")));

        let backend = IptablesBackend::new(Arc::new(mock));
        backend
            .setup(&[rule(Protocol::Udp, "443,50000-65000", 0)], "eth0")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_setup_reuses_existing_chain_after_flush() {
        let mut mock = MockCommandExecutor::new();

        // cleanup finds the old chain and tears it down
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-L ZAPRET_UNIX -n")
            .returning(|_, _| Ok(ok_output("Chain ZAPRET_UNIX (1 references)\n")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-D OUTPUT -j ZAPRET_UNIX")
            .returning(|_, _| Ok(ok_output("")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-F ZAPRET_UNIX")
            .returning(|_, _| Ok(ok_output("")));
        // chain still referenced elsewhere, -X fails, setup recreates
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-X ZAPRET_UNIX")
            .returning(|_, _| Ok(fail_output(1, "Directory not empty")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-N ZAPRET_UNIX")
            .returning(|_, _| Ok(fail_output(1, "Chain already exists.")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-C OUTPUT -j ZAPRET_UNIX")
            .returning(|_, _| Ok(ok_output("")));

        let backend = IptablesBackend::new(Arc::new(mock));
        backend.setup(&[], "any").await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_rule_failure_is_firewall_setup_error() {
        let mut mock = MockCommandExecutor::new();

        mock.expect_execute()
            .withf(|_, args| joined(args) == "-L ZAPRET_UNIX -n")
            .returning(|_, _| Ok(fail_output(1, "")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-N ZAPRET_UNIX")
            .returning(|_, _| Ok(ok_output("")));
        mock.expect_execute()
            .withf(|_, args| joined(args).starts_with("-A ZAPRET_UNIX"))
            .returning(|_, _| Ok(fail_output(2, "iptables v1.8.7: unknown option")));

        let backend = IptablesBackend::new(Arc::new(mock));
        let err = backend
            .setup(&[rule(Protocol::Tcp, "443", 0)], "any")
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::FirewallSetup));
    }

    #[tokio::test]
    async fn test_setup_omits_interface_for_any() {
        let mut mock = MockCommandExecutor::new();

        mock.expect_execute()
            .withf(|_, args| joined(args) == "-L ZAPRET_UNIX -n")
            .returning(|_, _| Ok(fail_output(1, "")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-N ZAPRET_UNIX")
            .returning(|_, _| Ok(ok_output("")));
        mock.expect_execute()
            .withf(|_, args| {
                joined(args) == "-A ZAPRET_UNIX -p tcp --dport 443 -j NFQUEUE --queue-num 3"
            })
            .times(1)
            .returning(|_, _| Ok(ok_output("")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-C OUTPUT -j ZAPRET_UNIX")
            .returning(|_, _| Ok(ok_output("")));

        let backend = IptablesBackend::new(Arc::new(mock));
        backend
            .setup(&[rule(Protocol::Tcp, "443", 3)], "any")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_removes_jump_then_chain() {
        let mut mock = MockCommandExecutor::new();

        mock.expect_execute()
            .withf(|_, args| joined(args) == "-L ZAPRET_UNIX -n")
            .returning(|_, _| Ok(ok_output("Chain ZAPRET_UNIX (1 references)\n")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-D OUTPUT -j ZAPRET_UNIX")
            .times(1)
            .returning(|_, _| Ok(ok_output("")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-F ZAPRET_UNIX")
            .times(1)
            .returning(|_, _| Ok(ok_output("")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-X ZAPRET_UNIX")
            .times(1)
            .returning(|_, _| Ok(ok_output("")));

        let backend = IptablesBackend::new(Arc::new(mock));
        backend.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_missing_chain_is_success() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-L ZAPRET_UNIX -n")
            .returning(|_, _| Ok(fail_output(1, "No chain/target/match by that name.")));

        let backend = IptablesBackend::new(Arc::new(mock));
        backend.cleanup().await.unwrap();
        backend.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_no_chain() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-L ZAPRET_UNIX -n")
            .returning(|_, _| Ok(fail_output(1, "")));

        let backend = IptablesBackend::new(Arc::new(mock));
        let status = backend.status().await.unwrap();
        assert_eq!(status.state, FirewallState::NoChain);
        assert_eq!(status.kind, "iptables");
    }

    #[tokio::test]
    async fn test_status_counts_rules() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-L ZAPRET_UNIX -n")
            .returning(|_, _| Ok(ok_output("Chain ZAPRET_UNIX (1 references)\n")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-L ZAPRET_UNIX -n --line-numbers")
            .returning(|_, _| {
                Ok(ok_output(concat!(
                    "Chain ZAPRET_UNIX (1 references)\n",
                    "num  target   prot opt source      destination\n",
                    "1    NFQUEUE  tcp  --  0.0.0.0/0   0.0.0.0/0   tcp dpt:443 NFQUEUE num 0\n",
                    "2    NFQUEUE  udp  --  0.0.0.0/0   0.0.0.0/0   udp dpts:50000:65000 NFQUEUE num 1\n",
                )))
            });

        let backend = IptablesBackend::new(Arc::new(mock));
        let status = backend.status().await.unwrap();
        assert_eq!(status.state, FirewallState::Active);
        assert_eq!(status.rule_count, 2);
    }

    #[tokio::test]
    async fn test_status_empty_chain_is_inactive() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-L ZAPRET_UNIX -n")
            .returning(|_, _| Ok(ok_output("Chain ZAPRET_UNIX (0 references)\n")));
        mock.expect_execute()
            .withf(|_, args| joined(args) == "-L ZAPRET_UNIX -n --line-numbers")
            .returning(|_, _| {
                Ok(ok_output(
                    "Chain ZAPRET_UNIX (0 references)\nnum  target   prot opt source      destination\n",
                ))
            });

        let backend = IptablesBackend::new(Arc::new(mock));
        let status = backend.status().await.unwrap();
        assert_eq!(status.state, FirewallState::Inactive);
        assert_eq!(status.rule_count, 0);
    }
}
