//! nftables backend.
//!
//! Owns one filter table (`inet zapretunix`) with an output-hooked chain.
//! Every rule carries [`RULE_TAG`] as its comment; cleanup lists the chain
//! with handles and deletes exactly the lines whose comment matches, so
//! foreign rules in the same chain survive. Router mode adds a separate NAT
//! table (`ip zapretnat`) that cleanup drops wholesale.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{BackendStatus, FirewallBackend, FirewallState, RULE_TAG};
use crate::cmd::{args_to_strings, CmdOutput, CommandExecutor};
use crate::error::ZapretError;
use crate::strategy::FilterRule;

const BACKEND: &str = "nftables";

const TABLE_FAMILY: &str = "inet";
const TABLE_NAME: &str = "zapretunix";
const CHAIN_NAME: &str = "output";

const NAT_TABLE_FAMILY: &str = "ip";
const NAT_TABLE_NAME: &str = "zapretnat";
const NAT_CHAIN_NAME: &str = "postrouting";

/// Packets already processed by a worker carry this mark and must not be
/// re-queued.
const HANDLED_MARK: &str = "0x40000000";

pub struct NftablesBackend {
    executor: Arc<dyn CommandExecutor>,
    router_mode: bool,
}

impl std::fmt::Debug for NftablesBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NftablesBackend")
            .field("router_mode", &self.router_mode)
            .finish()
    }
}

impl NftablesBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>, router_mode: bool) -> Self {
        Self {
            executor,
            router_mode,
        }
    }

    fn nft(&self, args: &[String]) -> Result<CmdOutput> {
        self.executor.execute("nft", args)
    }

    /// Run nft, mapping a non-zero exit into a tagged setup error.
    fn nft_checked(&self, operation: &'static str, args: &[String]) -> Result<()> {
        let out = self.nft(args)?;
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

    fn table_exists(&self) -> bool {
        self.nft(&args_to_strings(&["list", "tables"]))
            .map(|out| {
                out.success
                    && out
                        .stdout
                        .contains(&format!("{TABLE_FAMILY} {TABLE_NAME}"))
            })
            .unwrap_or(false)
    }

    fn chain_exists(&self) -> bool {
        self.nft(&args_to_strings(&[
            "list",
            "chain",
            TABLE_FAMILY,
            TABLE_NAME,
            CHAIN_NAME,
        ]))
        .map(|out| out.success)
        .unwrap_or(false)
    }

    fn nat_table_exists(&self) -> bool {
        self.nft(&args_to_strings(&["list", "tables"]))
            .map(|out| {
                out.success
                    && out
                        .stdout
                        .contains(&format!("{NAT_TABLE_FAMILY} {NAT_TABLE_NAME}"))
            })
            .unwrap_or(false)
    }

    /// Handles of rules in our chain whose comment equals the tag.
    fn tagged_rule_handles(&self) -> Result<Vec<String>> {
        let out = self.nft(&args_to_strings(&[
            "-a",
            "list",
            "chain",
            TABLE_FAMILY,
            TABLE_NAME,
            CHAIN_NAME,
        ]))?;
        if !out.success {
            return Err(ZapretError::FirewallSetup {
                backend: BACKEND,
                operation: "list_rules",
                message: out.stderr.trim().to_string(),
            }
            .into());
        }

        let mut handles = Vec::new();
        for line in out.stdout.lines() {
            if line.contains(RULE_TAG) {
                // `nft -a` suffixes each rule with `# handle N`.
                if let Some(handle) = line.split_whitespace().last() {
                    handles.push(handle.to_string());
                }
            }
        }
        Ok(handles)
    }

    fn create_table_and_chain(&self) -> Result<()> {
        self.nft_checked(
            "create_table",
            &args_to_strings(&["add", "table", TABLE_FAMILY, TABLE_NAME]),
        )?;
        self.nft_checked(
            "create_chain",
            &args_to_strings(&[
                "add", "chain", TABLE_FAMILY, TABLE_NAME, CHAIN_NAME, "{", "type", "filter",
                "hook", "output", "priority", "0;", "}",
            ]),
        )?;
        Ok(())
    }

    fn add_rule(&self, rule: &FilterRule, iface: &str) -> Result<()> {
        let mut args = args_to_strings(&["add", "rule", TABLE_FAMILY, TABLE_NAME, CHAIN_NAME]);
        if !iface.is_empty() && iface != "any" {
            args.push("oifname".to_string());
            args.push(format!("\"{iface}\""));
        }
        args.extend(args_to_strings(&["meta", "mark", "!=", HANDLED_MARK]));
        args.push(rule.protocol.as_str().to_string());
        args.push("dport".to_string());
        args.push(format!("{{{}}}", rule.ports));
        args.extend(args_to_strings(&["counter", "queue", "num"]));
        args.push(rule.queue_num.to_string());
        if rule.bypass_on_stall {
            args.push("bypass".to_string());
        }
        args.push("comment".to_string());
        args.push(format!("\"{RULE_TAG}\""));

        self.nft_checked("add_rule", &args)?;
        debug!(
            protocol = rule.protocol.as_str(),
            ports = %rule.ports,
            queue = rule.queue_num,
            "added nftables rule"
        );
        Ok(())
    }

    /// NAT table for router mode. Skipped for `any`: masquerade needs a
    /// concrete output interface.
    fn setup_nat(&self, iface: &str) -> Result<()> {
        if iface.is_empty() || iface == "any" {
            debug!("router mode with no selectable interface, skipping masquerade");
            return Ok(());
        }

        self.nft_checked(
            "create_nat_table",
            &args_to_strings(&["add", "table", NAT_TABLE_FAMILY, NAT_TABLE_NAME]),
        )?;
        self.nft_checked(
            "create_nat_chain",
            &args_to_strings(&[
                "add",
                "chain",
                NAT_TABLE_FAMILY,
                NAT_TABLE_NAME,
                NAT_CHAIN_NAME,
                "{",
                "type",
                "nat",
                "hook",
                "postrouting",
                "priority",
                "100;",
                "}",
            ]),
        )?;

        let mut args = args_to_strings(&[
            "add",
            "rule",
            NAT_TABLE_FAMILY,
            NAT_TABLE_NAME,
            NAT_CHAIN_NAME,
            "oifname",
        ]);
        args.push(format!("\"{iface}\""));
        args.push("masquerade".to_string());
        args.push("comment".to_string());
        args.push(format!("\"{RULE_TAG}\""));
        self.nft_checked("add_nat_rule", &args)?;

        debug!(interface = iface, "added postrouting masquerade rule");
        Ok(())
    }

    fn cleanup_tagged(&self) -> Result<()> {
        if self.table_exists() && self.chain_exists() {
            let handles = self.tagged_rule_handles()?;
            for handle in &handles {
                let args = args_to_strings(&[
                    "delete", "rule", TABLE_FAMILY, TABLE_NAME, CHAIN_NAME, "handle", handle,
                ]);
                match self.nft(&args) {
                    Ok(out) if out.success => {}
                    Ok(out) => {
                        warn!(handle = %handle, stderr = %out.stderr.trim(), "failed to delete nftables rule")
                    }
                    Err(e) => warn!(handle = %handle, error = %e, "failed to delete nftables rule"),
                }
            }

            // Only succeed when the chain/table hold nothing else.
            let _ = self.nft(&args_to_strings(&[
                "delete", "chain", TABLE_FAMILY, TABLE_NAME, CHAIN_NAME,
            ]));
            let _ = self.nft(&args_to_strings(&["delete", "table", TABLE_FAMILY, TABLE_NAME]));
        }

        if self.nat_table_exists() {
            let _ = self.nft(&args_to_strings(&[
                "delete",
                "table",
                NAT_TABLE_FAMILY,
                NAT_TABLE_NAME,
            ]));
        }

        Ok(())
    }
}

#[async_trait]
impl FirewallBackend for NftablesBackend {
    async fn setup(&self, rules: &[FilterRule], iface: &str) -> Result<()> {
        if let Err(e) = self.cleanup_tagged() {
            warn!(error = %e, "failed to clean up existing nftables rules");
        }

        self.create_table_and_chain()?;
        for rule in rules {
            self.add_rule(rule, iface)?;
        }

        if self.router_mode {
            self.setup_nat(iface)?;
        }

        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        debug!("cleaning up nftables rules");
        self.cleanup_tagged()
    }

    async fn status(&self) -> Result<BackendStatus> {
        if !self.table_exists() {
            return Ok(BackendStatus {
                kind: BACKEND.to_string(),
                state: FirewallState::NoTable,
                rule_count: 0,
            });
        }
        if !self.chain_exists() {
            return Ok(BackendStatus {
                kind: BACKEND.to_string(),
                state: FirewallState::NoChain,
                rule_count: 0,
            });
        }

        let rule_count = self.tagged_rule_handles()?.len();
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
