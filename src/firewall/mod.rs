//! Firewall reconciliation backends (nftables, iptables).
//!
//! Both backends implement the same contract: `setup` installs exactly the
//! compiled rules (after removing any prior tagged artefacts), `cleanup`
//! removes every object this controller owns and nothing else, `status`
//! observes without mutating. Ownership is tag-based: the nftables backend
//! tags each rule with a fixed comment, the iptables backend owns a dedicated
//! chain; objects without the tag are never touched.

mod iptables;
mod nftables;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use iptables::IptablesBackend;
pub use nftables::NftablesBackend;

use crate::cmd::{args_to_strings, CommandExecutor};
use crate::error::ZapretError;
use crate::strategy::FilterRule;

/// Comment attached to every nftables rule this controller creates.
pub const RULE_TAG: &str = "Added by zapret script";

/// Observed backend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirewallState {
    Active,
    Inactive,
    NoTable,
    NoChain,
}

impl std::fmt::Display for FirewallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FirewallState::Active => "active",
            FirewallState::Inactive => "inactive",
            FirewallState::NoTable => "no-table",
            FirewallState::NoChain => "no-chain",
        };
        f.write_str(s)
    }
}

/// Snapshot returned by [`FirewallBackend::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub kind: String,
    pub state: FirewallState,
    pub rule_count: usize,
}

/// Contract every firewall backend fulfills.
#[async_trait]
pub trait FirewallBackend: Send + Sync + std::fmt::Debug {
    /// Install exactly `rules`, removing prior tagged artefacts first.
    /// Failure may leave partial state behind, but only tagged state.
    async fn setup(&self, rules: &[FilterRule], iface: &str) -> Result<()>;

    /// Remove every tagged object. Idempotent; nothing to remove is success.
    async fn cleanup(&self) -> Result<()>;

    /// Observe backend state without mutating it.
    async fn status(&self) -> Result<BackendStatus>;

    fn kind(&self) -> &'static str;
}

/// Select a backend: nftables when its control tool answers the probe,
/// otherwise iptables, otherwise an error.
pub fn detect_backend(
    executor: Arc<dyn CommandExecutor>,
    router_mode: bool,
) -> Result<Box<dyn FirewallBackend>> {
    if probe(&executor, "nft", &["list", "tables"]) {
        debug!(backend = "nftables", "firewall backend detected");
        return Ok(Box::new(NftablesBackend::new(executor, router_mode)));
    }

    if probe(&executor, "iptables", &["-L", "-n"]) {
        debug!(backend = "iptables", "firewall backend detected");
        return Ok(Box::new(IptablesBackend::new(executor)));
    }

    Err(ZapretError::FirewallSetup {
        backend: "none",
        operation: "detect",
        message: "no supported firewall backend found (nftables/iptables)".to_string(),
    }
    .into())
}

fn probe(executor: &Arc<dyn CommandExecutor>, tool: &str, args: &[&str]) -> bool {
    executor
        .execute(tool, &args_to_strings(args))
        .map(|out| out.success)
        .unwrap_or(false)
}

/// Owns the selected backend plus the configured interface.
pub struct FirewallManager {
    backend: Box<dyn FirewallBackend>,
    iface: String,
}

impl FirewallManager {
    pub fn detect(
        executor: Arc<dyn CommandExecutor>,
        iface: &str,
        router_mode: bool,
    ) -> Result<Self> {
        let backend = detect_backend(executor, router_mode)?;
        Ok(Self {
            backend,
            iface: iface.to_string(),
        })
    }

    pub async fn setup(&self, rules: &[FilterRule]) -> Result<()> {
        debug!(
            backend = self.backend.kind(),
            interface = %self.iface,
            rules = rules.len(),
            "setting up firewall rules"
        );
        self.backend.setup(rules, &self.iface).await
    }

    pub async fn cleanup(&self) -> Result<()> {
        debug!(backend = self.backend.kind(), "cleaning up firewall rules");
        self.backend.cleanup().await
    }

    pub async fn status(&self) -> Result<BackendStatus> {
        self.backend.status().await
    }

    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }
}
