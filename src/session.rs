//! Session lifecycle control.
//!
//! The session is the single in-process value tying the compiled strategy,
//! the installed firewall rules, and the running workers together. All
//! transitions happen under one lock, so concurrent control commands
//! serialize and at most one strategy is ever in effect.
//!
//! Ordering invariant: rules are installed before workers spawn, and workers
//! stop before rules are removed. A queue without a consumer drops packets;
//! tearing the rules down first means no packet is ever steered into a dead
//! queue.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cmd::CommandExecutor;
use crate::config::Config;
use crate::error::ZapretError;
use crate::firewall::{BackendStatus, FirewallManager};
use crate::process::{WorkerManager, WorkerStatus};
use crate::strategy::{self, CompiledStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Aggregate view returned by the `status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub running: bool,
    pub uptime_secs: u64,
    pub strategy: String,
    pub firewall: Option<BackendStatus>,
    pub workers: WorkerStatus,
}

struct SessionInner {
    state: SessionState,
    strategy: Option<CompiledStrategy>,
    firewall: Option<FirewallManager>,
    started_at: Option<Instant>,
}

pub struct SessionController {
    config: Config,
    executor: Arc<dyn CommandExecutor>,
    workers: WorkerManager,
    inner: Mutex<SessionInner>,
}

impl SessionController {
    pub fn new(config: Config, executor: Arc<dyn CommandExecutor>) -> Self {
        let workers = WorkerManager::new(
            config.nfqws_path.clone(),
            config.strategy_dir(),
            executor.clone(),
        );
        Self {
            config,
            executor,
            workers,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                strategy: None,
                firewall: None,
                started_at: None,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Startup recovery: restore the idle invariant even after a crash.
    /// Sweeps tagged firewall objects and stray workers; failures are
    /// warnings because a missing object is indistinguishable from a clean
    /// state.
    pub async fn recover(&self) {
        info!("running startup recovery");

        match FirewallManager::detect(
            self.executor.clone(),
            &self.config.interface,
            self.config.router_mode,
        ) {
            Ok(firewall) => {
                if let Err(e) = firewall.cleanup().await {
                    warn!(error = %e, "recovery: firewall cleanup failed");
                }
            }
            Err(e) => warn!(error = %e, "recovery: no firewall backend"),
        }

        if let Err(e) = self.workers.kill_all().await {
            warn!(error = %e, "recovery: worker sweep failed");
        }
    }

    /// Compile the strategy, install rules, then spawn workers. Any failure
    /// rolls the partial state back and returns to idle with the inner
    /// error kind preserved.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Idle {
            return Err(ZapretError::SessionState("daemon is already running".to_string()).into());
        }

        inner.state = SessionState::Starting;
        match self.do_start(&mut inner).await {
            Ok(()) => {
                inner.state = SessionState::Active;
                inner.started_at = Some(Instant::now());
                info!("session started");
                Ok(())
            }
            Err(e) => {
                inner.state = SessionState::Idle;
                Err(e).context("failed to start session")
            }
        }
    }

    async fn do_start(&self, inner: &mut SessionInner) -> Result<()> {
        let compiled = strategy::compile(&self.config.strategy, self.config.gamefilter)?;
        if compiled.is_empty() {
            warn!("strategy compiled to zero rules, session will filter nothing");
        }

        let firewall = FirewallManager::detect(
            self.executor.clone(),
            &self.config.interface,
            self.config.router_mode,
        )?;

        if let Err(e) = firewall.setup(&compiled.rules).await {
            // Partial state is tagged, so the same cleanup path removes it.
            if let Err(cleanup_err) = firewall.cleanup().await {
                warn!(error = %cleanup_err, "rollback: firewall cleanup failed");
            }
            return Err(e);
        }

        if let Err(e) = self.workers.start(&compiled.workers).await {
            // The supervisor already reaped its partial cohort; take the
            // installed rules back out before surfacing the error.
            if let Err(cleanup_err) = firewall.cleanup().await {
                warn!(error = %cleanup_err, "rollback: firewall cleanup failed");
            }
            return Err(e);
        }

        inner.strategy = Some(compiled);
        inner.firewall = Some(firewall);
        Ok(())
    }

    /// Tear down workers then rules. Partial failures are logged, never
    /// propagated: the session always lands in idle.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Idle {
            return Err(ZapretError::SessionState("daemon is not running".to_string()).into());
        }

        inner.state = SessionState::Stopping;
        self.teardown(&mut inner).await;
        inner.state = SessionState::Idle;
        info!("session stopped");
        Ok(())
    }

    /// Stop (when active) then start, with no command interleaved.
    pub async fn restart(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.state != SessionState::Idle {
            inner.state = SessionState::Stopping;
            self.teardown(&mut inner).await;
            inner.state = SessionState::Idle;
        }

        inner.state = SessionState::Starting;
        match self.do_start(&mut inner).await {
            Ok(()) => {
                inner.state = SessionState::Active;
                inner.started_at = Some(Instant::now());
                info!("session restarted");
                Ok(())
            }
            Err(e) => {
                inner.state = SessionState::Idle;
                Err(e).context("failed to restart session")
            }
        }
    }

    /// Signal-driven teardown on daemon exit. Unlike [`stop`] this is a
    /// no-op when idle.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Idle {
            return;
        }
        inner.state = SessionState::Stopping;
        self.teardown(&mut inner).await;
        inner.state = SessionState::Idle;
        info!("session shut down");
    }

    async fn teardown(&self, inner: &mut SessionInner) {
        if let Err(e) = self.workers.stop().await {
            warn!(error = %e, "failed to stop workers");
        }
        if let Some(firewall) = inner.firewall.take() {
            if let Err(e) = firewall.cleanup().await {
                warn!(error = %e, "failed to clean up firewall");
            }
        }
        if let Some(compiled) = inner.strategy.take() {
            debug!(rules = compiled.len(), "discarded compiled strategy");
        }
        inner.started_at = None;
    }

    /// Aggregate state + firewall + worker view; read-only.
    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;

        let firewall = match &inner.firewall {
            Some(manager) => manager.status().await.ok(),
            None => self.transient_firewall_status().await.ok(),
        };

        SessionStatus {
            state: inner.state,
            running: inner.state == SessionState::Active,
            uptime_secs: inner
                .started_at
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            strategy: self.config.strategy.display().to_string(),
            firewall,
            workers: self.workers.status().await,
        }
    }

    /// Firewall view for the `firewall` command; read-only.
    pub async fn firewall_status(&self) -> Result<BackendStatus> {
        let inner = self.inner.lock().await;
        match &inner.firewall {
            Some(manager) => manager.status().await,
            None => self.transient_firewall_status().await,
        }
    }

    async fn transient_firewall_status(&self) -> Result<BackendStatus> {
        let manager = FirewallManager::detect(
            self.executor.clone(),
            &self.config.interface,
            self.config.router_mode,
        )?;
        manager.status().await
    }

    /// Worker view for the `processes` command; read-only.
    pub async fn worker_status(&self) -> WorkerStatus {
        self.workers.status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::CmdOutput;
    use crate::error::{error_kind, ErrorKind};
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Executor that answers success to every firewall/pgrep call and
    /// records the invocations.
    struct FakeExecutor {
        calls: std::sync::Mutex<Vec<String>>,
        fail_contains: Option<String>,
    }

    impl FakeExecutor {
        fn new() -> Self {
            Self {
                calls: std::sync::Mutex::new(Vec::new()),
                fail_contains: None,
            }
        }

        fn failing_on(pattern: &str) -> Self {
            Self {
                calls: std::sync::Mutex::new(Vec::new()),
                fail_contains: Some(pattern.to_string()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandExecutor for FakeExecutor {
        fn execute(&self, program: &str, args: &[String]) -> Result<CmdOutput> {
            let line = format!("{program} {}", args.join(" "));
            self.calls.lock().unwrap().push(line.clone());

            if let Some(pattern) = &self.fail_contains {
                if line.contains(pattern.as_str()) {
                    return Ok(CmdOutput {
                        stdout: String::new(),
                        stderr: "injected failure".to_string(),
                        success: false,
                        code: Some(2),
                    });
                }
            }
            Ok(CmdOutput {
                stdout: String::new(),
                stderr: String::new(),
                success: true,
                code: Some(0),
            })
        }
    }

    fn fixture(dir: &TempDir, worker_exists: bool) -> Config {
        let strategy = dir.path().join("general.bat");
        std::fs::write(
            &strategy,
            "--filter-tcp=443 --dpi-desync=fake --new\n--filter-udp=50000-65000 --dpi-desync=fake2 --new\n",
        )
        .unwrap();

        let nfqws = dir.path().join("nfqws");
        if worker_exists {
            std::fs::write(&nfqws, "#!/bin/sh\nsleep 30\n").unwrap();
            std::fs::set_permissions(&nfqws, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut config = Config::default();
        config.strategy = strategy;
        config.interface = "eth0".to_string();
        config.nfqws_path = nfqws;
        config
    }

    #[tokio::test]
    async fn test_start_then_stop_lifecycle() {
        let dir = TempDir::new().unwrap();
        let controller =
            SessionController::new(fixture(&dir, true), Arc::new(FakeExecutor::new()));

        controller.start().await.unwrap();
        let status = controller.status().await;
        assert_eq!(status.state, SessionState::Active);
        assert!(status.running);
        assert_eq!(status.workers.count, 2);
        assert_eq!(status.workers.active_queues, vec![0, 1]);

        controller.stop().await.unwrap();
        let status = controller.status().await;
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.workers.count, 0);
    }

    #[tokio::test]
    async fn test_start_while_active_is_session_state_error() {
        let dir = TempDir::new().unwrap();
        let controller =
            SessionController::new(fixture(&dir, true), Arc::new(FakeExecutor::new()));

        controller.start().await.unwrap();
        let err = controller.start().await.unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::SessionState));
        assert!(err.to_string().contains("already running"));

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_session_state_error() {
        let dir = TempDir::new().unwrap();
        let controller =
            SessionController::new(fixture(&dir, true), Arc::new(FakeExecutor::new()));

        let err = controller.stop().await.unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::SessionState));
    }

    #[tokio::test]
    async fn test_start_rolls_back_when_worker_binary_missing() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(FakeExecutor::new());
        let controller = SessionController::new(fixture(&dir, false), executor.clone());

        let err = controller.start().await.unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::ProcessManagement));

        let status = controller.status().await;
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.workers.count, 0);
        // Rules went in, then the rollback took them back out.
        let calls = executor.calls();
        assert!(calls.iter().any(|c| c.starts_with("nft add rule")));
        let last_add = calls.iter().rposition(|c| c.starts_with("nft add rule")).unwrap();
        assert!(calls[last_add..].iter().any(|c| c.starts_with("nft list tables")));
    }

    #[tokio::test]
    async fn test_start_firewall_failure_preserves_kind() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(FakeExecutor::failing_on("add table inet zapretunix"));
        let controller = SessionController::new(fixture(&dir, true), executor);

        let err = controller.start().await.unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::FirewallSetup));
        assert_eq!(controller.status().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_start_bad_strategy_preserves_kind() {
        let dir = TempDir::new().unwrap();
        let mut config = fixture(&dir, true);
        std::fs::write(&config.strategy, "--filter-tcp=500-100 x --new\n").unwrap();
        config.gamefilter = false;
        let controller = SessionController::new(config, Arc::new(FakeExecutor::new()));

        let err = controller.start().await.unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::StrategyParse));
        assert_eq!(controller.status().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_restart_from_idle_starts() {
        let dir = TempDir::new().unwrap();
        let controller =
            SessionController::new(fixture(&dir, true), Arc::new(FakeExecutor::new()));

        controller.restart().await.unwrap();
        assert_eq!(controller.status().await.state, SessionState::Active);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_while_active_lands_active() {
        let dir = TempDir::new().unwrap();
        let controller =
            SessionController::new(fixture(&dir, true), Arc::new(FakeExecutor::new()));

        controller.start().await.unwrap();
        controller.restart().await.unwrap();
        let status = controller.status().await;
        assert_eq!(status.state, SessionState::Active);
        assert_eq!(status.workers.count, 2);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_sweeps_rules_and_workers() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(FakeExecutor::new());
        let controller = SessionController::new(fixture(&dir, true), executor.clone());

        controller.recover().await;

        let calls = executor.calls();
        assert!(calls.iter().any(|c| c.starts_with("nft list tables")));
        assert!(calls.iter().any(|c| c.starts_with("pgrep -f")));
    }

    #[tokio::test]
    async fn test_shutdown_is_noop_when_idle() {
        let dir = TempDir::new().unwrap();
        let controller =
            SessionController::new(fixture(&dir, true), Arc::new(FakeExecutor::new()));
        controller.shutdown().await;
        assert_eq!(controller.status().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_active_session() {
        let dir = TempDir::new().unwrap();
        let controller =
            SessionController::new(fixture(&dir, true), Arc::new(FakeExecutor::new()));

        controller.start().await.unwrap();
        controller.shutdown().await;
        let status = controller.status().await;
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.workers.count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_start_exactly_one_wins() {
        let dir = TempDir::new().unwrap();
        let controller = Arc::new(SessionController::new(
            fixture(&dir, true),
            Arc::new(FakeExecutor::new()),
        ));

        let a = {
            let c = controller.clone();
            tokio::spawn(async move { c.start().await })
        };
        let b = {
            let c = controller.clone();
            tokio::spawn(async move { c.start().await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok_count = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok_count, 1);
        let err = results.into_iter().find(|r| r.is_err()).unwrap().unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::SessionState));

        // Exactly one worker per queue at quiescence.
        let status = controller.status().await;
        assert_eq!(status.workers.count, 2);
        assert_eq!(status.workers.active_queues, vec![0, 1]);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_strategy_starts_and_warns() {
        let dir = TempDir::new().unwrap();
        let mut config = fixture(&dir, true);
        std::fs::write(&config.strategy, ":: nothing\n").unwrap();
        let controller = SessionController::new(config, Arc::new(FakeExecutor::new()));

        controller.start().await.unwrap();
        let status = controller.status().await;
        assert_eq!(status.state, SessionState::Active);
        assert_eq!(status.workers.count, 0);
        controller.stop().await.unwrap();
    }
}
