//! Worker process supervision.
//!
//! One nfqws worker per netfilter queue, spawned with `--qnum N` prepended to
//! the compiled argument vector. Each child gets its own process group so the
//! whole subtree can be signalled. The handle table is the single source of
//! truth for managed workers; `kill_all` is the system-wide sweep that exists
//! for reboot survival and crash recovery and deliberately works outside it.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cmd::{args_to_strings, CommandExecutor};
use crate::error::ZapretError;
use crate::strategy::WorkerSpec;

/// How long a worker gets to exit after SIGTERM before SIGKILL.
const TERM_WAIT: Duration = Duration::from_secs(5);
const TERM_POLL: Duration = Duration::from_millis(100);

/// A managed worker. Exists from successful spawn to observed reap.
#[derive(Debug)]
pub struct WorkerHandle {
    pub pid: i32,
    pub pgid: i32,
    pub queue_num: u16,
    pub args: Vec<String>,
    pub started_at: Instant,
    child: Child,
}

/// Snapshot of the supervisor, as reported over IPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub count: usize,
    pub active_queues: Vec<u16>,
    pub running: bool,
}

pub struct WorkerManager {
    binary: PathBuf,
    /// Working directory for workers; relative `lists/`/`bin/` arguments
    /// resolve against it.
    workdir: PathBuf,
    executor: Arc<dyn CommandExecutor>,
    handles: Mutex<Vec<WorkerHandle>>,
}

impl WorkerManager {
    pub fn new(binary: PathBuf, workdir: PathBuf, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            binary,
            workdir,
            executor,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    /// Spawn one worker per spec. All-or-nothing: when worker `k` fails to
    /// spawn, workers `0..k` are torn down before the error returns.
    pub async fn start(&self, specs: &[WorkerSpec]) -> Result<()> {
        let mut handles = self.handles.lock().await;

        if !handles.is_empty() {
            warn!(count = handles.len(), "stopping leftover workers before start");
            Self::stop_all(&mut handles).await;
        }

        debug!(binary = %self.binary.display(), queues = specs.len(), "starting workers");

        for spec in specs {
            match self.spawn_worker(spec) {
                Ok(handle) => {
                    info!(queue = spec.queue_num, pid = handle.pid, "started worker");
                    handles.push(handle);
                }
                Err(e) => {
                    warn!(queue = spec.queue_num, error = %e, "worker spawn failed, rolling back");
                    Self::stop_all(&mut handles).await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn spawn_worker(&self, spec: &WorkerSpec) -> Result<WorkerHandle> {
        let mut command = Command::new(&self.binary);
        command
            .arg("--qnum")
            .arg(spec.queue_num.to_string())
            .args(&spec.args)
            .current_dir(&self.workdir)
            .process_group(0);

        let child = command.spawn().map_err(|e| ZapretError::ProcessManagement {
            command: self.binary.display().to_string(),
            pid: None,
            message: format!("failed to start process: {e}"),
        })?;

        let pid = child.id() as i32;
        Ok(WorkerHandle {
            pid,
            pgid: pid,
            queue_num: spec.queue_num,
            args: spec.args.clone(),
            started_at: Instant::now(),
            child,
        })
    }

    /// Stop every managed worker and clear the table. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        debug!(count = handles.len(), "stopping workers");
        Self::stop_all(&mut handles).await;
        Ok(())
    }

    async fn stop_all(handles: &mut MutexGuard<'_, Vec<WorkerHandle>>) {
        for mut handle in handles.drain(..) {
            if let Err(e) = Self::terminate(&mut handle).await {
                warn!(pid = handle.pid, error = %e, "failed to stop worker");
            }
        }
    }

    /// SIGTERM the worker's process group, wait a bounded interval, then
    /// SIGKILL and reap.
    async fn terminate(handle: &mut WorkerHandle) -> Result<()> {
        debug!(pid = handle.pid, queue = handle.queue_num, "stopping worker");

        if let Err(e) = signal_group(handle.pgid, libc::SIGTERM) {
            // Already gone is fine; everything else still gets the SIGKILL
            // path below.
            if e.raw_os_error() != Some(libc::ESRCH) {
                warn!(pid = handle.pid, error = %e, "SIGTERM failed");
            }
        }

        let deadline = Instant::now() + TERM_WAIT;
        loop {
            match handle.child.try_wait() {
                Ok(Some(status)) => {
                    info!(pid = handle.pid, %status, "worker exited");
                    return Ok(());
                }
                Ok(None) if Instant::now() < deadline => {
                    tokio::time::sleep(TERM_POLL).await;
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(ZapretError::ProcessManagement {
                        command: format!("{:?}", handle.args),
                        pid: Some(handle.pid),
                        message: format!("failed to wait for process: {e}"),
                    }
                    .into())
                }
            }
        }

        warn!(pid = handle.pid, "worker ignored SIGTERM, killing");
        let _ = signal_group(handle.pgid, libc::SIGKILL);
        handle
            .child
            .wait()
            .map_err(|e| ZapretError::ProcessManagement {
                command: format!("{:?}", handle.args),
                pid: Some(handle.pid),
                message: format!("failed to reap process: {e}"),
            })?;

        info!(pid = handle.pid, "worker killed");
        Ok(())
    }

    /// System-wide sweep: SIGTERM every process matching the worker binary,
    /// managed or not. No matches is success.
    pub async fn kill_all(&self) -> Result<()> {
        debug!(binary = %self.binary.display(), "sweeping all worker processes");

        let args = args_to_strings(&["-f", &self.binary.display().to_string()]);
        let out = self.executor.execute("pgrep", &args)?;

        if !out.success {
            // pgrep exits 1 when nothing matched.
            if out.code == Some(1) {
                return Ok(());
            }
            return Err(ZapretError::ProcessManagement {
                command: "pgrep".to_string(),
                pid: None,
                message: format!("failed to find worker processes: {}", out.stderr.trim()),
            }
            .into());
        }

        for pid_str in out.stdout.split_whitespace() {
            let Ok(pid) = pid_str.parse::<i32>() else {
                warn!(pid = pid_str, "invalid pid from pgrep");
                continue;
            };
            if let Err(e) = signal_pid(pid, libc::SIGTERM) {
                warn!(pid, error = %e, "failed to terminate worker process");
            } else {
                info!(pid, "terminated stray worker");
            }
        }

        Ok(())
    }

    /// Liveness snapshot: a queue is active when its worker answers a
    /// zero-signal probe.
    pub async fn status(&self) -> WorkerStatus {
        let handles = self.handles.lock().await;

        let active_queues: Vec<u16> = handles
            .iter()
            .filter(|h| process_alive(h.pid))
            .map(|h| h.queue_num)
            .collect();

        WorkerStatus {
            count: handles.len(),
            running: !active_queues.is_empty(),
            active_queues,
        }
    }

    /// Queue numbers of all managed workers, live or not.
    pub async fn queues(&self) -> Vec<u16> {
        self.handles.lock().await.iter().map(|h| h.queue_num).collect()
    }
}

fn signal_group(pgid: i32, sig: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill(2) with a negative argument signals the process group; it
    // touches no memory and reports failure through errno.
    let rc = unsafe { libc::kill(-pgid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn signal_pid(pid: i32, sig: libc::c_int) -> std::io::Result<()> {
    // SAFETY: as above, for a single pid.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn process_alive(pid: i32) -> bool {
    // SAFETY: signal 0 performs only the existence/permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}
