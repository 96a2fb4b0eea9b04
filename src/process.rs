//! Server process lifecycle management
//!
//! Owns starting, gracefully stopping, and force-killing the wrapped server
//! process. At most one server is current at any instant; the previous one
//! is fully reaped and its pipes closed before a replacement is wired up.
//! One mutex guards the current process and its restart bookkeeping, held
//! for the whole duration of a restart and for every liveness read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::ProxyConfig;
use crate::router::PendingQueue;
use crate::session::SessionTracker;

/// Channel end the per-process reader task feeds server output lines into
pub type ServerOutputSender = mpsc::UnboundedSender<String>;

/// Error types for server process interaction
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no server process is running")]
    NotRunning,
}

// ============================================================================
// Restart Hook
// ============================================================================

/// Best-effort hook invoked before a watcher-triggered restart.
///
/// Failures are logged and never affect the restart itself.
#[async_trait]
pub trait RestartHook: Send + Sync {
    async fn run(&self) -> io::Result<()>;
}

/// Restart hook that runs an operator-configured shell command
pub struct ShellHook {
    command: String,
}

impl ShellHook {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[async_trait]
impl RestartHook for ShellHook {
    async fn run(&self) -> io::Result<()> {
        debug!(command = %self.command, "running restart hook");
        let status = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .status()
            .await?;
        if !status.success() {
            return Err(io::Error::other(format!("hook exited with {status}")));
        }
        Ok(())
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Snapshot of the supervisor's restart bookkeeping
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub restart_count: u32,
    pub last_restart: Option<DateTime<Utc>>,
}

struct SupervisorInner {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader_task: Option<JoinHandle<()>>,
    restart_count: u32,
    last_restart: Option<DateTime<Utc>>,
}

/// Supervises the wrapped server process across restarts
pub struct Supervisor {
    config: Arc<ProxyConfig>,
    session: Arc<SessionTracker>,
    pending: Arc<PendingQueue>,
    output_tx: ServerOutputSender,
    hook: Option<Arc<dyn RestartHook>>,
    inner: Mutex<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        config: Arc<ProxyConfig>,
        session: Arc<SessionTracker>,
        pending: Arc<PendingQueue>,
        output_tx: ServerOutputSender,
        hook: Option<Arc<dyn RestartHook>>,
    ) -> Self {
        Self {
            config,
            session,
            pending,
            output_tx,
            hook,
            inner: Mutex::new(SupervisorInner {
                child: None,
                stdin: None,
                reader_task: None,
                restart_count: 0,
                last_restart: None,
            }),
        }
    }

    /// Start the server process, replacing any current one.
    ///
    /// `run_daemon_hook` is true only for watcher-triggered restarts; the
    /// hook never runs for the initial start. Returns false only when the
    /// spawn itself fails.
    pub async fn start(&self, run_daemon_hook: bool) -> bool {
        let mut inner = self.inner.lock().await;

        self.stop_current(&mut inner).await;

        if run_daemon_hook {
            self.run_restart_hook().await;
        }

        let Some(program) = self.config.server_command.first() else {
            error!("no server command configured");
            return false;
        };
        let args = &self.config.server_command[1..];
        info!(%program, ?args, "starting server process");

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(%program, "failed to spawn server process: {e}");
                return false;
            }
        };

        let pid = child.id();
        let stdin = child.stdin.take();
        let reader_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(relay_server_stdout(stdout, self.output_tx.clone())));

        inner.child = Some(child);
        inner.stdin = stdin;
        inner.reader_task = reader_task;
        inner.restart_count += 1;
        inner.last_restart = Some(Utc::now());
        info!(?pid, restart_count = inner.restart_count, "server process started");

        // Anything queued for a previous process is stale now; the cached
        // initialize below covers the only message worth carrying over
        self.pending.clear();

        if inner.restart_count > 1 {
            match self.session.begin_recovery() {
                Some(cached) => {
                    info!("replaying cached initialize request to new server");
                    if let Err(e) = write_line(inner.stdin.as_mut(), &cached).await {
                        warn!("failed to replay initialize request: {e}");
                    }
                }
                None => {
                    info!("no cached initialize request, awaiting client re-initialization");
                }
            }
        }

        true
    }

    /// Stop the current server process and exit cleanly
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        self.stop_current(&mut inner).await;
    }

    /// Whether a server process is current and has not exited.
    ///
    /// A process that died on its own is reaped and read as not alive.
    pub async fn is_server_alive(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(%status, "server process exited unexpectedly");
                    inner.child = None;
                    inner.stdin = None;
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!("failed to poll server process: {e}");
                    false
                }
            },
            None => false,
        }
    }

    /// Write one protocol line (plus trailing newline) to the server's stdin
    pub async fn write_to_server(&self, line: &str) -> Result<(), ProcessError> {
        let mut inner = self.inner.lock().await;
        if inner.stdin.is_none() {
            return Err(ProcessError::NotRunning);
        }
        write_line(inner.stdin.as_mut(), line).await?;
        Ok(())
    }

    pub async fn status(&self) -> SupervisorStatus {
        let inner = self.inner.lock().await;
        SupervisorStatus {
            restart_count: inner.restart_count,
            last_restart: inner.last_restart,
        }
    }

    /// Terminate the current process: SIGTERM, grace period, then SIGKILL.
    ///
    /// Also waits for the stdout reader task so the old pipes are fully
    /// closed before a replacement is wired up.
    async fn stop_current(&self, inner: &mut SupervisorInner) {
        let Some(mut child) = inner.child.take() else {
            return;
        };

        // Closing stdin first gives well-behaved servers an EOF to exit on
        inner.stdin.take();

        if let Some(pid) = child.id() {
            info!(pid, "stopping server process");
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }

            match tokio::time::timeout(self.config.grace_period, child.wait()).await {
                Ok(Ok(status)) => info!(%status, "server process exited"),
                Ok(Err(e)) => error!("error waiting for server process: {e}"),
                Err(_) => {
                    warn!(pid, "server did not exit within grace period, killing");
                    if let Err(e) = child.kill().await {
                        error!("failed to kill server process: {e}");
                    }
                    let _ = child.wait().await;
                }
            }
        } else {
            // Already exited; reap it
            let _ = child.wait().await;
        }

        if let Some(task) = inner.reader_task.take() {
            let _ = task.await;
        }
    }

    async fn run_restart_hook(&self) {
        match &self.hook {
            Some(hook) => match hook.run().await {
                Ok(()) => info!("restart hook completed"),
                Err(e) => warn!("restart hook failed, continuing: {e}"),
            },
            None => debug!("no restart hook configured"),
        }
    }
}

/// Write one line plus newline to the given stdin pipe
async fn write_line(stdin: Option<&mut ChildStdin>, line: &str) -> io::Result<()> {
    let stdin = stdin.ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    Ok(())
}

/// Reader task feeding the server's stdout lines into the output channel
async fn relay_server_stdout(stdout: ChildStdout, tx: ServerOutputSender) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                trace!("server stdout closed");
                break;
            }
            Ok(_) => {
                let message = line.trim_end_matches(['\r', '\n']);
                if message.is_empty() {
                    continue;
                }
                if tx.send(message.to_string()).is_err() {
                    trace!("server output consumer dropped, stopping reader");
                    break;
                }
            }
            Err(e) => {
                error!("failed to read server stdout: {e}");
                break;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
