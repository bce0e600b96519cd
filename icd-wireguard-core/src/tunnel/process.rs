//! Tunnel tool process management
//!
//! Launches the bringup/teardown commands as a configured user, reports
//! their exit and terminates them on request. Every spawned child is reaped
//! by a watcher task; nothing is left as a zombie.

use crate::error::SpawnError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Pid, User};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Opaque identity of one spawned process
///
/// Tokens are never reused within a daemon run, so a stale handle can never
/// address a newer process that happens to get the same PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessToken(u64);

impl ProcessToken {
    /// Build a token from its raw value
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ProcessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a live child process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub token: ProcessToken,
    /// OS process id, for logging and host process-watch registration only
    pub pid: u32,
}

/// How a watched process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitStatus {
    /// Exit code for a normal exit
    pub code: Option<i32>,
    /// Terminating signal number
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// A normal exit with the given code
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Death by signal
    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Whether the process exited with code 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Callback invoked exactly once when a watched process terminates
pub type ExitCallback = Box<dyn FnOnce(ExitStatus) + Send + 'static>;

/// Launches and supervises external commands
///
/// `spawn` returns immediately with a live handle; `watch` registers the
/// single exit callback for it. Callers must `watch` every handle they get,
/// which is what reaps the child.
pub trait ProcessRunner: Send + Sync {
    /// Run `program args..` as `user`
    fn spawn(&self, user: &str, program: &Path, args: &[String]) -> Result<ProcessHandle, SpawnError>;

    /// Register the exit callback for a spawned process
    fn watch(&self, handle: &ProcessHandle, on_exit: ExitCallback);

    /// Ask a process to terminate; a no-op once it has exited
    fn terminate(&self, handle: &ProcessHandle);
}

enum Tracked {
    /// Spawned, exit callback not registered yet
    Spawned {
        child: Child,
        terminate_requested: bool,
    },
    /// Owned by a watcher task; the sender asks it to terminate the child
    Watched(Option<oneshot::Sender<()>>),
}

/// ProcessRunner backed by `tokio::process`
///
/// Termination sends SIGTERM, waits the grace period, then SIGKILLs. Signals
/// are delivered by the task that owns the `Child`, so they can only reach a
/// process that has not been reaped yet.
pub struct SystemProcessRunner {
    children: Arc<Mutex<HashMap<ProcessToken, Tracked>>>,
    next_token: AtomicU64,
    grace: Duration,
}

impl SystemProcessRunner {
    /// Create a runner with the given SIGTERM-to-SIGKILL grace period
    pub fn new(grace: Duration) -> Self {
        Self {
            children: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(1),
            grace,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProcessToken, Tracked>> {
        lock_children(&self.children)
    }
}

fn lock_children(
    children: &Mutex<HashMap<ProcessToken, Tracked>>,
) -> std::sync::MutexGuard<'_, HashMap<ProcessToken, Tracked>> {
    match children.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn signal_child(child: &Child, signal: Signal) {
    // id() is None once the child has been reaped
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
            debug!("Failed to send {} to process {}: {}", signal, pid, e);
        }
    }
}

async fn supervise(
    mut child: Child,
    mut terminate_rx: oneshot::Receiver<()>,
    grace: Duration,
) -> ExitStatus {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut terminate_rx => {
            signal_child(&child, Signal::SIGTERM);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!("Graceful shutdown timed out after {:?}, sending SIGKILL", grace);
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };

    match status {
        Ok(status) => status.into(),
        Err(e) => {
            warn!("Failed to wait for child process: {}", e);
            ExitStatus::default()
        }
    }
}

impl ProcessRunner for SystemProcessRunner {
    fn spawn(&self, user: &str, program: &Path, args: &[String]) -> Result<ProcessHandle, SpawnError> {
        let account = User::from_name(user)
            .map_err(|e| SpawnError::ForkFailed {
                reason: format!("user lookup for {} failed: {}", user, e),
            })?
            .ok_or_else(|| SpawnError::UserNotFound {
                user: user.to_string(),
            })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        // Only switch credentials when they differ from ours, so the daemon
        // can also drive the tool unprivileged as its own user.
        if account.gid != nix::unistd::getgid() {
            cmd.gid(account.gid.as_raw());
        }
        if account.uid != nix::unistd::getuid() {
            cmd.uid(account.uid.as_raw());
        }

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                SpawnError::ExecFailed {
                    program: program.display().to_string(),
                    reason: e.to_string(),
                }
            }
            _ => SpawnError::ForkFailed {
                reason: e.to_string(),
            },
        })?;

        let pid = child.id().ok_or_else(|| SpawnError::ForkFailed {
            reason: "spawned process has no pid".to_string(),
        })?;
        let token = ProcessToken(self.next_token.fetch_add(1, Ordering::Relaxed));

        self.lock().insert(
            token,
            Tracked::Spawned {
                child,
                terminate_requested: false,
            },
        );

        info!(
            "Spawned {} {} as {} (pid {}, token {})",
            program.display(),
            args.join(" "),
            user,
            pid,
            token
        );
        Ok(ProcessHandle { token, pid })
    }

    fn watch(&self, handle: &ProcessHandle, on_exit: ExitCallback) {
        let mut children = self.lock();
        let (child, terminate_requested) = match children.remove(&handle.token) {
            Some(Tracked::Spawned {
                child,
                terminate_requested,
            }) => (child, terminate_requested),
            Some(watched @ Tracked::Watched(_)) => {
                warn!("Process {} is already watched", handle.token);
                children.insert(handle.token, watched);
                return;
            }
            None => {
                warn!("Cannot watch unknown process {}", handle.token);
                return;
            }
        };
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let terminate_tx = if terminate_requested {
            let _ = terminate_tx.send(());
            None
        } else {
            Some(terminate_tx)
        };
        children.insert(handle.token, Tracked::Watched(terminate_tx));
        drop(children);

        let registry = Arc::clone(&self.children);
        let token = handle.token;
        let pid = handle.pid;
        let grace = self.grace;
        tokio::spawn(async move {
            let status = supervise(child, terminate_rx, grace).await;
            lock_children(&registry).remove(&token);
            debug!("Process {} (token {}) exited with {}", pid, token, status);
            on_exit(status);
        });
    }

    fn terminate(&self, handle: &ProcessHandle) {
        let mut children = self.lock();
        match children.get_mut(&handle.token) {
            Some(Tracked::Watched(sender)) => {
                if let Some(sender) = sender.take() {
                    info!("Terminating process {} (token {})", handle.pid, handle.token);
                    let _ = sender.send(());
                }
            }
            Some(Tracked::Spawned {
                terminate_requested,
                ..
            }) => {
                // Honoured as soon as a watcher takes ownership
                *terminate_requested = true;
            }
            None => debug!("Process {} already exited, nothing to terminate", handle.token),
        }
    }
}
