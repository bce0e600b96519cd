//! Daemon process management
//!
//! PID file ownership and detaching from the controlling terminal.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context};
use daemonize::Daemonize;
use tracing::info;

/// Guards the daemon's PID file
pub struct DaemonProcess {
    pid_file: PathBuf,
    owns_pid_file: bool,
}

impl DaemonProcess {
    pub fn new(pid_file: PathBuf) -> Self {
        Self {
            pid_file,
            owns_pid_file: false,
        }
    }

    /// Check whether the PID file names a live process
    ///
    /// A stale PID file is removed.
    pub fn is_running(&self) -> anyhow::Result<bool> {
        if !self.pid_file.exists() {
            return Ok(false);
        }

        let pid_content = fs::read_to_string(&self.pid_file)
            .with_context(|| format!("Failed to read PID file {}", self.pid_file.display()))?;

        let pid: i32 = match pid_content.trim().parse() {
            Ok(pid) => pid,
            Err(_) => bail!("Invalid PID in PID file {}", self.pid_file.display()),
        };

        match nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(pid))) {
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => {
                let _ = fs::remove_file(&self.pid_file);
                Ok(false)
            }
            Err(e) => Err(e).context("Failed to check daemon process status"),
        }
    }

    /// Detach from the terminal and write the PID file
    pub fn daemonize(&mut self) -> anyhow::Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).context("Failed to create PID file directory")?;
        }

        let daemonize = Daemonize::new()
            .pid_file(&self.pid_file)
            .chown_pid_file(true)
            .working_directory("/")
            .umask(0o027);

        daemonize.start().context("Failed to daemonize process")?;
        self.owns_pid_file = true;

        info!("Successfully daemonized process, PID: {}", process::id());
        Ok(())
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        // Never remove a file written by another daemon
        if self.owns_pid_file {
            let _ = fs::remove_file(&self.pid_file);
        }
    }
}

/// Default PID file path
pub fn get_default_pid_file() -> PathBuf {
    if nix::unistd::getuid().is_root() {
        return PathBuf::from("/run/icd-wireguard.pid");
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        Path::new(&runtime_dir).join("icd-wireguard.pid")
    } else {
        Path::new("/tmp").join(format!("icd-wireguard-{}.pid", nix::unistd::getuid()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_pid_file_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = DaemonProcess::new(dir.path().join("missing.pid"));

        assert!(!daemon.is_running().unwrap());
    }

    #[test]
    fn test_own_pid_is_running() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("live.pid");
        fs::write(&pid_file, process::id().to_string()).unwrap();

        let daemon = DaemonProcess::new(pid_file.clone());

        assert!(daemon.is_running().unwrap());
        drop(daemon);
        // Not ours, so dropping the guard leaves it in place
        assert!(pid_file.exists());
    }

    #[test]
    fn test_garbage_pid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bad.pid");
        fs::write(&pid_file, "not-a-pid").unwrap();

        assert!(DaemonProcess::new(pid_file).is_running().is_err());
    }
}
