use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::{BoxFuture, FutureExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::config;
use crate::pty::UserContext;

/// Time a server gets to exit after SIGTERM before it is sent SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Resolves once a terminated server is gone for good.
pub type Termination = BoxFuture<'static, ()>;

/// A launched server process as seen by the instance registry.
pub trait ServerHandle: Send + 'static {
    fn pid(&self) -> u32;

    /// Ask the server to stop right away. The returned future escalates if
    /// needed and resolves once the server has been reaped; it must be driven
    /// to completion.
    fn terminate(self) -> Termination;

    /// Whether the server already exited on its own.
    fn exited(&mut self) -> bool {
        false
    }
}

/// Starts a server for `user` listening on `port`.
pub trait Launch: Send + Sync + 'static {
    type Handle: ServerHandle;

    fn launch(&self, user: &UserContext, port: u16) -> Result<Self::Handle>;
}

/// Launches servers by re-executing the current binary as
/// `termbridge server <PORT> <UID>`, with output going to the per-port log.
pub struct ProcessLauncher {
    exe: PathBuf,
    config_path: Option<PathBuf>,
    verbose: bool,
}

impl ProcessLauncher {
    pub fn current(config_path: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to get current executable path")?;
        Ok(Self {
            exe,
            config_path,
            verbose,
        })
    }
}

impl Launch for ProcessLauncher {
    type Handle = ServerProcess;

    fn launch(&self, user: &UserContext, port: u16) -> Result<ServerProcess> {
        config::ensure_dirs()?;
        let log_path = config::server_log_path(port)?;
        let log = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create {}", log_path.display()))?;

        let mut cmd = Command::new(&self.exe);
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        if self.verbose {
            cmd.arg("--verbose");
        }
        cmd.arg("server")
            .arg(port.to_string())
            .arg(user.uid.to_string())
            .env("HOME", &user.home)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .kill_on_drop(false);

        if nix::unistd::geteuid().is_root() && user.uid != 0 {
            cmd.uid(user.uid).gid(user.gid);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to launch server on port {}", port))?;
        let pid = child
            .id()
            .context("Server exited before it could be tracked")?;

        tracing::info!(pid, port, user = %user.name, log = %log_path.display(), "Launched server");
        Ok(ServerProcess { child, pid })
    }
}

/// A server child process of the broker.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    pid: u32,
}

impl ServerHandle for ServerProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn terminate(mut self) -> Termination {
        let pid = self.pid;
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(pid, error = %e, "SIGTERM failed");
        }
        async move {
            match tokio::time::timeout(KILL_GRACE, self.child.wait()).await {
                Ok(Ok(status)) => tracing::info!(pid, %status, "Server exited"),
                Ok(Err(e)) => tracing::warn!(pid, error = %e, "Failed to wait for server"),
                Err(_) => {
                    tracing::warn!(pid, "Server ignored SIGTERM, sending SIGKILL");
                    // kill() also waits, so the child is reaped either way
                    if let Err(e) = self.child.kill().await {
                        tracing::warn!(pid, error = %e, "SIGKILL failed");
                    }
                }
            }
        }
        .boxed()
    }

    fn exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminate_stops_and_reaps_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        let mut handle = ServerProcess { child, pid };
        assert!(!handle.exited());

        tokio::time::timeout(Duration::from_secs(3), handle.terminate())
            .await
            .expect("terminate did not resolve");
        // Reaped children no longer exist, so signal 0 fails
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[tokio::test]
    async fn test_terminate_escalates_when_sigterm_ignored() {
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let handle = ServerProcess { child, pid };
        // Let the trap install
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = tokio::time::Instant::now();
        tokio::time::timeout(KILL_GRACE + Duration::from_secs(3), handle.terminate())
            .await
            .expect("terminate did not resolve");
        assert!(started.elapsed() >= KILL_GRACE);
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[tokio::test]
    async fn test_exited_detects_self_exit() {
        let child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        let mut handle = ServerProcess { child, pid };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !handle.exited() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
