use std::future::Future;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot, watch};

use super::UserContext;
use crate::ipc::SessionId;

/// How long a terminated shell gets before SIGKILL. Must stay below the
/// spawner's grace period for servers.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long to keep draining output after the shell has exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// What a PTY shell is started with.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub cols: u16,
    pub rows: u16,
    pub term: String,
}

/// A shell running on its own pseudo-terminal.
///
/// Output is delivered on the channel handed out by [`PtyProcess::spawn`];
/// the returned oneshot fires once the shell has exited and its output has
/// been drained.
pub struct PtyProcess {
    id: SessionId,
    pid: u32,
    shell: String,
    master: Arc<AsyncFd<OwnedFd>>,
    /// Flips to true once the shell has been reaped
    exited: watch::Receiver<bool>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("shell", &self.shell)
            .finish()
    }
}

impl PtyProcess {
    /// Allocate a PTY and start `user`'s shell on it.
    pub fn spawn(
        user: &UserContext,
        opts: &SpawnOptions,
        output_tx: mpsc::UnboundedSender<Bytes>,
    ) -> Result<(Self, oneshot::Receiver<Option<i32>>)> {
        let pty = nix::pty::openpty(None, None).context("Failed to allocate PTY")?;
        let master = pty.master;
        let slave = pty.slave;

        let id = session_id_for(slave.as_raw_fd())?;

        set_cloexec_nonblock(master.as_raw_fd());
        set_pty_size(master.as_raw_fd(), opts.cols, opts.rows);

        let shell = user.shell.to_string_lossy().to_string();
        let base = shell.rsplit('/').next().unwrap_or(&shell).to_string();

        let mut cmd = tokio::process::Command::new(&user.shell);
        // Login shell so profile files get sourced
        if matches!(base.as_str(), "bash" | "sh" | "zsh" | "fish") {
            cmd.arg("-l");
        }
        cmd.env_clear()
            .env("HOME", &user.home)
            .env("USER", &user.name)
            .env("LOGNAME", &user.name)
            .env("SHELL", &user.shell)
            .env("TERM", &opts.term)
            .env(
                "PATH",
                std::env::var("PATH").unwrap_or_else(|_| {
                    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()
                }),
            )
            .current_dir(&user.home)
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave))
            .kill_on_drop(false);

        if nix::unistd::geteuid().is_root() && user.uid != 0 {
            cmd.uid(user.uid).gid(user.gid);
        }

        unsafe {
            cmd.pre_exec(|| {
                // New session with the PTY (already on stdin) as controlling terminal
                if nix::libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start shell {}", shell))?;
        // Dropping the command closes the parent's copies of the slave
        drop(cmd);

        let pid = child.id().context("Shell exited before it could be tracked")?;

        let master = Arc::new(AsyncFd::new(master).context("Failed to register PTY master")?);
        let reader = spawn_pty_reader(master.clone(), output_tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        let (reaped_tx, exited) = watch::channel(false);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Failed to wait for shell");
                    None
                }
            };
            reaped_tx.send_replace(true);
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
            let _ = exit_tx.send(code);
        });

        tracing::debug!(session = %id, pid, shell = %shell, user = %user.name, "Spawned PTY shell");

        Ok((
            Self {
                id,
                pid,
                shell: base,
                master,
                exited,
            },
            exit_rx,
        ))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write input bytes to the PTY.
    pub async fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            let mut guard = self.master.writable().await?;
            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let rest = &data[written..];
                let n = unsafe { nix::libc::write(fd, rest.as_ptr() as *const _, rest.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Set the terminal dimensions.
    pub fn resize(&self, cols: u16, rows: u16) {
        set_pty_size(self.master.get_ref().as_raw_fd(), cols, rows);
    }

    /// Current terminal dimensions as (cols, rows).
    pub fn size(&self) -> (u16, u16) {
        let mut ws = nix::libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe {
            nix::libc::ioctl(
                self.master.get_ref().as_raw_fd(),
                nix::libc::TIOCGWINSZ,
                &mut ws,
            );
        }
        (ws.ws_col, ws.ws_row)
    }

    /// Name of the foreground process on the terminal, falling back to the shell.
    pub fn foreground_process_name(&self) -> String {
        let pgrp = unsafe { nix::libc::tcgetpgrp(self.master.get_ref().as_raw_fd()) };
        let pid = if pgrp > 0 { pgrp } else { self.pid as i32 };
        procfs::process::Process::new(pid)
            .and_then(|p| p.stat())
            .map(|stat| stat.comm)
            .unwrap_or_else(|_| self.shell.clone())
    }

    /// Hang up the terminal's process group and terminate the shell now.
    /// The returned future resolves once the shell has been reaped, sending
    /// SIGKILL to the group if it outlives [`KILL_GRACE`].
    pub fn terminate(&self) -> impl Future<Output = ()> + Send + 'static {
        let pid = Pid::from_raw(self.pid as i32);
        // The shell is a session leader, so its pid is also the process group id
        let _ = signal::killpg(pid, Signal::SIGHUP);
        let _ = signal::kill(pid, Signal::SIGTERM);

        let mut exited = self.exited.clone();
        async move {
            let reaped = tokio::time::timeout(KILL_GRACE, exited.wait_for(|done| *done))
                .await
                .is_ok();
            if !reaped {
                tracing::debug!(pid = pid.as_raw(), "Shell ignored SIGTERM, sending SIGKILL");
                let _ = signal::killpg(pid, Signal::SIGKILL);
                let _ = exited.wait_for(|done| *done).await;
            }
        }
    }
}

/// Derive the session id from the slave device: /dev/pts/7 -> pty-7
fn session_id_for(slave_fd: RawFd) -> Result<SessionId> {
    let path = std::fs::read_link(format!("/proc/self/fd/{}", slave_fd))
        .context("Failed to resolve PTY slave device")?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("PTY slave device has no name")?;
    Ok(SessionId::new(format!("pty-{}", name)))
}

fn set_cloexec_nonblock(fd: RawFd) {
    unsafe {
        let flags = nix::libc::fcntl(fd, nix::libc::F_GETFL);
        nix::libc::fcntl(fd, nix::libc::F_SETFL, flags | nix::libc::O_NONBLOCK);
        let fd_flags = nix::libc::fcntl(fd, nix::libc::F_GETFD);
        nix::libc::fcntl(fd, nix::libc::F_SETFD, fd_flags | nix::libc::FD_CLOEXEC);
    }
}

/// Set the window size on a PTY master fd
fn set_pty_size(fd: RawFd, cols: u16, rows: u16) {
    let ws = nix::libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        nix::libc::ioctl(fd, nix::libc::TIOCSWINSZ, &ws);
    }
}

/// Read from the master until EOF/EIO, forwarding every chunk.
fn spawn_pty_reader(
    master: Arc<AsyncFd<OwnedFd>>,
    output_tx: mpsc::UnboundedSender<Bytes>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let mut guard = match master.readable().await {
                Ok(g) => g,
                Err(_) => break,
            };

            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe { nix::libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else if n == 0 {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "PTY EOF",
                    ))
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => {
                    if output_tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                // EIO once the last slave fd closes
                Ok(Err(_)) => break,
                Err(_would_block) => continue,
            }
        }
    })
}
