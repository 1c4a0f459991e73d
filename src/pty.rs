//! Shell processes attached to a pseudo-terminal.
//!
//! A [`PtyProcess`] owns the child and the master side of its terminal. Output
//! is consumed through a [`PtyReader`], which observes the owner's close signal
//! so an in-flight read returns as soon as the process is closed.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SpawnError;

const TERM: &str = "xterm-256color";

/// Identifies one upgraded terminal connection in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Result of a resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resize {
    Applied,
    /// Zero or negative geometry; nothing was changed.
    Ignored,
}

/// A shell child process and the master end of its pseudo-terminal.
pub struct PtyProcess {
    conn: ConnectionId,
    master: Option<Arc<AsyncFd<OwnedFd>>>,
    child: Option<Child>,
    closed: watch::Sender<bool>,
}

impl PtyProcess {
    /// Launch `shell` on a fresh pseudo-terminal.
    pub fn spawn(shell: &Path, conn: ConnectionId) -> Result<Self, SpawnError> {
        let OpenptyResult { master, slave } =
            openpty(None, None).map_err(|e| SpawnError::Openpty(e.into()))?;

        set_cloexec(master.as_raw_fd()).map_err(SpawnError::Configure)?;
        set_cloexec(slave.as_raw_fd()).map_err(SpawnError::Configure)?;
        set_nonblocking(master.as_raw_fd()).map_err(SpawnError::Configure)?;

        let stdin = slave.try_clone().map_err(SpawnError::Configure)?;
        let stdout = slave.try_clone().map_err(SpawnError::Configure)?;

        let mut cmd = Command::new(shell);
        cmd.stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(slave))
            .env("TERM", TERM)
            .kill_on_drop(true);

        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(io::Error::from)?;
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| SpawnError::Exec {
            shell: shell.to_path_buf(),
            source,
        })?;
        // Drop the parent's copies of the slave so EOF/EIO reaches us when the shell exits.
        drop(cmd);

        let master = AsyncFd::new(master).map_err(SpawnError::Configure)?;
        info!(%conn, pid = ?child.id(), shell = %shell.display(), "Spawned shell");

        let (closed, _) = watch::channel(false);
        Ok(Self {
            conn,
            master: Some(Arc::new(master)),
            child: Some(child),
            closed,
        })
    }

    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    pub fn is_closed(&self) -> bool {
        self.master.is_none()
    }

    /// A reader over the process output. Fails once the process is closed.
    pub fn reader(&self) -> io::Result<PtyReader> {
        let master = self.master.clone().ok_or_else(closed_error)?;
        Ok(PtyReader {
            master,
            closed: self.closed.subscribe(),
        })
    }

    /// Input half for a writer task. Fails once the process is closed.
    pub fn writer(&self) -> io::Result<PtyWriter> {
        let master = self.master.clone().ok_or_else(closed_error)?;
        Ok(PtyWriter {
            conn: self.conn,
            master,
            closed: self.closed.subscribe(),
        })
    }

    /// Write all of `data` to the shell's input. Returns an error if the
    /// process is closed while the write is pending.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let master = self.master.as_ref().ok_or_else(closed_error)?;
        write_master(master, &mut self.closed.subscribe(), data).await
    }

    /// Apply new terminal geometry. Non-positive dimensions are ignored.
    pub fn resize(&self, cols: i64, rows: i64) -> io::Result<Resize> {
        let master = self.master.as_ref().ok_or_else(closed_error)?;
        set_winsize(self.conn, master, cols, rows)
    }

    /// Current terminal geometry as `(cols, rows)`.
    pub fn size(&self) -> io::Result<(u16, u16)> {
        let master = self.master.as_ref().ok_or_else(closed_error)?;
        let mut winsize = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCGWINSZ writes a Winsize through a valid pointer.
        let rc = unsafe {
            libc::ioctl(master.get_ref().as_raw_fd(), libc::TIOCGWINSZ, &mut winsize)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((winsize.ws_col, winsize.ws_row))
    }

    /// Release the process and its terminal. Safe to call more than once and
    /// after the shell has already exited.
    pub fn close(&mut self) {
        if self.master.is_none() && self.child.is_none() {
            return;
        }
        self.closed.send_replace(true);
        self.master.take();

        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(conn = %self.conn, %status, "Shell already exited");
                }
                Ok(None) => {
                    if let Err(e) = child.start_kill() {
                        debug!(conn = %self.conn, error = %e, "Kill after exit race");
                    }
                    info!(conn = %self.conn, "Shell terminated");
                }
                Err(e) => {
                    warn!(conn = %self.conn, error = %e, "Could not query shell status");
                }
            }
            // Dropping the child leaves reaping to the runtime.
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read half of a [`PtyProcess`], owned by the output relay task.
pub struct PtyReader {
    master: Arc<AsyncFd<OwnedFd>>,
    closed: watch::Receiver<bool>,
}

impl PtyReader {
    /// Read the next chunk of output. `Ok(0)` means the shell side hung up.
    /// Returns an error once the owning process has been closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if *self.closed.borrow() {
                return Err(closed_error());
            }
            tokio::select! {
                _ = self.closed.changed() => return Err(closed_error()),
                ready = self.master.readable() => {
                    let mut guard = ready?;
                    match guard.try_io(|fd| read_fd(fd.get_ref().as_raw_fd(), buf)) {
                        Ok(Ok(n)) => return Ok(n),
                        // Linux reports a hung-up slave as EIO rather than EOF.
                        Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                        Ok(Err(e)) => return Err(e),
                        Err(_would_block) => continue,
                    }
                }
            }
        }
    }
}

/// Input half of a [`PtyProcess`], owned by the input relay task.
pub struct PtyWriter {
    conn: ConnectionId,
    master: Arc<AsyncFd<OwnedFd>>,
    closed: watch::Receiver<bool>,
}

impl PtyWriter {
    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    /// Write all of `data` to the shell's input. A write blocked on a shell
    /// that is not reading returns an error once the owner closes the process.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        write_master(&self.master, &mut self.closed, data).await
    }

    pub fn resize(&self, cols: i64, rows: i64) -> io::Result<Resize> {
        if *self.closed.borrow() {
            return Err(closed_error());
        }
        set_winsize(self.conn, &self.master, cols, rows)
    }
}

async fn write_master(
    master: &AsyncFd<OwnedFd>,
    closed: &mut watch::Receiver<bool>,
    mut data: &[u8],
) -> io::Result<()> {
    while !data.is_empty() {
        if *closed.borrow() {
            return Err(closed_error());
        }
        tokio::select! {
            _ = closed.changed() => return Err(closed_error()),
            ready = master.writable() => {
                let mut guard = ready?;
                match guard.try_io(|fd| write_fd(fd.get_ref().as_raw_fd(), data)) {
                    Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(Ok(n)) => data = &data[n..],
                    Ok(Err(e)) => return Err(e),
                    Err(_would_block) => continue,
                }
            }
        }
    }
    Ok(())
}

fn set_winsize(
    conn: ConnectionId,
    master: &AsyncFd<OwnedFd>,
    cols: i64,
    rows: i64,
) -> io::Result<Resize> {
    if cols <= 0 || rows <= 0 {
        return Ok(Resize::Ignored);
    }
    let winsize = Winsize {
        ws_row: clamp_dimension(rows),
        ws_col: clamp_dimension(cols),
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ reads a Winsize from a valid pointer.
    let rc = unsafe { libc::ioctl(master.get_ref().as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    debug!(%conn, cols = winsize.ws_col, rows = winsize.ws_row, "Resized terminal");
    Ok(Resize::Applied)
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "terminal closed")
}

fn clamp_dimension(value: i64) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for buf.len() bytes and fd is open.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    // SAFETY: data is valid for data.len() bytes and fd is open.
    let n = unsafe { libc::write(fd, data.as_ptr().cast::<libc::c_void>(), data.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
