//! PTY process wrapper.
//!
//! A [`PtyProcess`] owns exactly one shell attached to a freshly allocated
//! pseudo-terminal. Output is pushed to an [`OutputStream`] by a blocking
//! reader; the stream ends when the shell (and everything holding the
//! terminal open) has exited.
//!
//! Closing a process tears down its whole terminal session: every process
//! whose session id is the shell's pid is hung up, then killed if it lingers,
//! and the master side of the pseudo-terminal is released.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::TerminalSize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Errors raised by a PTY process.
#[derive(Error, Debug)]
pub enum PtyError {
    /// The shell could not be started (missing executable, permissions, no PTY).
    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    /// Writing to the shell's input failed.
    #[error("failed to write to PTY: {0}")]
    Write(String),

    /// The process has already exited or been closed.
    #[error("shell process has exited")]
    Exited,

    /// The terminal geometry could not be changed.
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// Tearing down the process failed.
    #[error("failed to close PTY: {0}")]
    Close(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Final status of a shell process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The process exited with this code.
    Exited(i32),
}

impl SessionStatus {
    /// Returns the exit code.
    pub fn code(self) -> i32 {
        match self {
            SessionStatus::Exited(code) => code,
        }
    }
}

impl From<portable_pty::ExitStatus> for SessionStatus {
    fn from(status: portable_pty::ExitStatus) -> Self {
        SessionStatus::Exited(status.exit_code() as i32)
    }
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the blocking reader and the consumer.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// How long session members get to exit after SIGHUP before they are killed.
#[cfg(unix)]
const HANGUP_GRACE: Duration = Duration::from_millis(250);

/// Parameters for spawning a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Shell executable.
    pub shell: String,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
    /// Initial terminal geometry.
    pub size: TerminalSize,
    /// Working directory; the host process's directory when `None`.
    pub cwd: Option<PathBuf>,
    /// Extra environment, applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Value for `TERM`.
    pub term: String,
}

impl SpawnOptions {
    /// Creates options for the given shell with default geometry.
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            args: Vec::new(),
            size: TerminalSize::default(),
            cwd: None,
            env: Vec::new(),
            term: "xterm-color".to_string(),
        }
    }

    /// Sets the initial geometry.
    pub fn with_size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    /// Sets the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the shell arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Output chunks of a PTY process, in the order the OS produced them.
pub struct OutputStream {
    rx: mpsc::Receiver<Bytes>,
}

impl OutputStream {
    /// Receives the next chunk. Returns `None` once the process has exited.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Feeds every chunk to `on_data` until the process exits.
    pub async fn for_each<F>(mut self, mut on_data: F)
    where
        F: FnMut(Bytes),
    {
        while let Some(chunk) = self.rx.recv().await {
            on_data(chunk);
        }
    }
}

struct Geometry {
    /// `None` once the process has been closed.
    master: Option<Box<dyn MasterPty + Send>>,
    size: TerminalSize,
}

/// A shell process attached to a pseudo-terminal.
pub struct PtyProcess {
    /// The PTY master handle and its current size.
    geometry: Mutex<Geometry>,

    /// The writer for the PTY; `None` once closed.
    writer: Mutex<Option<Box<dyn Write + Send>>>,

    /// The child process.
    child: Arc<std::sync::Mutex<Box<dyn Child + Send + Sync>>>,

    /// Cleared when output hits EOF or the process is closed.
    running: Arc<AtomicBool>,

    /// Exit status, once the process has been reaped.
    teardown: Mutex<Option<SessionStatus>>,

    /// Process ID.
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawns a shell on a new pseudo-terminal.
    ///
    /// Must be called from within a Tokio runtime: the output reader runs on
    /// the blocking pool.
    pub fn spawn(options: SpawnOptions) -> Result<(Self, OutputStream), PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: options.size.rows,
                cols: options.size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.args(&options.args);
        if let Some(ref dir) = options.cwd {
            cmd.cwd(dir);
        }
        cmd.env("TERM", &options.term);
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(format!("{}: {}", options.shell, e)))?;

        // Only the child may hold the slave side, otherwise the reader never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        start_reader(reader, tx, Arc::clone(&running), pid);

        tracing::debug!(
            pid = ?pid,
            shell = %options.shell,
            size = %options.size,
            "Spawned shell on PTY"
        );

        let process = PtyProcess {
            geometry: Mutex::new(Geometry {
                master: Some(pair.master),
                size: options.size,
            }),
            writer: Mutex::new(Some(writer)),
            child: Arc::new(std::sync::Mutex::new(child)),
            running,
            teardown: Mutex::new(None),
            pid,
        };

        Ok((process, OutputStream { rx }))
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the current terminal geometry.
    pub async fn size(&self) -> TerminalSize {
        self.geometry.lock().await.size
    }

    /// Writes bytes to the shell's input.
    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if !self.is_running() {
            return Err(PtyError::Exited);
        }

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(PtyError::Exited)?;
        writer
            .write_all(data)
            .map_err(|e| PtyError::Write(e.to_string()))?;
        writer.flush().map_err(|e| PtyError::Write(e.to_string()))?;

        Ok(())
    }

    /// Changes the OS-level terminal geometry.
    pub async fn resize(&self, size: TerminalSize) -> Result<(), PtyError> {
        if !self.is_running() {
            return Err(PtyError::Exited);
        }

        let mut geometry = self.geometry.lock().await;
        geometry
            .master
            .as_ref()
            .ok_or(PtyError::Exited)?
            .resize(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))?;
        geometry.size = size;

        tracing::debug!(pid = ?self.pid, size = %size, "Resized PTY");
        Ok(())
    }

    /// Checks whether the process has exited without waiting.
    pub async fn try_wait(&self) -> Result<Option<SessionStatus>, PtyError> {
        let child = Arc::clone(&self.child);
        let status = tokio::task::spawn_blocking(move || {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            child.try_wait()
        })
        .await
        .map_err(|e| PtyError::Close(e.to_string()))??;

        Ok(status.map(SessionStatus::from))
    }

    /// Terminates the shell and every process in its terminal session, reaps
    /// the shell and releases the pseudo-terminal.
    ///
    /// Idempotent: concurrent and repeated calls all observe the status
    /// recorded by the first teardown.
    pub async fn close(&self) -> Result<SessionStatus, PtyError> {
        let mut teardown = self.teardown.lock().await;
        if let Some(status) = *teardown {
            return Ok(status);
        }

        self.running.store(false, Ordering::SeqCst);

        let child = Arc::clone(&self.child);
        let pid = self.pid;
        let status = tokio::task::spawn_blocking(move || {
            #[cfg(unix)]
            if let Some(pid) = pid {
                hangup_session(pid);
            }

            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            if child.try_wait()?.is_none() {
                // Sends SIGHUP, escalating to SIGKILL after a short grace period.
                if let Err(e) = child.kill() {
                    tracing::debug!(error = %e, "Kill failed, process may have exited");
                }
            }
            let status = child.wait();

            #[cfg(unix)]
            if let Some(pid) = pid {
                kill_session_survivors(pid);
            }
            status
        })
        .await
        .map_err(|e| PtyError::Close(e.to_string()))??;

        // Nothing may keep the master open once the shell is gone.
        self.writer.lock().await.take();
        self.geometry.lock().await.master.take();

        let status = SessionStatus::from(status);
        *teardown = Some(status);

        tracing::debug!(pid = ?self.pid, status = ?status, "Closed PTY process");
        Ok(status)
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        let reaped = self
            .teardown
            .try_lock()
            .map(|status| status.is_some())
            .unwrap_or(false);
        if reaped {
            return;
        }

        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = child.kill();

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_session(pid, nix::sys::signal::Signal::SIGKILL);
        }
    }
}

/// Runs the blocking read loop, forwarding chunks until EOF.
fn start_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Bytes>,
    running: Arc<AtomicBool>,
    pid: Option<u32>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    tracing::debug!(pid = ?pid, "PTY EOF - process exited");
                    break;
                }
                Ok(n) => {
                    // Blocks when the consumer lags, throttling the shell instead of dropping output.
                    if tx.blocking_send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                        tracing::trace!(pid = ?pid, "Output consumer dropped");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Linux reports EIO on the master once the slave side is gone.
                    tracing::debug!(pid = ?pid, error = %e, "PTY read ended");
                    break;
                }
            }
        }
        running.store(false, Ordering::SeqCst);
    });
}

/// Processes whose session id is `sid`, the shell's pid.
///
/// Background jobs live in their own process groups, so the shell's group
/// alone does not cover them. Walks `/proc`; elsewhere only the shell's
/// process group is known.
#[cfg(unix)]
fn session_members(sid: u32) -> Vec<nix::unistd::Pid> {
    use nix::unistd::{getpgid, getsid, Pid};

    let sid = Pid::from_raw(sid as i32);
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return match getpgid(Some(sid)) {
            Ok(_) => vec![sid],
            Err(_) => Vec::new(),
        };
    };

    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<i32>().ok())
        .map(Pid::from_raw)
        .filter(|pid| getsid(Some(*pid)).is_ok_and(|s| s == sid) && !is_zombie(*pid))
        .collect()
}

/// Whether `/proc` reports `pid` as exited but not yet reaped.
#[cfg(unix)]
fn is_zombie(pid: nix::unistd::Pid) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| state == 'Z' || state == 'X')
}

/// Sends `signal` to every member of the session. Returns how many were signalled.
#[cfg(unix)]
fn signal_session(sid: u32, signal: nix::sys::signal::Signal) -> usize {
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    // The group covers the foreground job even where /proc is unavailable.
    let _ = killpg(Pid::from_raw(sid as i32), signal);

    let members = session_members(sid);
    for pid in &members {
        if let Err(e) = kill(*pid, signal) {
            tracing::trace!(pid = %pid, error = %e, "Signal to session member failed");
        }
    }
    members.len()
}

/// Hangs up the shell's whole terminal session.
#[cfg(unix)]
fn hangup_session(sid: u32) {
    let members = signal_session(sid, nix::sys::signal::Signal::SIGHUP);
    tracing::trace!(sid = sid, members = members, "Sent SIGHUP to session");
}

/// Kills whatever in the session ignored the hangup.
#[cfg(unix)]
fn kill_session_survivors(sid: u32) {
    let deadline = std::time::Instant::now() + HANGUP_GRACE;
    while std::time::Instant::now() < deadline {
        if session_members(sid).is_empty() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let killed = signal_session(sid, nix::sys::signal::Signal::SIGKILL);
    if killed > 0 {
        tracing::debug!(sid = sid, killed = killed, "Killed session members that survived SIGHUP");
    }
}

/// Returns the platform default shell.
///
/// `$SHELL` (or `/bin/sh`) on Unix-like systems, `powershell.exe` on Windows.
pub fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}
