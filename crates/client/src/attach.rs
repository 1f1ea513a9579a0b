//! Attaches the local terminal to a remote shell.

use std::io::Read;

use anyhow::Context;
use protocol::{CloseReason, SessionClosed, Utf8Decoder};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::controller::{ControllerError, ControllerOptions, Notice, TerminalController};
use crate::emulator::{CrosstermEmulator, Emulator};
use crate::link::WsLink;

/// Options for [`run`].
#[derive(Debug, Clone)]
pub struct AttachOptions {
    /// Bridge URL.
    pub url: String,
    /// Controller behaviour.
    pub controller: ControllerOptions,
}

/// Why an attach ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detach {
    /// The remote shell ended.
    SessionClosed(SessionClosed),
    /// The bridge dropped the connection.
    ConnectionLost,
    /// Local input reached end of file.
    InputClosed,
}

impl std::fmt::Display for Detach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Detach::SessionClosed(SessionClosed {
                reason: CloseReason::ProcessExited,
                exit_code: Some(code),
            }) => write!(f, "shell exited with status {}", code),
            Detach::SessionClosed(closed) => write!(f, "session closed ({:?})", closed.reason),
            Detach::ConnectionLost => f.write_str("connection to the bridge was lost"),
            Detach::InputClosed => f.write_str("input closed"),
        }
    }
}

/// Runs an interactive session on the local terminal until it ends.
pub async fn run(options: AttachOptions) -> anyhow::Result<Detach> {
    let mut link = WsLink::connect(&options.url)
        .await
        .with_context(|| format!("Failed to connect to {}", options.url))?;

    let mut controller = TerminalController::new(CrosstermEmulator::stdout(), options.controller);
    controller
        .mount(link.sender())
        .context("Failed to set up the terminal")?;

    let result = drive(&mut controller, &mut link).await;

    controller.close();
    link.close().await;
    result
}

async fn drive<E: Emulator>(
    controller: &mut TerminalController<E>,
    link: &mut WsLink,
) -> anyhow::Result<Detach> {
    let mut input = spawn_stdin_reader();
    let mut decoder = Utf8Decoder::new();
    let mut resized = ResizeSignal::new()?;

    loop {
        tokio::select! {
            envelope = link.recv() => {
                let Some(envelope) = envelope else {
                    controller.transport_lost();
                    return Ok(Detach::ConnectionLost);
                };
                match controller.on_server_event(&envelope).await {
                    Ok(None) => {}
                    Ok(Some(Notice::Closed(closed))) => {
                        info!(reason = ?closed.reason, exit_code = ?closed.exit_code, "Session closed");
                        return Ok(Detach::SessionClosed(closed));
                    }
                    Ok(Some(Notice::Error(notice))) => {
                        warn!(code = ?notice.code, "Bridge error: {}", notice.message);
                        controller.show(&format!("\r\n[termbridge] {}\r\n", notice.message))?;
                        if !notice.recoverable {
                            controller.transport_lost();
                            return Ok(Detach::ConnectionLost);
                        }
                    }
                    Err(ControllerError::Protocol(e)) => warn!("Ignoring bad event: {}", e),
                    Err(e) => return Err(e.into()),
                }
            }
            chunk = input.recv() => {
                let Some(chunk) = chunk else {
                    return Ok(Detach::InputClosed);
                };
                let text = decoder.decode(&chunk);
                if text.is_empty() {
                    continue;
                }
                match controller.handle_input(&text).await {
                    Ok(outcome) => debug!(?outcome, bytes = text.len(), "Input handled"),
                    Err(ControllerError::NotReady(state)) => {
                        warn!(%state, "Keystroke typed before the shell was ready");
                        controller.show("\x07")?;
                    }
                    Err(ControllerError::QueueFull(pending)) => {
                        warn!(pending, "Write queue full");
                        controller.show("\x07")?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            () = resized.recv() => {
                if let Some(size) = controller.refit().await? {
                    debug!(%size, "Terminal resized");
                }
            }
        }
    }
}

/// Reads stdin on a dedicated thread; raw-mode reads block until a key arrives.
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Fires when the local terminal changes size.
struct ResizeSignal {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl ResizeSignal {
    #[cfg(unix)]
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            signal: signal(SignalKind::window_change())?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> std::io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) {
        if self.signal.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    // TODO: poll crossterm resize events on Windows.
    #[cfg(not(unix))]
    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}
