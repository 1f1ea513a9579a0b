//! Drives an [`Emulator`] from the events of one bridge connection.

use std::collections::VecDeque;

use protocol::{
    ClientEvent, Envelope, ErrorNotice, ProtocolError, ServerEvent, SessionClosed, TerminalSize,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::emulator::Emulator;
use crate::state::ControllerState;

/// End-of-transmission, swallowed by default so the remote shell survives.
pub const DEFAULT_INTERRUPT: char = '\u{4}';

/// Default bound of the pre-ready write queue.
pub const DEFAULT_QUEUE_LIMIT: usize = 1024;

/// Errors raised by the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A keystroke arrived before `terminal:ready` under the reject policy,
    /// or after the controller started closing.
    #[error("terminal is not ready (state: {0})")]
    NotReady(ControllerState),

    /// The pre-ready queue is full.
    #[error("write queue is full ({0} pending)")]
    QueueFull(usize),

    /// The requested lifecycle step is not allowed from the current state.
    #[error("cannot move from {from} to {to}")]
    InvalidTransition {
        from: ControllerState,
        to: ControllerState,
    },

    /// The outbound side of the transport is gone.
    #[error("transport closed")]
    LinkClosed,

    /// The server sent a malformed event.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The emulator failed.
    #[error("emulator error: {0}")]
    Emulator(#[from] std::io::Error),
}

/// What happens to keystrokes typed before the connection is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Fail with [`ControllerError::NotReady`]; the caller must wait.
    #[default]
    Reject,
    /// Hold them in a bounded queue while connecting and send them once ready.
    QueueUntilReady,
}

/// Controller options.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Pre-ready write handling.
    pub write_policy: WritePolicy,
    /// Bound of the pre-ready queue, in chunks.
    pub queue_limit: usize,
    /// Character never forwarded to the shell.
    pub interrupt: Option<char>,
    /// Send a newline once ready so the shell prints its first prompt.
    pub initial_newline: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            write_policy: WritePolicy::default(),
            queue_limit: DEFAULT_QUEUE_LIMIT,
            interrupt: Some(DEFAULT_INTERRUPT),
            initial_newline: true,
        }
    }
}

/// Session-level news for the caller to present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// `terminal:error`.
    Error(ErrorNotice),
    /// `terminal:closed`. The next keystroke starts a fresh shell.
    Closed(SessionClosed),
}

/// Outcome of [`TerminalController::handle_input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    /// Sent as `terminal:write`.
    Sent,
    /// Held until `terminal:ready`.
    Queued,
    /// Nothing left to send after removing the interrupt character.
    Swallowed,
}

/// Bridges a terminal emulator to a bridge connection.
pub struct TerminalController<E: Emulator> {
    emulator: E,
    options: ControllerOptions,
    state: ControllerState,
    outbound: Option<mpsc::Sender<ClientEvent>>,
    pending: VecDeque<String>,
    connection_id: Option<String>,
    sent_size: Option<TerminalSize>,
}

impl<E: Emulator> TerminalController<E> {
    /// Creates a disconnected controller.
    pub fn new(emulator: E, options: ControllerOptions) -> Self {
        Self {
            emulator,
            options,
            state: ControllerState::Disconnected,
            outbound: None,
            pending: VecDeque::new(),
            connection_id: None,
            sent_size: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Connection id announced by `terminal:ready`.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn emulator(&self) -> &E {
        &self.emulator
    }

    /// Number of queued pre-ready writes.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Attaches to a freshly opened transport.
    ///
    /// Opens the emulator and fits its grid; nothing is sent until the server
    /// says `terminal:ready`.
    pub fn mount(
        &mut self,
        outbound: mpsc::Sender<ClientEvent>,
    ) -> Result<TerminalSize, ControllerError> {
        self.transition(ControllerState::Connecting)?;
        let fitted = self
            .emulator
            .open()
            .and_then(|()| self.emulator.fit());
        let size = match fitted {
            Ok(size) => size,
            Err(e) => {
                self.teardown("emulator failed to open");
                return Err(e.into());
            }
        };
        self.outbound = Some(outbound);
        self.sent_size = None;
        // Keystrokes never carry over into another connection's shell.
        self.pending.clear();
        debug!(size = %size, "Controller mounted");
        Ok(size)
    }

    /// Handles one inbound envelope.
    ///
    /// Unknown events are ignored. Error and close notices are handed back to
    /// the caller; they do not end the connection.
    pub async fn on_server_event(
        &mut self,
        envelope: &Envelope,
    ) -> Result<Option<Notice>, ControllerError> {
        let event = match ServerEvent::from_envelope(envelope) {
            Ok(event) => event,
            Err(ProtocolError::UnknownEvent(name)) => {
                debug!(event = %name, "Ignoring unknown event");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match event {
            ServerEvent::Ready(ready) => {
                if self.state != ControllerState::Connecting {
                    warn!(state = %self.state, "Unexpected terminal:ready");
                    return Ok(None);
                }
                self.transition(ControllerState::Ready)?;
                debug!(connection_id = %ready.connection_id, "Terminal ready");
                self.connection_id = Some(ready.connection_id);
                self.on_ready().await?;
                Ok(None)
            }
            ServerEvent::Update(text) => {
                match self.state {
                    ControllerState::Connecting | ControllerState::Ready => {
                        self.emulator.write(&text)?
                    }
                    state => debug!(state = %state, bytes = text.len(), "Dropping late output"),
                }
                Ok(None)
            }
            ServerEvent::Error(notice) => Ok(Some(Notice::Error(notice))),
            ServerEvent::Closed(closed) => Ok(Some(Notice::Closed(closed))),
        }
    }

    /// Forwards a keystroke chunk.
    pub async fn handle_input(&mut self, input: &str) -> Result<InputOutcome, ControllerError> {
        let text: String = match self.options.interrupt {
            Some(interrupt) => input.chars().filter(|c| *c != interrupt).collect(),
            None => input.to_owned(),
        };
        if text.is_empty() {
            return Ok(InputOutcome::Swallowed);
        }

        match (self.state, self.options.write_policy) {
            (ControllerState::Ready, _) => {
                self.send(ClientEvent::Write(text)).await?;
                Ok(InputOutcome::Sent)
            }
            (ControllerState::Connecting, WritePolicy::QueueUntilReady) => {
                if self.pending.len() >= self.options.queue_limit {
                    return Err(ControllerError::QueueFull(self.pending.len()));
                }
                self.pending.push_back(text);
                Ok(InputOutcome::Queued)
            }
            (state, _) => Err(ControllerError::NotReady(state)),
        }
    }

    /// Renders local text, such as a notice, without involving the shell.
    pub fn show(&mut self, text: &str) -> Result<(), ControllerError> {
        Ok(self.emulator.write(text)?)
    }

    /// Refits the emulator after a layout change.
    ///
    /// Returns the new size if it was sent to the server.
    pub async fn refit(&mut self) -> Result<Option<TerminalSize>, ControllerError> {
        if matches!(
            self.state,
            ControllerState::Disconnected | ControllerState::Closing
        ) {
            return Ok(None);
        }
        let size = self.emulator.fit()?;
        if !self.state.accepts_writes() || self.sent_size == Some(size) {
            return Ok(None);
        }
        self.send(ClientEvent::Resize(size)).await?;
        self.sent_size = Some(size);
        Ok(Some(size))
    }

    /// The transport went away underneath us.
    pub fn transport_lost(&mut self) {
        if self.state != ControllerState::Disconnected {
            self.teardown("transport lost");
        }
    }

    /// Closes the controller and releases the emulator.
    pub fn close(&mut self) {
        if self.state != ControllerState::Disconnected {
            self.teardown("closed");
        }
    }

    async fn on_ready(&mut self) -> Result<(), ControllerError> {
        let size = self.emulator.size();
        self.send(ClientEvent::Resize(size)).await?;
        self.sent_size = Some(size);

        if self.options.initial_newline {
            self.send(ClientEvent::Write("\n".to_string())).await?;
        }

        let queued = self.pending.len();
        while let Some(text) = self.pending.pop_front() {
            self.send(ClientEvent::Write(text)).await?;
        }
        if queued > 0 {
            debug!(queued, "Flushed queued writes");
        }
        Ok(())
    }

    async fn send(&self, event: ClientEvent) -> Result<(), ControllerError> {
        let outbound = self.outbound.as_ref().ok_or(ControllerError::LinkClosed)?;
        outbound
            .send(event)
            .await
            .map_err(|_| ControllerError::LinkClosed)
    }

    fn teardown(&mut self, why: &str) {
        self.state = ControllerState::Closing;
        debug!(reason = why, "Controller closing");

        if let Err(e) = self.emulator.dispose() {
            warn!("Failed to release emulator: {}", e);
        }
        self.outbound = None;
        if !self.pending.is_empty() {
            debug!(discarded = self.pending.len(), "Discarding queued writes");
            self.pending.clear();
        }
        self.connection_id = None;
        self.sent_size = None;
        self.state = ControllerState::Disconnected;
    }

    fn transition(&mut self, next: ControllerState) -> Result<(), ControllerError> {
        if !self.state.can_transition_to(next) {
            return Err(ControllerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(from = %self.state, to = %next, "Controller state changed");
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{CloseReason, ErrorCode, Ready};

    #[derive(Default)]
    struct MockEmulator {
        written: Vec<String>,
        next_size: TerminalSize,
        size: TerminalSize,
        opened: bool,
        disposed: usize,
        fail_open: bool,
    }

    impl Emulator for MockEmulator {
        fn open(&mut self) -> std::io::Result<()> {
            if self.fail_open {
                return Err(std::io::Error::other("no display"));
            }
            self.opened = true;
            Ok(())
        }

        fn write(&mut self, text: &str) -> std::io::Result<()> {
            self.written.push(text.to_string());
            Ok(())
        }

        fn fit(&mut self) -> std::io::Result<TerminalSize> {
            self.size = self.next_size;
            Ok(self.size)
        }

        fn size(&self) -> TerminalSize {
            self.size
        }

        fn dispose(&mut self) -> std::io::Result<()> {
            self.disposed += 1;
            Ok(())
        }
    }

    fn emulator(cols: u16, rows: u16) -> MockEmulator {
        MockEmulator {
            next_size: TerminalSize::new(cols, rows),
            ..Default::default()
        }
    }

    fn ready() -> Envelope {
        ServerEvent::Ready(Ready {
            connection_id: "conn-1".to_string(),
        })
        .into_envelope()
    }

    fn update(text: &str) -> Envelope {
        ServerEvent::Update(text.to_string()).into_envelope()
    }

    fn mounted(
        options: ControllerOptions,
    ) -> (
        TerminalController<MockEmulator>,
        mpsc::Receiver<ClientEvent>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let mut controller = TerminalController::new(emulator(120, 40), options);
        controller.mount(tx).unwrap();
        (controller, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_mount_fits_without_sending() {
        let (controller, mut rx) = mounted(ControllerOptions::default());
        assert_eq!(controller.state(), ControllerState::Connecting);
        assert!(controller.emulator().opened);
        assert_eq!(controller.emulator().size(), TerminalSize::new(120, 40));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_mount_twice_is_rejected() {
        let (mut controller, _rx) = mounted(ControllerOptions::default());
        let (tx, _rx2) = mpsc::channel(1);
        assert!(matches!(
            controller.mount(tx),
            Err(ControllerError::InvalidTransition {
                from: ControllerState::Connecting,
                to: ControllerState::Connecting
            })
        ));
    }

    #[tokio::test]
    async fn test_failed_open_returns_to_disconnected() {
        let (tx, _rx) = mpsc::channel(1);
        let mut controller = TerminalController::new(
            MockEmulator {
                fail_open: true,
                ..Default::default()
            },
            ControllerOptions::default(),
        );
        assert!(matches!(
            controller.mount(tx),
            Err(ControllerError::Emulator(_))
        ));
        assert_eq!(controller.state(), ControllerState::Disconnected);
    }

    #[tokio::test]
    async fn test_ready_sends_geometry_then_newline() {
        let (mut controller, mut rx) = mounted(ControllerOptions::default());
        assert_eq!(controller.on_server_event(&ready()).await.unwrap(), None);

        assert_eq!(controller.state(), ControllerState::Ready);
        assert_eq!(controller.connection_id(), Some("conn-1"));
        assert_eq!(
            drain(&mut rx),
            vec![
                ClientEvent::Resize(TerminalSize::new(120, 40)),
                ClientEvent::Write("\n".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_initial_newline_can_be_disabled() {
        let (mut controller, mut rx) = mounted(ControllerOptions {
            initial_newline: false,
            ..Default::default()
        });
        controller.on_server_event(&ready()).await.unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![ClientEvent::Resize(TerminalSize::new(120, 40))]
        );
    }

    #[tokio::test]
    async fn test_input_rejected_before_ready() {
        let (mut controller, mut rx) = mounted(ControllerOptions::default());
        assert!(matches!(
            controller.handle_input("ls\r").await,
            Err(ControllerError::NotReady(ControllerState::Connecting))
        ));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_input_queued_until_ready() {
        let (mut controller, mut rx) = mounted(ControllerOptions {
            write_policy: WritePolicy::QueueUntilReady,
            initial_newline: false,
            ..Default::default()
        });
        assert_eq!(
            controller.handle_input("echo ").await.unwrap(),
            InputOutcome::Queued
        );
        assert_eq!(
            controller.handle_input("hi\r").await.unwrap(),
            InputOutcome::Queued
        );
        assert_eq!(controller.pending_writes(), 2);
        assert!(drain(&mut rx).is_empty());

        controller.on_server_event(&ready()).await.unwrap();
        assert_eq!(controller.pending_writes(), 0);
        assert_eq!(
            drain(&mut rx),
            vec![
                ClientEvent::Resize(TerminalSize::new(120, 40)),
                ClientEvent::Write("echo ".to_string()),
                ClientEvent::Write("hi\r".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_queue_is_bounded() {
        let (mut controller, _rx) = mounted(ControllerOptions {
            write_policy: WritePolicy::QueueUntilReady,
            queue_limit: 2,
            ..Default::default()
        });
        controller.handle_input("a").await.unwrap();
        controller.handle_input("b").await.unwrap();
        assert!(matches!(
            controller.handle_input("c").await,
            Err(ControllerError::QueueFull(2))
        ));
        assert_eq!(controller.pending_writes(), 2);
    }

    #[tokio::test]
    async fn test_input_forwarded_when_ready() {
        let (mut controller, mut rx) = mounted(ControllerOptions::default());
        controller.on_server_event(&ready()).await.unwrap();
        drain(&mut rx);

        assert_eq!(
            controller.handle_input("\x1b[A").await.unwrap(),
            InputOutcome::Sent
        );
        assert_eq!(
            drain(&mut rx),
            vec![ClientEvent::Write("\x1b[A".to_string())]
        );
    }

    #[tokio::test]
    async fn test_interrupt_is_swallowed() {
        let (mut controller, mut rx) = mounted(ControllerOptions::default());
        controller.on_server_event(&ready()).await.unwrap();
        drain(&mut rx);

        assert_eq!(
            controller.handle_input("\u{4}").await.unwrap(),
            InputOutcome::Swallowed
        );
        assert_eq!(
            controller.handle_input("ab\u{4}c").await.unwrap(),
            InputOutcome::Sent
        );
        assert_eq!(drain(&mut rx), vec![ClientEvent::Write("abc".to_string())]);
    }

    #[tokio::test]
    async fn test_interrupt_can_be_forwarded() {
        let (mut controller, mut rx) = mounted(ControllerOptions {
            interrupt: None,
            ..Default::default()
        });
        controller.on_server_event(&ready()).await.unwrap();
        drain(&mut rx);

        controller.handle_input("\u{4}").await.unwrap();
        assert_eq!(drain(&mut rx), vec![ClientEvent::Write("\u{4}".to_string())]);
    }

    #[tokio::test]
    async fn test_updates_written_in_order() {
        let (mut controller, _rx) = mounted(ControllerOptions::default());
        controller.on_server_event(&ready()).await.unwrap();

        for chunk in ["$ ", "ls\r\n", "\x1b[34msrc\x1b[0m\r\n"] {
            controller.on_server_event(&update(chunk)).await.unwrap();
        }
        assert_eq!(
            controller.emulator().written,
            vec!["$ ", "ls\r\n", "\x1b[34msrc\x1b[0m\r\n"]
        );
    }

    #[tokio::test]
    async fn test_notices_are_returned() {
        let (mut controller, _rx) = mounted(ControllerOptions::default());
        controller.on_server_event(&ready()).await.unwrap();

        let error = ServerEvent::error(ErrorCode::SpawnFailed, "no such shell", true);
        assert!(matches!(
            controller.on_server_event(&error.into_envelope()).await.unwrap(),
            Some(Notice::Error(ErrorNotice {
                code: ErrorCode::SpawnFailed,
                recoverable: true,
                ..
            }))
        ));

        let closed = ServerEvent::Closed(SessionClosed {
            reason: CloseReason::ProcessExited,
            exit_code: Some(0),
        });
        assert!(matches!(
            controller.on_server_event(&closed.into_envelope()).await.unwrap(),
            Some(Notice::Closed(SessionClosed {
                reason: CloseReason::ProcessExited,
                exit_code: Some(0)
            }))
        ));
        // Still ready: the next keystroke starts a new shell.
        assert_eq!(controller.state(), ControllerState::Ready);
    }

    #[tokio::test]
    async fn test_unknown_event_ignored() {
        let (mut controller, _rx) = mounted(ControllerOptions::default());
        let envelope = Envelope::new("chat:message", serde_json::Value::Null);
        assert_eq!(controller.on_server_event(&envelope).await.unwrap(), None);
        assert_eq!(controller.state(), ControllerState::Connecting);
    }

    #[tokio::test]
    async fn test_malformed_update_is_error() {
        let (mut controller, _rx) = mounted(ControllerOptions::default());
        let envelope = Envelope::new(protocol::TERMINAL_UPDATE, serde_json::Value::Null);
        assert!(matches!(
            controller.on_server_event(&envelope).await,
            Err(ControllerError::Protocol(ProtocolError::InvalidPayload { .. }))
        ));
    }

    #[tokio::test]
    async fn test_refit_sends_resize_only_on_change() {
        let (mut controller, mut rx) = mounted(ControllerOptions::default());
        controller.on_server_event(&ready()).await.unwrap();
        drain(&mut rx);

        assert_eq!(controller.refit().await.unwrap(), None);
        assert!(drain(&mut rx).is_empty());

        controller.emulator.next_size = TerminalSize::new(100, 50);
        assert_eq!(
            controller.refit().await.unwrap(),
            Some(TerminalSize::new(100, 50))
        );
        assert_eq!(
            drain(&mut rx),
            vec![ClientEvent::Resize(TerminalSize::new(100, 50))]
        );
    }

    #[tokio::test]
    async fn test_refit_before_ready_only_fits() {
        let (mut controller, mut rx) = mounted(ControllerOptions::default());
        controller.emulator.next_size = TerminalSize::new(90, 20);
        assert_eq!(controller.refit().await.unwrap(), None);
        assert!(drain(&mut rx).is_empty());

        // The fitted size is what gets announced on ready.
        controller.on_server_event(&ready()).await.unwrap();
        assert_eq!(
            drain(&mut rx)[0],
            ClientEvent::Resize(TerminalSize::new(90, 20))
        );
    }

    #[tokio::test]
    async fn test_transport_lost_releases_everything() {
        let (mut controller, _rx) = mounted(ControllerOptions {
            write_policy: WritePolicy::QueueUntilReady,
            ..Default::default()
        });
        controller.handle_input("pending").await.unwrap();

        controller.transport_lost();
        assert_eq!(controller.state(), ControllerState::Disconnected);
        assert_eq!(controller.emulator().disposed, 1);
        assert_eq!(controller.pending_writes(), 0);
        assert!(matches!(
            controller.handle_input("x").await,
            Err(ControllerError::NotReady(ControllerState::Disconnected))
        ));
        assert_eq!(controller.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_starts_with_empty_queue() {
        let (mut controller, _rx) = mounted(ControllerOptions {
            write_policy: WritePolicy::QueueUntilReady,
            ..Default::default()
        });
        controller.handle_input("rm -rf build\r").await.unwrap();
        controller.transport_lost();
        assert!(controller.handle_input("typed while offline").await.is_err());

        let (tx, mut rx) = mpsc::channel(8);
        controller.mount(tx).unwrap();
        assert_eq!(controller.pending_writes(), 0);
        controller.on_server_event(&ready()).await.unwrap();

        let writes: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Write(text) => Some(text),
                _ => None,
            })
            .collect();
        assert!(writes.iter().all(|text| !text.contains("rm -rf") && !text.contains("offline")));
    }

    #[tokio::test]
    async fn test_close_and_remount() {
        let (mut controller, _rx) = mounted(ControllerOptions::default());
        controller.on_server_event(&ready()).await.unwrap();

        controller.close();
        assert_eq!(controller.state(), ControllerState::Disconnected);
        assert_eq!(controller.connection_id(), None);
        assert!(matches!(
            controller.handle_input("ls").await,
            Err(ControllerError::NotReady(ControllerState::Disconnected))
        ));
        controller.close();
        assert_eq!(controller.emulator().disposed, 1);

        let (tx, mut rx) = mpsc::channel(8);
        controller.mount(tx).unwrap();
        controller.on_server_event(&ready()).await.unwrap();
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_send_after_link_dropped() {
        let (mut controller, rx) = mounted(ControllerOptions::default());
        drop(rx);
        assert!(matches!(
            controller.on_server_event(&ready()).await,
            Err(ControllerError::LinkClosed)
        ));
    }
}
