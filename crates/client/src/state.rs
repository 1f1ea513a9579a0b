//! Connection state of a terminal controller.

/// Lifecycle of a [`TerminalController`](crate::TerminalController).
///
/// ```text
/// Disconnected ──mount──▶ Connecting ──ready──▶ Ready
///      ▲                      │                   │
///      │                      └──close/lost──┐    │ close/lost
///      │                                     ▼    ▼
///      └──────────cleanup done──────────── Closing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    /// No transport.
    #[default]
    Disconnected,
    /// Transport open, waiting for `terminal:ready`.
    Connecting,
    /// Writes are permitted.
    Ready,
    /// Releasing the emulator and the transport.
    Closing,
}

impl ControllerState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ControllerState) -> bool {
        use ControllerState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Ready)
                | (Connecting, Closing)
                | (Ready, Closing)
                | (Closing, Disconnected)
        )
    }

    /// Only a ready controller sends keystrokes.
    pub fn accepts_writes(self) -> bool {
        self == ControllerState::Ready
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControllerState::Disconnected => "disconnected",
            ControllerState::Connecting => "connecting",
            ControllerState::Ready => "ready",
            ControllerState::Closing => "closing",
        };
        f.write_str(name)
    }
}
