//! Shell sessions.
//!
//! - [`pty`]: one shell on one pseudo-terminal
//! - [`registry`]: which connection owns which shell

pub mod pty;
pub mod registry;

pub use pty::{default_shell, OutputStream, PtyError, PtyProcess, SessionStatus, SpawnOptions};
pub use registry::{
    ConnectionId, PtySessionRegistry, RegistryError, SessionEvent, SessionId, SessionInfo,
    SessionRegistry, SessionSink,
};
pub use protocol::Utf8Decoder;
