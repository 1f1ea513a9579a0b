//! Event definitions for the terminal bridge.
//!
//! Every WebSocket text frame carries exactly one [`Envelope`]: a JSON object
//! with the event name and its payload.
//!
//! ```text
//! {"event":"terminal:write","data":"ls -la\r"}
//! {"event":"terminal:resize","data":{"cols":120,"rows":40}}
//! ```
//!
//! The typed views ([`ClientEvent`], [`ServerEvent`]) are built on top of the
//! envelope so that the server-side dispatch table can stay keyed by name.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Keystrokes and control sequences for the shell (client → server).
pub const TERMINAL_WRITE: &str = "terminal:write";
/// New terminal geometry (client → server).
pub const TERMINAL_RESIZE: &str = "terminal:resize";
/// Handlers are attached; the client may start writing (server → client).
pub const TERMINAL_READY: &str = "terminal:ready";
/// Shell output (server → client).
pub const TERMINAL_UPDATE: &str = "terminal:update";
/// Session-level error notice (server → client).
pub const TERMINAL_ERROR: &str = "terminal:error";
/// The session ended (server → client).
pub const TERMINAL_CLOSED: &str = "terminal:closed";

/// Largest accepted value for either side of the terminal grid.
pub const MAX_TERMINAL_DIMENSION: u16 = 1000;

/// A named event with an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name, e.g. `terminal:write`.
    pub event: String,
    /// Event payload. Absent payloads decode as `null`.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Creates a new envelope.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Encodes the envelope as a single JSON document.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decodes an envelope from a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns the payload as text, for `terminal:write` and `terminal:update`.
    pub fn text(&self) -> Result<&str> {
        self.data
            .as_str()
            .ok_or_else(|| self.invalid("expected a string payload"))
    }

    /// Decodes a structured payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.data).map_err(|e| self.invalid(e.to_string()))
    }

    fn invalid(&self, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::InvalidPayload {
            event: self.event.clone(),
            reason: reason.into(),
        }
    }
}

/// Terminal grid dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Columns.
    pub cols: u16,
    /// Rows.
    pub rows: u16,
}

impl TerminalSize {
    /// Creates a new size without validating it.
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Checks that both sides are within `1..=MAX_TERMINAL_DIMENSION`.
    pub fn validate(self) -> Result<Self> {
        let valid = |v: u16| (1..=MAX_TERMINAL_DIMENSION).contains(&v);
        if valid(self.cols) && valid(self.rows) {
            Ok(self)
        } else {
            Err(ProtocolError::InvalidSize {
                cols: self.cols,
                rows: self.rows,
                max: MAX_TERMINAL_DIMENSION,
            })
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 30 }
    }
}

impl std::fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Payload of `terminal:ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    /// Server-assigned connection identifier.
    pub connection_id: String,
}

/// Error codes carried by `terminal:error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The shell could not be started.
    SpawnFailed,
    /// The payload did not match the event.
    InvalidPayload,
    /// The server refuses to start more sessions.
    SessionLimit,
    /// There is no live session for this connection.
    NoSession,
    /// Anything else.
    Internal,
}

/// Payload of `terminal:error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Whether retrying the operation can succeed.
    pub recoverable: bool,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The shell exited on its own.
    ProcessExited,
    /// Input could not be delivered; the session was torn down.
    WriteFailed,
    /// The session was idle for too long.
    IdleTimeout,
    /// The server is shutting down.
    Shutdown,
}

/// Payload of `terminal:closed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClosed {
    /// Why the session ended.
    pub reason: CloseReason,
    /// Exit code of the shell, when known.
    pub exit_code: Option<i32>,
}

/// Events sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Raw keystrokes.
    Write(String),
    /// New terminal geometry.
    Resize(TerminalSize),
}

impl ClientEvent {
    /// Returns the wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Write(_) => TERMINAL_WRITE,
            ClientEvent::Resize(_) => TERMINAL_RESIZE,
        }
    }

    /// Wraps the event in an envelope.
    pub fn into_envelope(self) -> Envelope {
        let name = self.name();
        let data = match self {
            ClientEvent::Write(text) => Value::String(text),
            ClientEvent::Resize(size) => to_value(size),
        };
        Envelope::new(name, data)
    }

    /// Parses a client event out of an envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        match envelope.event.as_str() {
            TERMINAL_WRITE => Ok(ClientEvent::Write(envelope.text()?.to_owned())),
            TERMINAL_RESIZE => Ok(ClientEvent::Resize(envelope.decode()?)),
            other => Err(ProtocolError::UnknownEvent(other.to_owned())),
        }
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The connection is ready for writes.
    Ready(Ready),
    /// Shell output.
    Update(String),
    /// Session-level error.
    Error(ErrorNotice),
    /// The session ended.
    Closed(SessionClosed),
}

impl ServerEvent {
    /// Returns the wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Ready(_) => TERMINAL_READY,
            ServerEvent::Update(_) => TERMINAL_UPDATE,
            ServerEvent::Error(_) => TERMINAL_ERROR,
            ServerEvent::Closed(_) => TERMINAL_CLOSED,
        }
    }

    /// Wraps the event in an envelope.
    pub fn into_envelope(self) -> Envelope {
        let name = self.name();
        let data = match self {
            ServerEvent::Ready(ready) => to_value(ready),
            ServerEvent::Update(text) => Value::String(text),
            ServerEvent::Error(notice) => to_value(notice),
            ServerEvent::Closed(closed) => to_value(closed),
        };
        Envelope::new(name, data)
    }

    /// Parses a server event out of an envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        match envelope.event.as_str() {
            TERMINAL_READY => Ok(ServerEvent::Ready(envelope.decode()?)),
            TERMINAL_UPDATE => Ok(ServerEvent::Update(envelope.text()?.to_owned())),
            TERMINAL_ERROR => Ok(ServerEvent::Error(envelope.decode()?)),
            TERMINAL_CLOSED => Ok(ServerEvent::Closed(envelope.decode()?)),
            other => Err(ProtocolError::UnknownEvent(other.to_owned())),
        }
    }

    /// Shorthand for an error notice.
    pub fn error(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        ServerEvent::Error(ErrorNotice {
            code,
            message: message.into(),
            recoverable,
        })
    }
}

// Plain structs with derived Serialize never fail to convert.
fn to_value<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
