//! # termbridge Protocol Library
//!
//! Wire definitions shared by the termbridge server and its clients, plus
//! the [`Utf8Decoder`] both sides use to turn raw terminal bytes into
//! envelope text.
//!
//! ## Overview
//!
//! The bridge relays raw terminal I/O between a shell running on a
//! pseudo-terminal and a terminal emulator on the other side of a persistent
//! WebSocket connection. Every frame is a JSON [`Envelope`] naming one event:
//!
//! | Event | Direction | Payload |
//! |---|---|---|
//! | `terminal:write` | client → server | keystrokes (string) |
//! | `terminal:resize` | client → server | `{cols, rows}` |
//! | `terminal:ready` | server → client | `{connection_id}` |
//! | `terminal:update` | server → client | shell output (string) |
//! | `terminal:error` | server → client | `{code, message, recoverable}` |
//! | `terminal:closed` | server → client | `{reason, exit_code}` |
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientEvent, Envelope, TerminalSize};
//!
//! let frame = ClientEvent::Resize(TerminalSize::new(120, 40))
//!     .into_envelope()
//!     .to_json()
//!     .unwrap();
//!
//! let envelope = Envelope::from_json(&frame).unwrap();
//! assert_eq!(
//!     ClientEvent::from_envelope(&envelope).unwrap(),
//!     ClientEvent::Resize(TerminalSize::new(120, 40))
//! );
//! ```

pub mod error;
pub mod messages;
pub mod utf8;

pub use error::{ProtocolError, Result};
pub use messages::{
    ClientEvent, CloseReason, Envelope, ErrorCode, ErrorNotice, Ready, ServerEvent, SessionClosed,
    TerminalSize, MAX_TERMINAL_DIMENSION, TERMINAL_CLOSED, TERMINAL_ERROR, TERMINAL_READY,
    TERMINAL_RESIZE, TERMINAL_UPDATE, TERMINAL_WRITE,
};
pub use utf8::Utf8Decoder;
