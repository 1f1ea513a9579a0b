//! # termbridge Client Library
//!
//! Drives a terminal emulator attached to a shell served by a termbridge
//! bridge.
//!
//! The [`TerminalController`] owns the connection lifecycle
//! (`Disconnected → Connecting → Ready → Closing → Disconnected`): keystrokes
//! become `terminal:write` events once the bridge says `terminal:ready`,
//! `terminal:update` output is written to the [`Emulator`] in arrival order,
//! and grid changes are announced with `terminal:resize`.
//!
//! ## Modules
//!
//! - [`controller`]: The terminal controller and its options
//! - [`state`]: Controller lifecycle states
//! - [`emulator`]: The emulator seam and the local-terminal implementation
//! - [`link`]: WebSocket transport
//! - [`attach`]: Interactive session on the local terminal

pub mod attach;
pub mod controller;
pub mod emulator;
pub mod link;
pub mod state;

pub use attach::{AttachOptions, Detach};
pub use controller::{
    ControllerError, ControllerOptions, InputOutcome, Notice, TerminalController, WritePolicy,
};
pub use emulator::{CrosstermEmulator, Emulator};
pub use link::{LinkError, WsLink};
pub use state::ControllerState;
