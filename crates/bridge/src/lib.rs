//! # termbridge Server Library
//!
//! Relays interactive shells running on pseudo-terminals to remote terminal
//! emulators over WebSocket.
//!
//! ## Overview
//!
//! Every client connection owns at most one shell. Keystrokes arrive as
//! `terminal:write` events and are written to that shell; whatever the shell
//! prints goes back as `terminal:update` events, to that connection only and
//! in the order it was produced. When the connection goes away, so does the
//! shell.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       BridgeServer                        │
//! ├───────────────────────────────────────────────────────────┤
//! │  WsTransport ──frames──▶ EventGateway ──▶ TerminalService │
//! │       ▲                       │                  │        │
//! │       └──── outbound queue ◀──┘                  ▼        │
//! │                                     PtySessionRegistry    │
//! │                                       └─ PtyProcess ×N    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bridge::{BridgeServer, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut server = BridgeServer::new(config);
//!     server.start().await?;
//!     println!("listening on {:?}", server.local_addr());
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY processes and the connection → session registry
//! - [`gateway`]: Transport-agnostic event dispatch
//! - [`transport`]: WebSocket listener
//! - [`terminal`]: `terminal:*` event handlers
//! - [`server`]: Lifecycle of the whole bridge

pub mod config;
pub mod gateway;
pub mod server;
pub mod session;
pub mod terminal;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use gateway::{ConnectionHandle, Dispatch, EventGateway, HandlerError};
pub use server::{BridgeEvent, BridgeServer, ServerState};
pub use session::{
    PtyProcess, PtySessionRegistry, RegistryError, SessionInfo, SessionRegistry, SpawnOptions,
};
pub use terminal::{TerminalService, TerminalSettings};
pub use transport::{TransportConfig, WsTransport};
