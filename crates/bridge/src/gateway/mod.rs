//! Event gateway dispatching named protocol events to handlers.
//!
//! The gateway knows nothing about sockets. A transport calls
//! [`EventGateway::connect`] when a peer arrives, [`EventGateway::dispatch`]
//! for every decoded frame and [`EventGateway::disconnect`] when the peer goes
//! away, however that happens.

mod connection;

pub use connection::ConnectionHandle;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use protocol::{Envelope, ErrorCode, ProtocolError, ServerEvent, TerminalSize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::ConnectionId;

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Error returned by an event handler.
///
/// The gateway turns it into a `terminal:error` notice on the connection that
/// sent the event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Code reported to the client.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Whether retrying can succeed.
    pub recoverable: bool,
}

impl HandlerError {
    /// Creates a handler error.
    pub fn new(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable,
        }
    }

    /// The payload did not fit the event.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidPayload, message, true)
    }

    /// Unexpected failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message, true)
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ConnectionClosed(_) => {
                Self::new(ErrorCode::Internal, err.to_string(), false)
            }
            _ => Self::invalid_payload(err.to_string()),
        }
    }
}

/// Handles one named event.
///
/// Implemented for any `Fn(ConnectionHandle, Envelope) -> impl Future` closure.
pub trait EventHandler: Send + Sync + 'static {
    /// Handles an envelope received on `conn`.
    fn handle(
        &self,
        conn: ConnectionHandle,
        envelope: Envelope,
    ) -> BoxFuture<'static, Result<(), HandlerError>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(ConnectionHandle, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        conn: ConnectionHandle,
        envelope: Envelope,
    ) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(self(conn, envelope))
    }
}

/// Runs when a connection opens or closes.
pub trait ConnectionHook: Send + Sync + 'static {
    /// Called with the affected connection.
    fn call(&self, conn: ConnectionHandle) -> BoxFuture<'static, ()>;
}

impl<F, Fut> ConnectionHook for F
where
    F: Fn(ConnectionHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, conn: ConnectionHandle) -> BoxFuture<'static, ()> {
        Box::pin(self(conn))
    }
}

/// Outcome of dispatching one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler ran and succeeded.
    Handled,
    /// No handler is registered for the event.
    Ignored,
    /// The handler failed; the client was sent a notice with this code.
    Rejected(ErrorCode),
}

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the socket.
    ClientClosed,
    /// Nothing was received within the heartbeat timeout.
    HeartbeatTimeout,
    /// The transport failed.
    TransportError(String),
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientClosed => write!(f, "client closed"),
            DisconnectReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {}", e),
            DisconnectReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection was accepted.
    Opened { connection_id: ConnectionId },
    /// A connection was torn down.
    Closed {
        connection_id: ConnectionId,
        reason: DisconnectReason,
    },
}

/// Builder for [`EventGateway`].
pub struct EventGatewayBuilder {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    connect_hooks: Vec<Arc<dyn ConnectionHook>>,
    disconnect_hooks: Vec<Arc<dyn ConnectionHook>>,
    outbound_capacity: usize,
}

impl EventGatewayBuilder {
    /// Registers the handler for `event`, replacing any previous one.
    pub fn on(mut self, event: impl Into<String>, handler: impl EventHandler) -> Self {
        let event = event.into();
        if self.handlers.insert(event.clone(), Arc::new(handler)).is_some() {
            warn!(event = %event, "Replacing existing event handler");
        }
        self
    }

    /// Adds a hook run when a connection opens.
    pub fn on_connect(mut self, hook: impl ConnectionHook) -> Self {
        self.connect_hooks.push(Arc::new(hook));
        self
    }

    /// Adds a hook run exactly once when a connection closes.
    pub fn on_disconnect(mut self, hook: impl ConnectionHook) -> Self {
        self.disconnect_hooks.push(Arc::new(hook));
        self
    }

    /// Sets the outbound queue capacity of each connection.
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Freezes the dispatch table.
    pub fn build(self) -> EventGateway {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventGateway {
            handlers: self.handlers,
            connect_hooks: self.connect_hooks,
            disconnect_hooks: self.disconnect_hooks,
            outbound_capacity: self.outbound_capacity,
            connections: DashMap::new(),
            event_tx,
        }
    }
}

/// Routes events from connections to the handlers registered for them.
pub struct EventGateway {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    connect_hooks: Vec<Arc<dyn ConnectionHook>>,
    disconnect_hooks: Vec<Arc<dyn ConnectionHook>>,
    outbound_capacity: usize,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl EventGateway {
    /// Starts building a gateway.
    pub fn builder() -> EventGatewayBuilder {
        EventGatewayBuilder {
            handlers: HashMap::new(),
            connect_hooks: Vec::new(),
            disconnect_hooks: Vec::new(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }

    /// Registers a new connection.
    ///
    /// Returns its handle and the receiving end of its outbound queue, which
    /// the transport must drain.
    pub fn connect(&self) -> (ConnectionHandle, mpsc::Receiver<Envelope>) {
        let id = Uuid::new_v4().to_string();
        let (conn, rx) =
            ConnectionHandle::new(id.clone(), self.outbound_capacity, TerminalSize::default());
        self.connections.insert(id.clone(), conn.clone());

        info!(connection_id = %id, "Connection opened");
        let _ = self.event_tx.send(ConnectionEvent::Opened { connection_id: id });
        (conn, rx)
    }

    /// Runs the connect hooks. Call once the outbound queue is being drained.
    pub async fn open(&self, conn: &ConnectionHandle) {
        for hook in &self.connect_hooks {
            hook.call(conn.clone()).await;
        }
    }

    /// Hands an envelope to the handler registered for its event.
    pub async fn dispatch(&self, conn: &ConnectionHandle, envelope: Envelope) -> Dispatch {
        let Some(handler) = self.handlers.get(envelope.event.as_str()) else {
            debug!(
                connection_id = %conn.id(),
                event = %envelope.event,
                "Ignoring unknown event"
            );
            return Dispatch::Ignored;
        };

        let event = envelope.event.clone();
        match handler.handle(conn.clone(), envelope).await {
            Ok(()) => Dispatch::Handled,
            Err(err) => {
                warn!(
                    connection_id = %conn.id(),
                    event = %event,
                    code = ?err.code,
                    error = %err,
                    "Event handler failed"
                );
                let notice = ServerEvent::error(err.code, err.message, err.recoverable);
                if let Err(e) = conn.send(notice).await {
                    debug!(connection_id = %conn.id(), error = %e, "Could not deliver error notice");
                }
                Dispatch::Rejected(err.code)
            }
        }
    }

    /// Tears a connection down and runs the disconnect hooks.
    ///
    /// Safe to call any number of times; only the first call has an effect.
    /// Returns whether this call performed the teardown.
    pub async fn disconnect(&self, conn: &ConnectionHandle, reason: DisconnectReason) -> bool {
        if !conn.mark_disconnected() {
            return false;
        }

        // Unblock anything waiting on a full outbound queue first.
        conn.cancel();
        self.connections.remove(conn.id());

        for hook in &self.disconnect_hooks {
            hook.call(conn.clone()).await;
        }

        info!(
            connection_id = %conn.id(),
            reason = %reason,
            events_sent = conn.events_sent(),
            "Connection closed"
        );
        let _ = self.event_tx.send(ConnectionEvent::Closed {
            connection_id: conn.id().clone(),
            reason,
        });
        true
    }

    /// Disconnects every open connection.
    pub async fn close_all(&self, reason: DisconnectReason) -> usize {
        let conns: Vec<ConnectionHandle> =
            self.connections.iter().map(|e| e.value().clone()).collect();

        let mut closed = 0;
        for conn in conns {
            if self.disconnect(&conn, reason.clone()).await {
                closed += 1;
            }
        }
        closed
    }

    /// Looks up an open connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|e| e.value().clone())
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Returns whether a handler is registered for `event`.
    pub fn handles(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }
}
