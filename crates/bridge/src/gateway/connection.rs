//! Per-connection state shared between the transport and event handlers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use protocol::{Envelope, ProtocolError, ServerEvent, TerminalSize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::{ConnectionId, SessionId};

/// Cheaply cloneable handle to one client connection.
///
/// Outbound events go through a bounded queue drained by the transport's
/// writer task. [`ConnectionHandle::send`] waits for room instead of dropping,
/// so output reaches the client in the order it was produced.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    outbound: mpsc::Sender<Envelope>,
    connected_at: SystemTime,
    /// Last requested geometry, packed as `cols << 16 | rows`.
    geometry: AtomicU32,
    session: RwLock<Option<SessionId>>,
    closed: CancellationToken,
    disconnected: AtomicBool,
    events_sent: AtomicU64,
}

impl ConnectionHandle {
    /// Creates a handle with an outbound queue of `capacity` envelopes.
    pub(crate) fn new(
        id: ConnectionId,
        capacity: usize,
        size: TerminalSize,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = ConnectionHandle {
            inner: Arc::new(Inner {
                id,
                outbound: tx,
                connected_at: SystemTime::now(),
                geometry: AtomicU32::new(pack(size)),
                session: RwLock::new(None),
                closed: CancellationToken::new(),
                disconnected: AtomicBool::new(false),
                events_sent: AtomicU64::new(0),
            }),
        };
        (handle, rx)
    }

    /// Returns the connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Returns when the connection was accepted.
    pub fn connected_at(&self) -> SystemTime {
        self.inner.connected_at
    }

    /// Returns the geometry most recently requested by the client.
    pub fn requested_size(&self) -> TerminalSize {
        unpack(self.inner.geometry.load(Ordering::Relaxed))
    }

    /// Records the geometry requested by the client.
    pub fn set_requested_size(&self, size: TerminalSize) {
        self.inner.geometry.store(pack(size), Ordering::Relaxed);
    }

    /// Returns the session currently bound to this connection.
    pub fn session(&self) -> Option<SessionId> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn bind_session(&self, session_id: SessionId) {
        *self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(session_id);
    }

    /// Clears the binding only if it still names `session_id`.
    pub(crate) fn unbind_session_if(&self, session_id: &str) -> bool {
        let mut session = self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if session.as_deref() != Some(session_id) {
            return false;
        }
        session.take();
        true
    }

    pub(crate) fn unbind_session(&self) {
        self.inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Number of events queued for the client so far.
    pub fn events_sent(&self) -> u64 {
        self.inner.events_sent.load(Ordering::Relaxed)
    }

    /// Returns whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Token cancelled when the connection is torn down.
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Queues an event for the client, waiting while the queue is full.
    pub async fn send(&self, event: ServerEvent) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let envelope = event.into_envelope();
        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(self.closed_error()),
            result = self.inner.outbound.send(envelope) => {
                result.map_err(|_| self.closed_error())?;
                self.inner.events_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Flags the connection as disconnected. Returns `true` only for the first caller.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.inner.disconnected.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn cancel(&self) {
        self.inner.closed.cancel();
    }

    fn closed_error(&self) -> ProtocolError {
        ProtocolError::ConnectionClosed(self.inner.id.clone())
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("session", &self.session())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn pack(size: TerminalSize) -> u32 {
    (u32::from(size.cols) << 16) | u32::from(size.rows)
}

fn unpack(packed: u32) -> TerminalSize {
    TerminalSize::new((packed >> 16) as u16, (packed & 0xFFFF) as u16)
}
