//! Terminal event handlers.
//!
//! Binds the `terminal:*` events of the gateway to a [`SessionRegistry`]:
//!
//! - `terminal:write` starts the connection's shell on first use, then feeds it
//! - `terminal:resize` records the geometry and resizes a live shell
//! - on connect the client is told `terminal:ready`
//! - on disconnect the shell is destroyed

use std::sync::Arc;

use futures_util::future::BoxFuture;
use protocol::{
    CloseReason, Envelope, ErrorCode, Ready, ServerEvent, SessionClosed, TerminalSize,
    TERMINAL_RESIZE, TERMINAL_WRITE,
};
use tracing::{debug, info, warn};

use crate::gateway::{ConnectionHandle, EventGatewayBuilder, HandlerError};
use crate::session::{PtyError, RegistryError, SessionEvent, SessionRegistry, SessionSink};

/// Per-connection terminal defaults.
#[derive(Debug, Clone, Copy)]
pub struct TerminalSettings {
    /// Geometry used until the client sends `terminal:resize`.
    pub default_size: TerminalSize,
    /// Start the shell as soon as the client connects.
    pub eager_spawn: bool,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            default_size: TerminalSize::default(),
            eager_spawn: false,
        }
    }
}

impl From<RegistryError> for HandlerError {
    fn from(err: RegistryError) -> Self {
        let code = match &err {
            RegistryError::NotFound(_) => ErrorCode::NoSession,
            RegistryError::LimitReached(_) => ErrorCode::SessionLimit,
            RegistryError::Pty(PtyError::Spawn(_)) => ErrorCode::SpawnFailed,
            RegistryError::Pty(_) => ErrorCode::Internal,
        };
        HandlerError::new(code, err.to_string(), true)
    }
}

/// Session output is delivered straight into the owning connection's queue.
impl SessionSink for ConnectionHandle {
    fn deliver(&self, event: SessionEvent) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let event = match event {
                SessionEvent::Output(text) => ServerEvent::Update(text),
                SessionEvent::Ended {
                    session_id,
                    reason,
                    exit_code,
                } => {
                    // A replacement shell may already be bound.
                    self.unbind_session_if(&session_id);
                    ServerEvent::Closed(SessionClosed { reason, exit_code })
                }
            };
            self.send(event).await.is_ok()
        })
    }
}

/// Handlers for the `terminal:*` events.
pub struct TerminalService<R> {
    registry: Arc<R>,
    settings: TerminalSettings,
}

impl<R: SessionRegistry> TerminalService<R> {
    /// Creates the service.
    pub fn new(registry: Arc<R>, settings: TerminalSettings) -> Self {
        Self { registry, settings }
    }

    /// Registers the terminal handlers and hooks on `builder`.
    pub fn register(self, builder: EventGatewayBuilder) -> EventGatewayBuilder {
        let service = Arc::new(self);

        let on_write = Arc::clone(&service);
        let on_resize = Arc::clone(&service);
        let on_connect = Arc::clone(&service);
        let on_disconnect = service;

        builder
            .on(TERMINAL_WRITE, move |conn: ConnectionHandle, envelope: Envelope| {
                let service = Arc::clone(&on_write);
                async move { service.handle_write(&conn, &envelope).await }
            })
            .on(TERMINAL_RESIZE, move |conn: ConnectionHandle, envelope: Envelope| {
                let service = Arc::clone(&on_resize);
                async move { service.handle_resize(&conn, &envelope).await }
            })
            .on_connect(move |conn: ConnectionHandle| {
                let service = Arc::clone(&on_connect);
                async move { service.connected(&conn).await }
            })
            .on_disconnect(move |conn: ConnectionHandle| {
                let service = Arc::clone(&on_disconnect);
                async move { service.disconnected(&conn).await }
            })
    }

    async fn handle_write(
        &self,
        conn: &ConnectionHandle,
        envelope: &Envelope,
    ) -> Result<(), HandlerError> {
        let data = envelope.text()?;
        self.ensure_session(conn).await?;

        match self.registry.write(conn.id(), data.as_bytes()).await {
            Ok(()) => Ok(()),
            // The shell exited under us; its pump reports terminal:closed.
            Err(RegistryError::NotFound(_)) | Err(RegistryError::Pty(PtyError::Exited)) => Err(
                HandlerError::new(ErrorCode::NoSession, "shell has exited", true),
            ),
            Err(e) => {
                warn!(connection_id = %conn.id(), error = %e, "Write to shell failed");
                let exit_code = self.registry.destroy(conn.id()).await.map(|s| s.code());
                conn.unbind_session();
                conn.send(ServerEvent::Closed(SessionClosed {
                    reason: CloseReason::WriteFailed,
                    exit_code,
                }))
                .await?;
                Ok(())
            }
        }
    }

    async fn handle_resize(
        &self,
        conn: &ConnectionHandle,
        envelope: &Envelope,
    ) -> Result<(), HandlerError> {
        let size: TerminalSize = envelope.decode()?;
        let size = size.validate()?;
        conn.set_requested_size(size);

        if !self.registry.contains(conn.id()) {
            debug!(connection_id = %conn.id(), size = %size, "Stored geometry for next session");
            return Ok(());
        }

        match self.registry.resize(conn.id(), size).await {
            Ok(()) => Ok(()),
            Err(RegistryError::NotFound(_)) | Err(RegistryError::Pty(PtyError::Exited)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn connected(&self, conn: &ConnectionHandle) {
        conn.set_requested_size(self.settings.default_size);

        let ready = ServerEvent::Ready(Ready {
            connection_id: conn.id().clone(),
        });
        if conn.send(ready).await.is_err() {
            return;
        }

        if self.settings.eager_spawn {
            if let Err(err) = self.ensure_session(conn).await {
                let notice = ServerEvent::error(err.code, err.message, err.recoverable);
                let _ = conn.send(notice).await;
            }
        }
    }

    async fn disconnected(&self, conn: &ConnectionHandle) {
        if let Some(status) = self.registry.destroy(conn.id()).await {
            debug!(
                connection_id = %conn.id(),
                exit_code = status.code(),
                "Destroyed session of departed connection"
            );
        }
        conn.unbind_session();
    }

    /// Spawns the connection's shell if it has none.
    async fn ensure_session(&self, conn: &ConnectionHandle) -> Result<(), HandlerError> {
        if self.registry.contains(conn.id()) {
            return Ok(());
        }

        let sink: Arc<dyn SessionSink> = Arc::new(conn.clone());
        let info = self
            .registry
            .get_or_create(conn.id(), conn.requested_size(), sink)
            .await?;

        // A teardown may have raced with the spawn; never leave an orphan behind.
        if conn.is_closed() {
            self.registry.destroy(conn.id()).await;
            return Err(HandlerError::new(
                ErrorCode::Internal,
                "connection closed",
                false,
            ));
        }

        if conn.session().as_deref() != Some(info.id.as_str()) {
            info!(
                connection_id = %conn.id(),
                session_id = %info.id,
                pid = ?info.pid,
                "Bound new session"
            );
            conn.bind_session(info.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Dispatch, DisconnectReason, EventGateway};
    use crate::session::{ConnectionId, SessionInfo, SessionStatus};
    use protocol::ClientEvent;
    use std::future::Future;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};
    use tokio::sync::mpsc;

    /// In-memory registry recording every call.
    #[derive(Default)]
    struct MockRegistry {
        sessions: Mutex<Vec<(ConnectionId, TerminalSize)>>,
        writes: Mutex<Vec<(ConnectionId, String)>>,
        destroyed: Mutex<Vec<ConnectionId>>,
        fail_spawn: bool,
        fail_write: bool,
    }

    impl MockRegistry {
        fn size_of(&self, id: &ConnectionId) -> Option<TerminalSize> {
            self.sessions
                .lock()
                .unwrap()
                .iter()
                .find(|(c, _)| c == id)
                .map(|(_, s)| *s)
        }
    }

    impl SessionRegistry for MockRegistry {
        fn get_or_create(
            &self,
            connection_id: &ConnectionId,
            size: TerminalSize,
            _sink: Arc<dyn SessionSink>,
        ) -> impl Future<Output = Result<SessionInfo, RegistryError>> + Send {
            let result = if self.fail_spawn {
                Err(RegistryError::Pty(PtyError::Spawn("no such shell".into())))
            } else {
                let mut sessions = self.sessions.lock().unwrap();
                if !sessions.iter().any(|(c, _)| c == connection_id) {
                    sessions.push((connection_id.clone(), size));
                }
                Ok(SessionInfo {
                    id: format!("session-{}", connection_id),
                    connection_id: connection_id.clone(),
                    pid: Some(1),
                    size,
                    running: true,
                    shell: "/bin/sh".into(),
                    created_at: SystemTime::now(),
                    idle: Duration::ZERO,
                })
            };
            async move { result }
        }

        fn write(
            &self,
            connection_id: &ConnectionId,
            data: &[u8],
        ) -> impl Future<Output = Result<(), RegistryError>> + Send {
            let result = if self.fail_write {
                Err(RegistryError::Pty(PtyError::Write("broken pipe".into())))
            } else {
                self.writes.lock().unwrap().push((
                    connection_id.clone(),
                    String::from_utf8_lossy(data).into_owned(),
                ));
                Ok(())
            };
            async move { result }
        }

        fn resize(
            &self,
            connection_id: &ConnectionId,
            size: TerminalSize,
        ) -> impl Future<Output = Result<(), RegistryError>> + Send {
            let mut sessions = self.sessions.lock().unwrap();
            let result = match sessions.iter_mut().find(|(c, _)| c == connection_id) {
                Some(entry) => {
                    entry.1 = size;
                    Ok(())
                }
                None => Err(RegistryError::NotFound(connection_id.clone())),
            };
            async move { result }
        }

        fn destroy(
            &self,
            connection_id: &ConnectionId,
        ) -> impl Future<Output = Option<SessionStatus>> + Send {
            let mut sessions = self.sessions.lock().unwrap();
            let before = sessions.len();
            sessions.retain(|(c, _)| c != connection_id);
            let removed = sessions.len() != before;
            self.destroyed.lock().unwrap().push(connection_id.clone());
            async move { removed.then_some(SessionStatus::Exited(0)) }
        }

        fn get(
            &self,
            _connection_id: &ConnectionId,
        ) -> impl Future<Output = Option<SessionInfo>> + Send {
            async { None }
        }

        fn contains(&self, connection_id: &ConnectionId) -> bool {
            self.size_of(connection_id).is_some()
        }

        fn count(&self) -> usize {
            self.sessions.lock().unwrap().len()
        }
    }

    fn gateway(registry: Arc<MockRegistry>, settings: TerminalSettings) -> EventGateway {
        TerminalService::new(registry, settings)
            .register(EventGateway::builder())
            .build()
    }

    async fn next_event(rx: &mut mpsc::Receiver<protocol::Envelope>) -> ServerEvent {
        let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        ServerEvent::from_envelope(&envelope).unwrap()
    }

    #[tokio::test]
    async fn test_connect_sends_ready() {
        let registry = Arc::new(MockRegistry::default());
        let gateway = gateway(Arc::clone(&registry), TerminalSettings::default());

        let (conn, mut rx) = gateway.connect();
        gateway.open(&conn).await;

        match next_event(&mut rx).await {
            ServerEvent::Ready(ready) => assert_eq!(&ready.connection_id, conn.id()),
            other => panic!("expected ready, got {:?}", other),
        }
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_eager_spawn_uses_default_size() {
        let registry = Arc::new(MockRegistry::default());
        let settings = TerminalSettings {
            default_size: TerminalSize::new(80, 30),
            eager_spawn: true,
        };
        let gateway = gateway(Arc::clone(&registry), settings);

        let (conn, _rx) = gateway.connect();
        gateway.open(&conn).await;

        assert_eq!(registry.size_of(conn.id()), Some(TerminalSize::new(80, 30)));
        assert_eq!(conn.session(), Some(format!("session-{}", conn.id())));
    }

    #[tokio::test]
    async fn test_first_write_spawns_with_requested_size() {
        let registry = Arc::new(MockRegistry::default());
        let gateway = gateway(Arc::clone(&registry), TerminalSettings::default());
        let (conn, _rx) = gateway.connect();

        let resize = ClientEvent::Resize(TerminalSize::new(120, 40)).into_envelope();
        assert_eq!(gateway.dispatch(&conn, resize).await, Dispatch::Handled);
        assert_eq!(registry.count(), 0);

        let write = ClientEvent::Write("ls\r".into()).into_envelope();
        assert_eq!(gateway.dispatch(&conn, write).await, Dispatch::Handled);

        assert_eq!(registry.size_of(conn.id()), Some(TerminalSize::new(120, 40)));
        assert_eq!(
            *registry.writes.lock().unwrap(),
            vec![(conn.id().clone(), "ls\r".to_string())]
        );
    }

    #[tokio::test]
    async fn test_resize_reaches_live_session() {
        let registry = Arc::new(MockRegistry::default());
        let gateway = gateway(Arc::clone(&registry), TerminalSettings::default());
        let (conn, _rx) = gateway.connect();

        gateway
            .dispatch(&conn, ClientEvent::Write("\n".into()).into_envelope())
            .await;
        gateway
            .dispatch(&conn, ClientEvent::Resize(TerminalSize::new(100, 50)).into_envelope())
            .await;

        assert_eq!(registry.size_of(conn.id()), Some(TerminalSize::new(100, 50)));
        assert_eq!(conn.requested_size(), TerminalSize::new(100, 50));
    }

    #[tokio::test]
    async fn test_invalid_resize_is_rejected() {
        let registry = Arc::new(MockRegistry::default());
        let gateway = gateway(Arc::clone(&registry), TerminalSettings::default());
        let (conn, mut rx) = gateway.connect();

        let oversized = ClientEvent::Resize(TerminalSize::new(5000, 10)).into_envelope();
        assert_eq!(
            gateway.dispatch(&conn, oversized).await,
            Dispatch::Rejected(ErrorCode::InvalidPayload)
        );
        assert!(matches!(next_event(&mut rx).await, ServerEvent::Error(_)));
        assert_eq!(conn.requested_size(), TerminalSize::default());
    }

    #[tokio::test]
    async fn test_write_with_non_string_payload() {
        let registry = Arc::new(MockRegistry::default());
        let gateway = gateway(Arc::clone(&registry), TerminalSettings::default());
        let (conn, _rx) = gateway.connect();

        let envelope = Envelope::new(TERMINAL_WRITE, serde_json::json!({"keys": "ls"}));
        assert_eq!(
            gateway.dispatch(&conn, envelope).await,
            Dispatch::Rejected(ErrorCode::InvalidPayload)
        );
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_recoverable_notice() {
        let registry = Arc::new(MockRegistry {
            fail_spawn: true,
            ..Default::default()
        });
        let gateway = gateway(Arc::clone(&registry), TerminalSettings::default());
        let (conn, mut rx) = gateway.connect();

        let write = ClientEvent::Write("ls\r".into()).into_envelope();
        assert_eq!(
            gateway.dispatch(&conn, write).await,
            Dispatch::Rejected(ErrorCode::SpawnFailed)
        );

        match next_event(&mut rx).await {
            ServerEvent::Error(notice) => {
                assert_eq!(notice.code, ErrorCode::SpawnFailed);
                assert!(notice.recoverable);
            }
            other => panic!("expected error notice, got {:?}", other),
        }
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_write_failure_closes_session() {
        let registry = Arc::new(MockRegistry {
            fail_write: true,
            ..Default::default()
        });
        let gateway = gateway(Arc::clone(&registry), TerminalSettings::default());
        let (conn, mut rx) = gateway.connect();

        let write = ClientEvent::Write("ls\r".into()).into_envelope();
        assert_eq!(gateway.dispatch(&conn, write).await, Dispatch::Handled);

        assert_eq!(
            next_event(&mut rx).await,
            ServerEvent::Closed(SessionClosed {
                reason: CloseReason::WriteFailed,
                exit_code: Some(0),
            })
        );
        assert_eq!(registry.count(), 0);
        assert_eq!(conn.session(), None);
    }

    #[tokio::test]
    async fn test_disconnect_destroys_session() {
        let registry = Arc::new(MockRegistry::default());
        let gateway = gateway(Arc::clone(&registry), TerminalSettings::default());
        let (conn, _rx) = gateway.connect();

        gateway
            .dispatch(&conn, ClientEvent::Write("\n".into()).into_envelope())
            .await;
        assert_eq!(registry.count(), 1);

        gateway.disconnect(&conn, DisconnectReason::ClientClosed).await;
        gateway.disconnect(&conn, DisconnectReason::ClientClosed).await;

        assert_eq!(registry.count(), 0);
        assert_eq!(*registry.destroyed.lock().unwrap(), vec![conn.id().clone()]);
    }

    #[tokio::test]
    async fn test_session_events_reach_connection() {
        let (conn, mut rx) = EventGateway::builder().build().connect();

        assert!(conn.deliver(SessionEvent::Output("$ ".into())).await);
        assert!(
            conn.deliver(SessionEvent::Ended {
                session_id: "s-1".into(),
                reason: CloseReason::ProcessExited,
                exit_code: Some(0),
            })
            .await
        );

        assert_eq!(next_event(&mut rx).await, ServerEvent::Update("$ ".into()));
        assert_eq!(
            next_event(&mut rx).await,
            ServerEvent::Closed(SessionClosed {
                reason: CloseReason::ProcessExited,
                exit_code: Some(0),
            })
        );
    }

    #[tokio::test]
    async fn test_late_end_keeps_replacement_binding() {
        let (conn, mut rx) = EventGateway::builder().build().connect();
        conn.bind_session("s-2".into());

        assert!(
            conn.deliver(SessionEvent::Ended {
                session_id: "s-1".into(),
                reason: CloseReason::ProcessExited,
                exit_code: Some(0),
            })
            .await
        );

        assert!(matches!(next_event(&mut rx).await, ServerEvent::Closed(_)));
        assert_eq!(conn.session().as_deref(), Some("s-2"));
    }
}
