//! Server lifecycle wiring the registry, gateway and transport together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gateway::{ConnectionEvent, DisconnectReason, EventGateway};
use crate::session::{PtySessionRegistry, SessionInfo, SessionRegistry};
use crate::terminal::TerminalService;
use crate::transport::WsTransport;

/// Capacity of the server event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not started, or fully stopped.
    Stopped,
    /// Binding the listener and starting tasks.
    Starting,
    /// Accepting connections.
    Running,
    /// Tearing down connections and sessions.
    ShuttingDown,
}

/// Events emitted by the server.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Server state changed.
    StateChanged(ServerState),
    /// The listener is bound.
    Listening(SocketAddr),
    /// A client connected.
    ClientConnected { connection_id: String },
    /// A client went away.
    ClientDisconnected {
        connection_id: String,
        reason: DisconnectReason,
    },
}

/// The terminal bridge server.
pub struct BridgeServer {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<ServerState>>,
    /// Owner of every shell session.
    registry: Arc<PtySessionRegistry>,
    /// Gateway of the current run.
    gateway: Option<Arc<EventGateway>>,
    /// Bound address of the current run.
    local_addr: Option<SocketAddr>,
    /// Accept loop of the current run.
    accept_task: Mutex<Option<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<BridgeEvent>,
}

impl BridgeServer {
    /// Creates a server; nothing is bound until [`BridgeServer::start`].
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(PtySessionRegistry::new(
            config.session.spawn_options(),
            config.session.max_sessions,
        ));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            registry,
            gateway: None,
            local_addr: None,
            accept_task: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
            event_tx,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Returns the address bound by the most recent start.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Subscribes to server events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lists live sessions.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.list().await
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.gateway
            .as_ref()
            .map(|gateway| gateway.connection_count())
            .unwrap_or(0)
    }

    /// Binds the listener and starts accepting connections.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                anyhow::bail!("Server is already running (state: {:?})", *state);
            }
            *state = ServerState::Starting;
        }
        self.emit_event(BridgeEvent::StateChanged(ServerState::Starting));

        match self.start_inner().await {
            Ok(()) => {
                self.set_state(ServerState::Running).await;
                Ok(())
            }
            Err(e) => {
                self.shutdown_token.cancel();
                self.set_state(ServerState::Stopped).await;
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> Result<()> {
        self.config.validate().context("Invalid configuration")?;

        // A previous run leaves a cancelled token behind.
        self.shutdown_token = CancellationToken::new();

        let addr = self.config.listen_addr()?;
        let transport = WsTransport::bind(addr, self.config.transport())
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let local_addr = transport.local_addr();

        let gateway = Arc::new(
            TerminalService::new(Arc::clone(&self.registry), self.config.terminal())
                .register(EventGateway::builder())
                .outbound_capacity(self.config.server.outbound_queue)
                .build(),
        );

        self.forward_connection_events(&gateway);

        if let Some(timeout) = self.config.session.idle_timeout() {
            let interval = (timeout / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
            self.registry
                .start_idle_reaper(interval, timeout, self.shutdown_token.clone());
            info!(timeout_secs = timeout.as_secs(), "Idle session reaper started");
        }

        let task = tokio::spawn(
            transport.serve(Arc::clone(&gateway), self.shutdown_token.clone()),
        );
        *self.accept_task.lock().await = Some(task);

        self.gateway = Some(gateway);
        self.local_addr = Some(local_addr);

        info!(
            addr = %local_addr,
            shell = %self.config.session.default_shell,
            max_sessions = self.config.session.max_sessions,
            "Terminal bridge listening"
        );
        self.emit_event(BridgeEvent::Listening(local_addr));
        Ok(())
    }

    /// Stops accepting connections and tears down every connection and session.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == ServerState::Stopped {
                return Ok(());
            }
            if *state == ServerState::ShuttingDown {
                anyhow::bail!("Server is already shutting down");
            }
            *state = ServerState::ShuttingDown;
        }
        self.emit_event(BridgeEvent::StateChanged(ServerState::ShuttingDown));

        info!("Stopping terminal bridge...");

        // Sessions first, so their owners can still be told why.
        let closed = self.registry.shutdown().await;
        debug!(sessions = closed, "Sessions closed");

        self.shutdown_token.cancel();

        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }

        if let Some(ref gateway) = self.gateway {
            gateway.close_all(DisconnectReason::Shutdown).await;
        }

        self.set_state(ServerState::Stopped).await;
        info!("Terminal bridge stopped");
        Ok(())
    }

    /// Runs until `signal` resolves, then stops.
    pub async fn run_until<F>(&mut self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.stop().await
    }

    fn forward_connection_events(&self, gateway: &EventGateway) {
        let mut events = gateway.subscribe();
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let forwarded = match event {
                    Ok(ConnectionEvent::Opened { connection_id }) => {
                        BridgeEvent::ClientConnected { connection_id }
                    }
                    Ok(ConnectionEvent::Closed {
                        connection_id,
                        reason,
                    }) => BridgeEvent::ClientDisconnected {
                        connection_id,
                        reason,
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Connection event subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let _ = event_tx.send(forwarded);
            }
        });
    }

    async fn set_state(&self, new_state: ServerState) {
        *self.state.write().await = new_state;
        self.emit_event(BridgeEvent::StateChanged(new_state));
    }

    fn emit_event(&self, event: BridgeEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
