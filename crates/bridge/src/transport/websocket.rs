//! WebSocket transport.
//!
//! Each accepted socket becomes one gateway connection. Frames are JSON
//! envelopes in text messages; the reader dispatches them one at a time so a
//! client's keystrokes reach its shell in the order they were typed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::Envelope;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use super::TransportConfig;
use crate::gateway::{ConnectionHandle, DisconnectReason, EventGateway};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Floor for heartbeat timers; tokio intervals cannot be zero.
const MIN_HEARTBEAT: Duration = Duration::from_millis(1);

/// WebSocket listener bound to a local address.
pub struct WsTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: TransportConfig,
}

impl WsTransport {
    /// Binds the listening socket.
    pub async fn bind(addr: impl ToSocketAddrs, config: TransportConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `shutdown` fires, then waits for every
    /// connection to be torn down.
    pub async fn serve(self, gateway: Arc<EventGateway>, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        info!(addr = %self.local_addr, "WebSocket transport listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        tracker.spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&gateway),
                            self.config,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        tracker.close();
        debug!(connections = tracker.len(), "Waiting for connections to close");
        tracker.wait().await;
        info!("WebSocket transport stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    gateway: Arc<EventGateway>,
    config: TransportConfig,
    shutdown: CancellationToken,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (sink, source) = ws.split();

    let (conn, outbound) = gateway.connect();
    debug!(connection_id = %conn.id(), peer = %peer, "WebSocket connection accepted");

    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        conn.closed_token(),
        config.heartbeat_interval.max(MIN_HEARTBEAT),
    ));

    gateway.open(&conn).await;
    let heartbeat_timeout = config.heartbeat_timeout.max(MIN_HEARTBEAT);
    let reason = read_loop(&gateway, &conn, source, heartbeat_timeout, &shutdown).await;
    gateway.disconnect(&conn, reason).await;

    if let Err(e) = writer.await {
        warn!(connection_id = %conn.id(), error = %e, "Writer task failed");
    }
}

/// Reads frames until the peer goes away. Returns why it did.
async fn read_loop(
    gateway: &EventGateway,
    conn: &ConnectionHandle,
    mut source: WsSource,
    heartbeat_timeout: Duration,
    shutdown: &CancellationToken,
) -> DisconnectReason {
    let closed = conn.closed_token();

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return DisconnectReason::Shutdown,
            _ = closed.cancelled() => {
                return DisconnectReason::TransportError("outbound stream failed".to_string())
            }
            next = tokio::time::timeout(heartbeat_timeout, source.next()) => next,
        };

        let message = match next {
            Err(_) => return DisconnectReason::HeartbeatTimeout,
            Ok(None) => return DisconnectReason::ClientClosed,
            Ok(Some(Err(e))) => return DisconnectReason::TransportError(e.to_string()),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            WsMessage::Text(text) => match Envelope::from_json(&text) {
                Ok(envelope) => {
                    gateway.dispatch(conn, envelope).await;
                }
                Err(e) => {
                    warn!(connection_id = %conn.id(), error = %e, "Ignoring malformed frame");
                }
            },
            WsMessage::Binary(data) => {
                warn!(
                    connection_id = %conn.id(),
                    len = data.len(),
                    "Ignoring binary frame"
                );
            }
            WsMessage::Close(_) => return DisconnectReason::ClientClosed,
            // Pings are answered by tungstenite; any frame proves liveness.
            _ => trace!(connection_id = %conn.id(), "Control frame received"),
        }
    }
}

/// Drains the outbound queue into the socket and keeps the peer pinged.
async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Envelope>,
    closed: CancellationToken,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            maybe = outbound.recv() => {
                let Some(envelope) = maybe else { break };
                if let Err(e) = send_envelope(&mut sink, &envelope).await {
                    debug!(error = %e, "Failed to send frame");
                    closed.cancel();
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                    debug!(error = %e, "Failed to send heartbeat ping");
                    closed.cancel();
                    break;
                }
                trace!("Sent heartbeat ping");
            }
            _ = closed.cancelled() => {
                // Flush what was already queued, e.g. a final terminal:closed.
                while let Ok(envelope) = outbound.try_recv() {
                    if send_envelope(&mut sink, &envelope).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    let _ = sink.close().await;
}

async fn send_envelope(
    sink: &mut WsSink,
    envelope: &Envelope,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match envelope.to_json() {
        Ok(json) => sink.send(WsMessage::Text(json)).await,
        Err(e) => {
            warn!(event = %envelope.event, error = %e, "Failed to encode envelope");
            Ok(())
        }
    }
}
