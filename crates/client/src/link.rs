//! WebSocket transport to a bridge.

use futures_util::{SinkExt, StreamExt};
use protocol::{ClientEvent, Envelope};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::connect_async;
use url::Url;

/// Capacity of the link's inbound and outbound channels.
const LINK_CHANNEL_CAPACITY: usize = 256;

/// Errors raised while opening a link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The URL does not parse.
    #[error("invalid bridge URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Only `ws` and `wss` are spoken.
    #[error("unsupported URL scheme '{0}' (expected ws or wss)")]
    UnsupportedScheme(String),

    /// The WebSocket handshake failed.
    #[error("failed to connect: {0}")]
    Connect(#[from] tungstenite::Error),
}

/// An open connection to a bridge.
///
/// Events handed to [`WsLink::sender`] are written as text frames in order.
/// Inbound frames that are not envelopes are skipped. [`WsLink::recv`]
/// returns `None` once the connection is gone.
pub struct WsLink {
    outbound: mpsc::Sender<ClientEvent>,
    inbound: mpsc::Receiver<Envelope>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl WsLink {
    /// Connects to `url`, e.g. `ws://127.0.0.1:9000`.
    pub async fn connect(url: &str) -> Result<Self, LinkError> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(LinkError::UnsupportedScheme(url.scheme().to_string()));
        }

        tracing::info!("Connecting to bridge: {}", url);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<ClientEvent>(LINK_CHANNEL_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel::<Envelope>(LINK_CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                let json = match event.into_envelope().to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to encode event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_sink.send(WsMessage::Text(json)).await {
                    tracing::debug!("Failed to send WebSocket frame: {}", e);
                    return;
                }
            }
            let _ = ws_sink.send(WsMessage::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match Envelope::from_json(&text) {
                        Ok(envelope) => {
                            if inbound_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Skipping malformed frame: {}", e),
                    },
                    Ok(WsMessage::Close(frame)) => {
                        tracing::debug!("Bridge closed the connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound,
            inbound,
            writer,
            reader,
        })
    }

    /// Handle for sending events to the bridge.
    pub fn sender(&self) -> mpsc::Sender<ClientEvent> {
        self.outbound.clone()
    }

    /// Next envelope from the bridge.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// Closes the connection once every queued event is written.
    ///
    /// Other clones of [`WsLink::sender`] must be dropped first.
    pub async fn close(self) {
        let Self {
            outbound,
            inbound,
            writer,
            reader,
        } = self;
        drop(outbound);
        let _ = writer.await;
        drop(inbound);
        reader.abort();
    }
}
