//! Relay transport: opens one connection and exposes it as a pair of
//! message channels.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::error::RelayError;
use super::protocol::{ClientMessage, RelayMessage};

/// Channel capacity in each direction of a link.
const LINK_BUFFER: usize = 64;

/// An open relay connection.
///
/// Dropping `outbound` closes the connection; `inbound` yields `None` once
/// the relay side is gone.
#[derive(Debug)]
pub struct RelayLink {
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<RelayMessage>,
}

/// Connection primitive used by the relay connector.
#[async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<RelayLink, RelayError>;
}

/// WebSocket transport speaking JSON text frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl RelayTransport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<RelayLink, RelayError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientMessage>(LINK_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel::<RelayMessage>(LINK_BUFFER);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode relay message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "Relay write failed");
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Error closing relay socket");
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match RelayMessage::parse(&text) {
                        Ok(message) => {
                            if inbound_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(error = %e, "Ignoring relay frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "Relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Relay read failed");
                        break;
                    }
                }
            }
            debug!("Relay reader finished");
        });

        Ok(RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
