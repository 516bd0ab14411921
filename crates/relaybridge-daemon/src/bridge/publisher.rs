//! Publishing worker responses as signed relay events.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use relaybridge_crypto::{Event, IdentityKeyPair, UnsignedEvent};

use super::payload::{preview, response_content};
use crate::relay::{RelayConnector, RelayError};

/// Characters of response content shown in logs.
const LOG_PREVIEW_CHARS: usize = 100;

/// Delivers a response message to a recipient identity.
#[async_trait]
pub trait ResponsePublisher: Send + Sync + 'static {
    async fn publish(&self, recipient: &str, message: &str) -> Result<(), RelayError>;
}

/// Publisher that signs response events and sends them through the relay.
pub struct RelayPublisher {
    connector: RelayConnector,
    keys: Arc<IdentityKeyPair>,
    kind: u16,
}

impl RelayPublisher {
    pub const fn new(connector: RelayConnector, keys: Arc<IdentityKeyPair>, kind: u16) -> Self {
        Self {
            connector,
            keys,
            kind,
        }
    }

    /// Signed response event addressed to `recipient`.
    pub fn build_event(&self, recipient: &str, message: &str) -> Result<Event, RelayError> {
        let content = response_content(message, Utc::now())
            .map_err(|e| RelayError::Protocol(e.to_string()))?;
        let event = UnsignedEvent::new(self.kind, content)
            .tag(["s", "0"])
            .tag(["p", recipient])
            .sign(&self.keys)?;
        Ok(event)
    }
}

#[async_trait]
impl ResponsePublisher for RelayPublisher {
    async fn publish(&self, recipient: &str, message: &str) -> Result<(), RelayError> {
        let event = self.build_event(recipient, message)?;
        info!(
            event_id = %event.id,
            recipient,
            content = %preview(&event.content, LOG_PREVIEW_CHARS),
            "Publishing response"
        );
        self.connector.publish(event).await
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::relay::{RelaySettings, WebSocketTransport};

    #[tokio::test]
    async fn response_event_is_signed_and_tagged() {
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let connector = RelayConnector::new(
            RelaySettings::new("ws://127.0.0.1:1"),
            Arc::new(WebSocketTransport),
            shutdown_rx,
        );
        let keys = Arc::new(IdentityKeyPair::generate());
        let publisher = RelayPublisher::new(connector, Arc::clone(&keys), 1573);

        let event = publisher.build_event("abc", "hi").unwrap();
        event.verify().unwrap();
        assert_eq!(event.kind, 1573);
        assert_eq!(event.pubkey, keys.public_hex());
        assert_eq!(
            event.tags,
            vec![
                vec!["s".to_string(), "0".to_string()],
                vec!["p".to_string(), "abc".to_string()],
            ]
        );
        let content: serde_json::Value = serde_json::from_str(&event.content).unwrap();
        assert_eq!(content["type"], "mcp-response");
        assert_eq!(content["message"], "hi");
    }
}
