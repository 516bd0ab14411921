//! Relay connector with fixed-delay reconnection.
//!
//! Keeps one relay connection and one subscription alive. Every new
//! connection re-sends the subscription. A failed attempt or a dropped
//! connection schedules another attempt after the reconnect delay, forever,
//! until shutdown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use relaybridge_crypto::Event;

use super::config::RelaySettings;
use super::error::RelayError;
use super::protocol::{ClientMessage, Filter, RelayMessage};
use super::transport::{RelayLink, RelayTransport};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A verified event addressed to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Hex public key of the author; responses go back here.
    pub sender: String,
    /// Raw event content.
    pub payload: String,
    pub event_id: String,
    pub received_at: DateTime<Utc>,
}

/// Relay verdict on a published event: `Err` carries the rejection reason.
type Ack = Result<(), String>;

struct Subscription {
    id: String,
    filter: Filter,
    events: mpsc::Sender<InboundMessage>,
}

struct Link {
    generation: u64,
    outbound: mpsc::Sender<ClientMessage>,
}

/// Bounded memory of recently delivered event ids. Relays replay stored
/// events on every resubscription.
struct SeenEvents {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenEvents {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    /// Remember `id`; false if it was already known.
    fn insert(&mut self, id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

struct Inner {
    settings: RelaySettings,
    transport: Arc<dyn RelayTransport>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    /// Held for the duration of a connection attempt.
    connect_lock: Mutex<()>,
    subscription: Mutex<Option<Subscription>>,
    pending_acks: Mutex<HashMap<String, oneshot::Sender<Ack>>>,
    seen: Mutex<SeenEvents>,
    generation: AtomicU64,
    retry_pending: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

/// Handle to the relay connection. Cheap to clone.
#[derive(Clone)]
pub struct RelayConnector {
    inner: Arc<Inner>,
}

impl RelayConnector {
    pub fn new(
        settings: RelaySettings,
        transport: Arc<dyn RelayTransport>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let seen = SeenEvents::new(settings.seen_capacity);
        Self {
            inner: Arc::new(Inner {
                settings,
                transport,
                state,
                link: Mutex::new(None),
                connect_lock: Mutex::new(()),
                subscription: Mutex::new(None),
                pending_acks: Mutex::new(HashMap::new()),
                seen: Mutex::new(seen),
                generation: AtomicU64::new(0),
                retry_pending: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Replace any existing connection with a new one.
    ///
    /// On failure a retry is scheduled after the reconnect delay and the
    /// error is returned.
    pub async fn connect(&self) -> Result<(), RelayError> {
        let _attempt = self.inner.connect_lock.lock().await;
        self.connect_locked().await
    }

    /// Connect unless already connected.
    pub async fn ensure_connected(&self) -> Result<(), RelayError> {
        let _attempt = self.inner.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.connect_locked().await
    }

    /// Register the subscription and deliver matching events to `events`.
    ///
    /// Sent immediately when connected and re-sent on every reconnect.
    /// Returns the subscription id.
    pub async fn subscribe(&self, filter: Filter, events: mpsc::Sender<InboundMessage>) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        *self.inner.subscription.lock().await = Some(Subscription {
            id: id.clone(),
            filter,
            events,
        });

        let outbound = self.current_outbound().await;
        if let Some(outbound) = outbound {
            self.send_subscription(&outbound).await;
        }
        id
    }

    /// Publish a signed event and wait for the relay's acknowledgement.
    ///
    /// Connects first when not connected.
    pub async fn publish(&self, event: Event) -> Result<(), RelayError> {
        self.ensure_connected().await?;
        let outbound = self
            .current_outbound()
            .await
            .ok_or(RelayError::NotConnected)?;

        let event_id = event.id.clone();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .pending_acks
            .lock()
            .await
            .insert(event_id.clone(), ack_tx);

        if outbound.send(ClientMessage::Event(event)).await.is_err() {
            self.inner.pending_acks.lock().await.remove(&event_id);
            return Err(RelayError::NotConnected);
        }

        let timeout = self.inner.settings.publish_timeout;
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(event_id, "Relay accepted event");
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(RelayError::Rejected(reason)),
            Ok(Err(_)) => Err(RelayError::Connection(
                "connection closed before acknowledgement".into(),
            )),
            Err(_) => {
                self.inner.pending_acks.lock().await.remove(&event_id);
                Err(RelayError::Timeout(timeout))
            }
        }
    }

    /// Close the connection. No reconnect follows; pair with the shutdown
    /// signal to also cancel pending retries.
    pub async fn close(&self) {
        self.close_link().await;
        self.inner.state.send_replace(ConnectionState::Disconnected);
        info!("Relay connection closed");
    }

    fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    async fn current_outbound(&self) -> Option<mpsc::Sender<ClientMessage>> {
        self.inner
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.outbound.clone())
    }

    async fn connect_locked(&self) -> Result<(), RelayError> {
        if self.is_shut_down() {
            return Err(RelayError::ShutDown);
        }
        self.close_link().await;

        let url = &self.inner.settings.url;
        self.inner.state.send_replace(ConnectionState::Connecting);
        info!(url, "Connecting to relay");

        let connect_timeout = self.inner.settings.connect_timeout;
        let opened = tokio::time::timeout(connect_timeout, self.inner.transport.open(url))
            .await
            .unwrap_or_else(|_| Err(RelayError::Timeout(connect_timeout)));

        match opened {
            Ok(RelayLink { outbound, inbound }) => {
                let generation = self
                    .inner
                    .generation
                    .fetch_add(1, Ordering::SeqCst)
                    .wrapping_add(1);
                *self.inner.link.lock().await = Some(Link {
                    generation,
                    outbound: outbound.clone(),
                });
                self.inner.state.send_replace(ConnectionState::Connected);
                info!(url, "Connected to relay");

                self.spawn_reader(generation, inbound);
                self.send_subscription(&outbound).await;
                Ok(())
            }
            Err(e) => {
                self.inner.state.send_replace(ConnectionState::Disconnected);
                warn!(
                    url,
                    error = %e,
                    delay_secs = self.inner.settings.reconnect_delay.as_secs(),
                    "Relay connection failed, retry scheduled"
                );
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    /// Drop the current link. Errors are irrelevant here and only logged.
    async fn close_link(&self) {
        let previous = self.inner.link.lock().await.take();
        let Some(link) = previous else { return };

        let subscription_id = self
            .inner
            .subscription
            .lock()
            .await
            .as_ref()
            .map(|s| s.id.clone());
        if let Some(subscription_id) = subscription_id
            && let Err(e) = link
                .outbound
                .try_send(ClientMessage::Close { subscription_id })
        {
            debug!(error = %e, "Error closing previous relay subscription");
        }
        self.inner.pending_acks.lock().await.clear();
        debug!(generation = link.generation, "Previous relay connection dropped");
    }

    async fn send_subscription(&self, outbound: &mpsc::Sender<ClientMessage>) {
        let request = self
            .inner
            .subscription
            .lock()
            .await
            .as_ref()
            .map(|s| ClientMessage::Req {
                subscription_id: s.id.clone(),
                filter: s.filter.clone(),
            });
        let Some(request) = request else { return };

        if outbound.send(request).await.is_err() {
            warn!("Failed to send subscription request");
        } else {
            info!("Subscription request sent");
        }
    }

    fn spawn_reader(&self, generation: u64, mut inbound: mpsc::Receiver<RelayMessage>) {
        let connector = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                connector.handle_message(message).await;
            }
            connector.on_link_closed(generation).await;
        });
    }

    async fn handle_message(&self, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.handle_event(&subscription_id, event).await,
            RelayMessage::Eose { subscription_id } => {
                info!(subscription_id, "End of stored events, subscription is live");
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                let waiter = self.inner.pending_acks.lock().await.remove(&event_id);
                match waiter {
                    Some(tx) => {
                        let ack = if accepted { Ok(()) } else { Err(message) };
                        if tx.send(ack).is_err() {
                            debug!(event_id, "Publisher stopped waiting for acknowledgement");
                        }
                    }
                    None => debug!(event_id, accepted, "Unexpected OK from relay"),
                }
            }
            RelayMessage::Notice { message } => warn!(notice = %message, "Relay notice"),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => warn!(subscription_id, reason = %message, "Relay closed subscription"),
        }
    }

    async fn handle_event(&self, subscription_id: &str, event: Event) {
        let target = {
            let subscription = self.inner.subscription.lock().await;
            match subscription.as_ref() {
                Some(s) if s.id == subscription_id => Some((s.filter.clone(), s.events.clone())),
                _ => None,
            }
        };
        let Some((filter, events)) = target else {
            debug!(subscription_id, "Event for unknown subscription");
            return;
        };

        if let Err(e) = event.verify() {
            warn!(event_id = %event.id, error = %e, "Dropping event that failed verification");
            return;
        }
        if !filter.matches(&event) {
            warn!(event_id = %event.id, kind = event.kind, "Dropping event outside subscription filter");
            return;
        }
        if !self.inner.seen.lock().await.insert(&event.id) {
            debug!(event_id = %event.id, "Duplicate event ignored");
            return;
        }

        info!(
            event_id = %event.id,
            sender = %event.pubkey,
            created_at = event.created_at,
            "Received relay event"
        );
        let message = InboundMessage {
            sender: event.pubkey,
            payload: event.content,
            event_id: event.id,
            received_at: Utc::now(),
        };
        if events.send(message).await.is_err() {
            warn!("Inbound event receiver dropped");
        }
    }

    async fn on_link_closed(&self, generation: u64) {
        let current = {
            let mut link = self.inner.link.lock().await;
            if link.as_ref().is_some_and(|l| l.generation == generation) {
                *link = None;
                true
            } else {
                false
            }
        };
        if !current {
            return;
        }

        self.inner.pending_acks.lock().await.clear();
        self.inner.state.send_replace(ConnectionState::Disconnected);
        if self.is_shut_down() {
            return;
        }
        warn!(
            delay_secs = self.inner.settings.reconnect_delay.as_secs(),
            "Relay connection lost, reconnect scheduled"
        );
        self.schedule_reconnect();
    }

    /// Try again after the reconnect delay. At most one retry is pending.
    fn schedule_reconnect(&self) {
        if self.is_shut_down() || self.inner.retry_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let connector = self.clone();
        let delay = self.inner.settings.reconnect_delay;
        let mut shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    connector.inner.retry_pending.store(false, Ordering::SeqCst);
                    debug!("Reconnect cancelled by shutdown");
                    return;
                }
            }
            connector.inner.retry_pending.store(false, Ordering::SeqCst);
            if let Err(e) = connector.ensure_connected().await {
                debug!(error = %e, "Reconnect attempt failed");
            }
        });
    }
}
