//! Bridge coordinator.
//!
//! The only owner of the request queue and routing state. Relay events,
//! worker output and publish completions all arrive as channel messages and
//! are handled one at a time by a single task.
//!
//! Per item: received, queued, dispatched, responded, published. A dispatch
//! the worker cannot accept goes back to the front of the queue and is
//! retried after a fixed delay. The next dispatch waits until the previous
//! response has been published (or failed to publish).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use relaybridge_core::Config;
use relaybridge_core::config::OverflowPolicy;
use relaybridge_core::ndjson::{RequestEnvelope, WorkerResponse};

use super::payload::inbound_message_text;
use super::publisher::ResponsePublisher;
use crate::queue::{EnqueueOutcome, RequestQueue, WorkItem};
use crate::relay::{InboundMessage, RelayError};
use crate::subprocess::{SupervisorError, WorkerEvent, WorkerSupervisor};

/// Accepts requests for the worker.
#[async_trait]
pub trait WorkerSink: Send + Sync + 'static {
    async fn send(&self, envelope: &RequestEnvelope) -> Result<(), SupervisorError>;
}

#[async_trait]
impl WorkerSink for WorkerSupervisor {
    async fn send(&self, envelope: &RequestEnvelope) -> Result<(), SupervisorError> {
        Self::send(self, envelope).await
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub method: String,
    pub template: String,
    /// Recipient for responses that lost their reply address.
    pub default_recipient: Option<String>,
    pub dispatch_retry: Duration,
    /// Dispatches per item before a crashing request is dropped.
    pub max_attempts: u32,
    pub status_interval: Duration,
    pub queue_capacity: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl BridgeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            method: config.worker.method.clone(),
            template: config.worker.template.clone(),
            default_recipient: config.relay.default_recipient.clone(),
            dispatch_retry: config.queue.dispatch_retry(),
            max_attempts: config.queue.max_attempts,
            status_interval: config.queue.status_interval(),
            queue_capacity: config.queue.capacity,
            overflow: config.queue.overflow,
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Snapshot of the coordinator, refreshed after every handled message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStatus {
    /// Items waiting, excluding the in-flight one.
    pub queued: usize,
    pub in_flight: bool,
    /// Publishes not yet finished.
    pub publishing: usize,
    pub received: u64,
    pub dispatched: u64,
    pub published: u64,
    /// Responses that could not be delivered.
    pub failed: u64,
    /// Requests discarded by overflow or the redelivery cap.
    pub dropped: u64,
}

struct PublishDone {
    recipient: String,
    result: Result<(), RelayError>,
}

/// Single-task owner of queue and routing state.
pub struct BridgeCoordinator<W, P> {
    settings: BridgeSettings,
    worker: Arc<W>,
    publisher: Arc<P>,
    queue: RequestQueue,
    next_request_id: u64,
    /// Set while waiting to retry a dispatch the worker refused.
    retry_at: Option<Instant>,
    publishing: usize,
    status: BridgeStatus,
    status_tx: watch::Sender<BridgeStatus>,
    publish_done_tx: mpsc::UnboundedSender<PublishDone>,
    publish_done_rx: mpsc::UnboundedReceiver<PublishDone>,
}

impl<W: WorkerSink, P: ResponsePublisher> BridgeCoordinator<W, P> {
    pub fn new(settings: BridgeSettings, worker: Arc<W>, publisher: Arc<P>) -> Self {
        let queue = match settings.queue_capacity {
            Some(capacity) => RequestQueue::bounded(capacity, settings.overflow),
            None => RequestQueue::unbounded(),
        };
        let (status_tx, _) = watch::channel(BridgeStatus::default());
        let (publish_done_tx, publish_done_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            worker,
            publisher,
            queue,
            next_request_id: 0,
            retry_at: None,
            publishing: 0,
            status: BridgeStatus::default(),
            status_tx,
            publish_done_tx,
            publish_done_rx,
        }
    }

    /// Watch the status snapshot.
    pub fn status(&self) -> watch::Receiver<BridgeStatus> {
        self.status_tx.subscribe()
    }

    /// Run until `shutdown` fires.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut worker_events: mpsc::Receiver<WorkerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut status_timer = tokio::time::interval(self.settings.status_interval);
        status_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        status_timer.tick().await; // Skip first immediate tick

        info!("Bridge coordinator started");
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                Some(message) = inbound.recv() => self.on_inbound(message).await,
                Some(event) = worker_events.recv() => self.on_worker_event(event).await,
                Some(done) = self.publish_done_rx.recv() => self.on_publish_done(done).await,
                () = sleep_until_or_pending(retry_at) => {
                    self.retry_at = None;
                    self.try_dispatch().await;
                }
                _ = status_timer.tick() => {
                    debug!(status = ?self.status, "Bridge status");
                }
                _ = shutdown.changed() => {
                    info!(status = ?self.status, "Bridge coordinator shutting down");
                    break;
                }
            }
            self.publish_status();
        }
    }

    async fn on_inbound(&mut self, message: InboundMessage) {
        self.status.received = self.status.received.saturating_add(1);
        info!(
            event_id = %message.event_id,
            sender = %message.sender,
            "Request received"
        );

        let item = WorkItem::new(inbound_message_text(&message.payload), message.sender);
        match self.queue.enqueue(item) {
            Ok(EnqueueOutcome::Queued { depth }) => info!(depth, "Request queued"),
            Ok(EnqueueOutcome::DroppedOldest { evicted, depth }) => {
                self.status.dropped = self.status.dropped.saturating_add(1);
                warn!(depth, reply_to = %evicted.reply_to, "Queue full, oldest request dropped");
            }
            Err(e) => {
                self.status.dropped = self.status.dropped.saturating_add(1);
                warn!(error = %e, "Request rejected");
            }
        }
        self.try_dispatch().await;
    }

    /// Dispatch the front item if the worker slot is free.
    async fn try_dispatch(&mut self) {
        if self.retry_at.is_some() || self.publishing > 0 {
            return;
        }
        let Some(mut item) = self.queue.pop_next() else {
            return;
        };

        self.next_request_id = self.next_request_id.wrapping_add(1);
        let request_id = self.next_request_id;
        let envelope = RequestEnvelope::chat(
            request_id,
            &self.settings.method,
            &self.settings.template,
            &item.payload,
            &item.reply_to,
        );

        match self.worker.send(&envelope).await {
            Ok(()) => {
                item.attempts = item.attempts.saturating_add(1);
                info!(
                    request_id,
                    attempt = item.attempts,
                    reply_to = %item.reply_to,
                    "Request dispatched to worker"
                );
                self.status.dispatched = self.status.dispatched.saturating_add(1);
                self.queue.mark_in_flight(item);
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retry_ms = self.settings.dispatch_retry.as_millis(),
                    "Worker unavailable, request requeued"
                );
                self.queue.requeue_front(item);
                self.retry_at = Some(Instant::now() + self.settings.dispatch_retry);
            }
        }
    }

    async fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Record(record) => self.on_response(&record),
            WorkerEvent::Exited { code } => self.on_worker_exit(code),
        }
        self.try_dispatch().await;
    }

    fn on_response(&mut self, record: &Value) {
        let response = WorkerResponse::from_value(record);
        if self.queue.complete().is_none() {
            debug!(request_id = ?response.id, "Worker response with no request in flight");
        }

        let default_recipient = self.settings.default_recipient.as_deref();
        let Some(recipient) = response.reply_to_or(default_recipient).map(String::from) else {
            self.status.failed = self.status.failed.saturating_add(1);
            warn!(
                request_id = ?response.id,
                "Response has no reply address and no default recipient is configured, dropped"
            );
            return;
        };
        if response.reply_to.is_none() {
            warn!(recipient, "Response lost its reply address, using default recipient");
        }
        info!(
            request_id = ?response.id,
            recipient,
            is_error = response.is_error(),
            "Worker response received"
        );

        self.publishing = self.publishing.saturating_add(1);
        let publisher = Arc::clone(&self.publisher);
        let done = self.publish_done_tx.clone();
        let message = response.message;
        tokio::spawn(async move {
            let result = publisher.publish(&recipient, &message).await;
            if done.send(PublishDone { recipient, result }).is_err() {
                debug!("Coordinator gone before publish completed");
            }
        });
    }

    fn on_worker_exit(&mut self, code: Option<i32>) {
        let Some(item) = self.queue.complete() else {
            debug!(?code, "Worker exited with nothing in flight");
            return;
        };

        if item.attempts >= self.settings.max_attempts {
            self.status.dropped = self.status.dropped.saturating_add(1);
            error!(
                reply_to = %item.reply_to,
                attempts = item.attempts,
                ?code,
                "Worker keeps exiting on this request, dropped"
            );
        } else {
            warn!(
                reply_to = %item.reply_to,
                attempts = item.attempts,
                ?code,
                "Worker exited with a request in flight, requeued"
            );
            self.queue.requeue_front(item);
        }
    }

    async fn on_publish_done(&mut self, done: PublishDone) {
        self.publishing = self.publishing.saturating_sub(1);
        match done.result {
            Ok(()) => {
                self.status.published = self.status.published.saturating_add(1);
                info!(recipient = %done.recipient, "Response published");
            }
            Err(e) => {
                self.status.failed = self.status.failed.saturating_add(1);
                error!(recipient = %done.recipient, error = %e, "Failed to publish response");
            }
        }
        self.try_dispatch().await;
    }

    fn publish_status(&mut self) {
        self.status.queued = self.queue.len();
        self.status.in_flight = self.queue.is_busy();
        self.status.publishing = self.publishing;
        self.status_tx.send_replace(self.status);
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
