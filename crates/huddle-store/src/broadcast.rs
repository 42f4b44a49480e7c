//! Channel pub/sub over the remote backend.
//!
//! Delivery is best effort and at most once: events published while
//! disconnected are dropped (and logged), and subscriptions are only opened
//! against a live backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use huddle_core::{BackendError, EventEnvelope};
use huddle_telemetry::MetricsRecorder;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::backend::MessageStream;
use crate::connection::ConnectionManager;

/// Handle to a running subscription.
///
/// Dropping the handle leaves the subscription running; call
/// [`SubscriptionHandle::unsubscribe`] or shut the broadcaster down.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    id: Uuid,
    channel: String,
    token: CancellationToken,
    active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stop delivering events to this subscription's callback.
    pub fn unsubscribe(&self) {
        self.token.cancel();
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub struct EventBroadcaster {
    manager: Arc<ConnectionManager>,
    metrics: Arc<MetricsRecorder>,
    shutdown: CancellationToken,
}

impl EventBroadcaster {
    pub fn new(manager: Arc<ConnectionManager>, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            manager,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Wrap `data` in an envelope and publish it on `channel`.
    ///
    /// Always returns `true`. Events that cannot be delivered are dropped.
    pub async fn publish_event(&self, channel: &str, event: &str, data: Value) -> bool {
        let Some(publisher) = self.manager.publisher() else {
            self.metrics.increment("events.dropped", 1);
            debug!(channel, event, "not connected, broadcast dropped");
            return true;
        };
        let envelope = EventEnvelope::new(event, data);
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.increment("events.dropped", 1);
                warn!(channel, event, error = %e, "event not serializable, broadcast dropped");
                return true;
            }
        };
        match publisher.publish(channel, &payload).await {
            Ok(receivers) => {
                self.metrics.increment("events.published", 1);
                debug!(channel, event, receivers, "event published");
            }
            Err(e) => {
                self.metrics.increment("events.dropped", 1);
                warn!(channel, event, error = %e, kind = e.error_kind(), "publish failed, broadcast dropped");
                self.manager
                    .report_error("publish_event", publisher.generation(), &e);
            }
        }
        true
    }

    /// Deliver every event published on `channel` to `callback`.
    ///
    /// Returns `None` when not connected or when the subscription cannot be
    /// opened. Payloads that are not valid envelopes are logged and skipped.
    pub async fn subscribe_to_events<F>(&self, channel: &str, callback: F) -> Option<SubscriptionHandle>
    where
        F: Fn(EventEnvelope) + Send + Sync + 'static,
    {
        if self.shutdown.is_cancelled() {
            return None;
        }
        let Some(subscriber) = self.manager.subscriber() else {
            debug!(channel, "not connected, subscription skipped");
            return None;
        };
        let stream = match subscriber.subscribe(channel).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(channel, error = %e, kind = e.error_kind(), "subscribe failed");
                self.manager
                    .report_error("subscribe_to_events", subscriber.generation(), &e);
                return None;
            }
        };

        let handle = SubscriptionHandle {
            id: Uuid::now_v7(),
            channel: channel.to_string(),
            token: self.shutdown.child_token(),
            active: Arc::new(AtomicBool::new(true)),
        };
        let task = SubscriptionTask {
            channel: handle.channel.clone(),
            token: handle.token.clone(),
            active: Arc::clone(&handle.active),
            generation: subscriber.generation(),
            manager: Arc::clone(&self.manager),
            metrics: Arc::clone(&self.metrics),
        };
        let span = tracing::info_span!("subscription", channel, id = %handle.id);
        drop(tokio::spawn(task.run(stream, callback).instrument(span)));
        info!(channel, id = %handle.id, "subscribed");
        Some(handle)
    }

    /// Cancel every live subscription and refuse new ones.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

struct SubscriptionTask {
    channel: String,
    token: CancellationToken,
    active: Arc<AtomicBool>,
    generation: u64,
    manager: Arc<ConnectionManager>,
    metrics: Arc<MetricsRecorder>,
}

impl SubscriptionTask {
    async fn run<F>(self, mut stream: MessageStream, callback: F)
    where
        F: Fn(EventEnvelope) + Send + Sync + 'static,
    {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!("subscription cancelled");
                    break;
                }
                item = stream.next() => item,
            };
            match item {
                Some(Ok(payload)) => match serde_json::from_str::<EventEnvelope>(&payload) {
                    Ok(envelope) => callback(envelope),
                    Err(e) => {
                        self.metrics.increment("events.malformed", 1);
                        warn!(channel = %self.channel, error = %e, "dropping malformed event payload");
                    }
                },
                Some(Err(e)) if e.is_connection_error() => {
                    warn!(channel = %self.channel, error = %e, "subscription connection lost");
                    self.manager
                        .report_error("subscription", self.generation, &e);
                    break;
                }
                Some(Err(e)) => {
                    warn!(channel = %self.channel, error = %e, "subscription stream error");
                }
                // A dropped pub/sub socket ends the stream without an error.
                None if !self.token.is_cancelled() => {
                    warn!(channel = %self.channel, "subscription stream ended, connection lost");
                    self.manager
                        .report_error("subscription", self.generation, &BackendError::Closed);
                    break;
                }
                None => break,
            }
        }
        self.active.store(false, Ordering::Release);
    }
}
