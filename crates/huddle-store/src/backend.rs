//! Seam between the resilient layer and a concrete remote store.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use huddle_core::BackendError;

/// Longest expiry any backend applies, so `now + ttl` cannot overflow.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Expiry every backend actually applies: whole seconds, at least one
/// (Redis rejects a zero expiry) and at most [`MAX_TTL`].
pub fn effective_ttl(ttl: Duration) -> Duration {
    Duration::from_secs(ttl.as_secs().clamp(1, MAX_TTL.as_secs()))
}

/// Raw payloads delivered on a subscribed channel. Decoding is the caller's job.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Request/response connection used for state and participant data.
#[async_trait]
pub trait CommandConnection: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError>;

    async fn del(&self, key: &str) -> Result<(), BackendError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BackendError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<(), BackendError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BackendError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;
}

/// Connection dedicated to outbound channel publishes.
#[async_trait]
pub trait PublishConnection: Send + Sync {
    /// Publish a payload. Returns the number of receivers reached.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BackendError>;
}

/// Source of subscription connections.
///
/// A subscribed connection cannot issue further commands, so every
/// [`SubscribeConnection::subscribe`] call ends up on a dedicated connection.
#[async_trait]
pub trait SubscribeConnection: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BackendError>;
}

/// Opens the three logical connections to a remote store.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Human-readable endpoint for logs (credentials stripped).
    fn endpoint(&self) -> String;

    async fn command(&self) -> Result<Arc<dyn CommandConnection>, BackendError>;

    async fn publisher(&self) -> Result<Arc<dyn PublishConnection>, BackendError>;

    async fn subscriber(&self) -> Result<Arc<dyn SubscribeConnection>, BackendError>;
}
