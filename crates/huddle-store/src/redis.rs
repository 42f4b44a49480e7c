//! Redis implementation of the backend seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use huddle_core::{BackendError, HuddleSettings};
use parking_lot::Mutex;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{Client, IntoConnectionInfo, RedisError};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::backend::{
    effective_ttl, CommandConnection, Connector, MessageStream, PublishConnection,
    SubscribeConnection,
};

/// Opens multiplexed command/publish connections and dedicated pub/sub
/// connections against a single Redis endpoint.
pub struct RedisConnector {
    client: Client,
    endpoint: String,
}

impl RedisConnector {
    /// Build a connector. No I/O happens until a connection is requested.
    pub fn new(url: &str, password: Option<&SecretString>) -> Result<Self, BackendError> {
        let mut info = url.into_connection_info().map_err(map_redis_error)?;
        if let Some(password) = password {
            info.redis.password = Some(password.expose_secret().to_string());
        }
        let client = Client::open(info).map_err(map_redis_error)?;
        Ok(Self {
            client,
            endpoint: redact_url(url),
        })
    }

    pub fn from_settings(settings: &HuddleSettings) -> Result<Self, BackendError> {
        Self::new(&settings.redis_url, settings.redis_password.as_ref())
    }
}

#[async_trait]
impl Connector for RedisConnector {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn command(&self) -> Result<Arc<dyn CommandConnection>, BackendError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        debug!(endpoint = %self.endpoint, "command connection open");
        Ok(Arc::new(RedisCommand { conn }))
    }

    async fn publisher(&self) -> Result<Arc<dyn PublishConnection>, BackendError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        debug!(endpoint = %self.endpoint, "publish connection open");
        Ok(Arc::new(RedisPublisher { conn }))
    }

    async fn subscriber(&self) -> Result<Arc<dyn SubscribeConnection>, BackendError> {
        let pubsub = self.client.get_async_pubsub().await.map_err(map_redis_error)?;
        debug!(endpoint = %self.endpoint, "subscribe connection open");
        Ok(Arc::new(RedisSubscriber {
            client: self.client.clone(),
            idle: Mutex::new(Some(pubsub)),
        }))
    }
}

struct RedisCommand {
    conn: MultiplexedConnection,
}

#[async_trait]
impl CommandConnection for RedisCommand {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("SETEX")
            .arg(key)
            .arg(effective_ttl(ttl).as_secs())
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn del(&self, key: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async::<_, HashMap<String, String>>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(effective_ttl(ttl).as_secs())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(BackendError::Protocol(format!("unexpected PING reply: {pong}")))
        }
    }
}

struct RedisPublisher {
    conn: MultiplexedConnection,
}

#[async_trait]
impl PublishConnection for RedisPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, u64>(&mut conn)
            .await
            .map_err(map_redis_error)
    }
}

/// Holds the pub/sub connection opened at connect time; the first
/// subscription takes it, later ones open their own.
struct RedisSubscriber {
    client: Client,
    idle: Mutex<Option<PubSub>>,
}

#[async_trait]
impl SubscribeConnection for RedisSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BackendError> {
        let idle = self.idle.lock().take();
        let mut pubsub = match idle {
            Some(pubsub) => pubsub,
            None => self.client.get_async_pubsub().await.map_err(map_redis_error)?,
        };
        pubsub.subscribe(channel).await.map_err(map_redis_error)?;

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().map_err(map_redis_error));
        Ok(Box::pin(stream))
    }
}

fn map_redis_error(e: RedisError) -> BackendError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        BackendError::Connection(e.to_string())
    } else {
        BackendError::Command(e.to_string())
    }
}

/// Strip any `user:password@` section so the URL is safe to log.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://{host}"),
        None => url.to_string(),
    }
}
