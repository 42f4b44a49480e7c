//! In-process stand-in for the remote store, with fault injection.
//!
//! Behaves like a single Redis server shared by every connection the
//! connector hands out: string keys with expiry, hashes with expiry, and
//! channel fan-out. Expiry uses `tokio::time::Instant`, so paused-clock
//! tests advance it deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use huddle_core::BackendError;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::backend::{
    effective_ttl, CommandConnection, Connector, MessageStream, PublishConnection,
    SubscribeConnection,
};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct MockServer {
    strings: Mutex<HashMap<String, (String, Instant)>>,
    hashes: Mutex<HashMap<String, (HashMap<String, String>, Option<Instant>)>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    unreachable: AtomicBool,
    refuse_connects: AtomicU32,
    fail_commands: AtomicBool,
    connect_attempts: AtomicU32,
}

impl MockServer {
    fn check_reachable(&self) -> Result<(), BackendError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(BackendError::Connection("mock backend unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn check_command(&self) -> Result<(), BackendError> {
        self.check_reachable()?;
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(BackendError::Command("mock command failure".into()));
        }
        Ok(())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// Connector over a shared [`MockServer`]. Clones share the same server.
#[derive(Clone, Default)]
pub struct MockConnector {
    server: Arc<MockServer>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` connect attempts.
    pub fn refuse_connects(&self, n: u32) {
        self.server.refuse_connects.store(n, Ordering::SeqCst);
    }

    /// Simulate the server going away (or coming back). While unreachable,
    /// connects are refused and commands on open connections fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.server.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Make commands fail with a non-connection error.
    pub fn fail_commands(&self, fail: bool) {
        self.server.fail_commands.store(fail, Ordering::SeqCst);
    }

    /// Number of connect attempts seen so far (one per attempt, not per
    /// connection).
    pub fn connect_attempts(&self) -> u32 {
        self.server.connect_attempts.load(Ordering::SeqCst)
    }

    /// Push a raw payload to every subscriber of `channel`, bypassing
    /// envelope encoding.
    pub fn inject_raw(&self, channel: &str, payload: &str) -> usize {
        self.server.sender(channel).send(payload.to_string()).unwrap_or(0)
    }

    /// Read a string key directly from the server.
    pub fn raw_get(&self, key: &str) -> Option<String> {
        let strings = self.server.strings.lock();
        strings
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone())
    }

    /// Read a hash directly from the server.
    pub fn raw_hash(&self, key: &str) -> HashMap<String, String> {
        let hashes = self.server.hashes.lock();
        hashes
            .get(key)
            .filter(|(_, expires_at)| expires_at.map_or(true, |at| at > Instant::now()))
            .map(|(fields, _)| fields.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn endpoint(&self) -> String {
        "mock://in-process".into()
    }

    async fn command(&self) -> Result<Arc<dyn CommandConnection>, BackendError> {
        self.server.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .server
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BackendError::Connection("mock connection refused".into()));
        }
        self.server.check_reachable()?;
        Ok(Arc::new(MockCommand {
            server: Arc::clone(&self.server),
        }))
    }

    async fn publisher(&self) -> Result<Arc<dyn PublishConnection>, BackendError> {
        self.server.check_reachable()?;
        Ok(Arc::new(MockPublisher {
            server: Arc::clone(&self.server),
        }))
    }

    async fn subscriber(&self) -> Result<Arc<dyn SubscribeConnection>, BackendError> {
        self.server.check_reachable()?;
        Ok(Arc::new(MockSubscriber {
            server: Arc::clone(&self.server),
        }))
    }
}

struct MockCommand {
    server: Arc<MockServer>,
}

#[async_trait]
impl CommandConnection for MockCommand {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.server.check_command()?;
        let mut strings = self.server.strings.lock();
        match strings.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                let _ = strings.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        self.server.check_command()?;
        let _ = self
            .server
            .strings
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + effective_ttl(ttl)));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), BackendError> {
        self.server.check_command()?;
        let _ = self.server.strings.lock().remove(key);
        let _ = self.server.hashes.lock().remove(key);
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BackendError> {
        self.server.check_command()?;
        let mut hashes = self.server.hashes.lock();
        let now = Instant::now();
        let entry = hashes
            .entry(key.to_string())
            .or_insert_with(|| (HashMap::new(), None));
        if entry.1.is_some_and(|at| at <= now) {
            *entry = (HashMap::new(), None);
        }
        let _ = entry.0.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), BackendError> {
        self.server.check_command()?;
        let mut hashes = self.server.hashes.lock();
        if let Some((fields, _)) = hashes.get_mut(key) {
            let _ = fields.remove(field);
            if fields.is_empty() {
                let _ = hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BackendError> {
        self.server.check_command()?;
        let mut hashes = self.server.hashes.lock();
        match hashes.get(key) {
            Some((_, Some(at))) if *at <= Instant::now() => {
                let _ = hashes.remove(key);
                Ok(HashMap::new())
            }
            Some((fields, _)) => Ok(fields.clone()),
            None => Ok(HashMap::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        self.server.check_command()?;
        let deadline = Instant::now() + effective_ttl(ttl);
        if let Some(entry) = self.server.hashes.lock().get_mut(key) {
            entry.1 = Some(deadline);
        }
        if let Some(entry) = self.server.strings.lock().get_mut(key) {
            entry.1 = deadline;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.server.check_command()
    }
}

struct MockPublisher {
    server: Arc<MockServer>,
}

#[async_trait]
impl PublishConnection for MockPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BackendError> {
        self.server.check_command()?;
        let receivers = self.server.sender(channel).send(payload.to_string()).unwrap_or(0);
        Ok(receivers as u64)
    }
}

struct MockSubscriber {
    server: Arc<MockServer>,
}

#[async_trait]
impl SubscribeConnection for MockSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BackendError> {
        self.server.check_reachable()?;
        let rx = self.server.sender(channel).subscribe();
        let stream = BroadcastStream::new(rx)
            .map(|item| item.map_err(|e| BackendError::Protocol(e.to_string())));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_roundtrip() {
        let connector = MockConnector::new();
        let conn = connector.command().await.unwrap();
        conn.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(conn.get("k").await.unwrap(), Some("v".to_string()));
        conn.del("k").await.unwrap();
        assert_eq!(conn.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn huge_ttl_is_capped() {
        let connector = MockConnector::new();
        let conn = connector.command().await.unwrap();
        conn.set_ex("k", "v", Duration::MAX).await.unwrap();
        conn.hset("h", "f", "v").await.unwrap();
        conn.expire("h", Duration::MAX).await.unwrap();
        assert_eq!(conn.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(conn.hgetall("h").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn string_expires() {
        let connector = MockConnector::new();
        let conn = connector.command().await.unwrap();
        conn.set_ex("k", "v", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(conn.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn hash_expire_refresh() {
        let connector = MockConnector::new();
        let conn = connector.command().await.unwrap();
        conn.hset("h", "a", "1").await.unwrap();
        conn.expire("h", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        conn.expire("h", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(conn.hgetall("h").await.unwrap().len(), 1);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(conn.hgetall("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_connects_are_counted() {
        let connector = MockConnector::new();
        connector.refuse_connects(2);
        assert!(connector.command().await.is_err());
        assert!(connector.command().await.is_err());
        assert!(connector.command().await.is_ok());
        assert_eq!(connector.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn unreachable_fails_open_connections() {
        let connector = MockConnector::new();
        let conn = connector.command().await.unwrap();
        connector.set_reachable(false);
        let err = conn.get("k").await.unwrap_err();
        assert!(err.is_connection_error());
        connector.set_reachable(true);
        assert!(conn.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn command_failures_are_not_connection_errors() {
        let connector = MockConnector::new();
        let conn = connector.command().await.unwrap();
        connector.fail_commands(true);
        let err = conn.ping().await.unwrap_err();
        assert!(!err.is_connection_error());
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let connector = MockConnector::new();
        let subscriber = connector.subscriber().await.unwrap();
        let mut stream = subscriber.subscribe("room").await.unwrap();
        let publisher = connector.publisher().await.unwrap();
        assert_eq!(publisher.publish("room", "hello").await.unwrap(), 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn publish_without_subscribers_reaches_nobody() {
        let connector = MockConnector::new();
        let publisher = connector.publisher().await.unwrap();
        assert_eq!(publisher.publish("empty", "x").await.unwrap(), 0);
    }
}
