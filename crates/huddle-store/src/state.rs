//! Key/value session state with transparent fallback.
//!
//! Every call picks its backend from the connection manager at call time.
//! Remote failures are logged, reported, and the call is retried against the
//! fallback store; callers never see an error. Data written to one backend is
//! never copied to the other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use huddle_core::keys::session_key;
use huddle_core::{BackendError, HuddleSettings};
use huddle_telemetry::MetricsRecorder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::{ConnectionManager, Route};
use crate::fallback::FallbackStore;

pub struct StateStore {
    manager: Arc<ConnectionManager>,
    fallback: Arc<FallbackStore>,
    default_ttl: Duration,
    metrics: Arc<MetricsRecorder>,
}

impl StateStore {
    pub fn new(
        manager: Arc<ConnectionManager>,
        fallback: Arc<FallbackStore>,
        settings: &HuddleSettings,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            manager,
            fallback,
            default_ttl: settings.default_state_ttl(),
            metrics,
        }
    }

    pub fn fallback(&self) -> &Arc<FallbackStore> {
        &self.fallback
    }

    /// Store a JSON value under `key` for `ttl` (default one hour).
    ///
    /// Always returns `true`: a failed remote write lands in the fallback.
    pub async fn set_state(&self, key: &str, value: &Value, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let payload = value.to_string();
        if let Route::Remote(conn) = self.manager.route() {
            match conn.set_ex(key, &payload, ttl).await {
                Ok(()) => return true,
                Err(e) => self.remote_failed("set_state", key, conn.generation(), &e),
            }
        }
        self.metrics.increment("state.fallback_writes", 1);
        self.fallback.set(key, payload, ttl);
        true
    }

    /// Read the value under `key`. `None` if absent, expired or undecodable.
    pub async fn get_state(&self, key: &str) -> Option<Value> {
        if let Route::Remote(conn) = self.manager.route() {
            let result = match conn.get(key).await {
                Ok(Some(raw)) => serde_json::from_str::<Value>(&raw)
                    .map(Some)
                    .map_err(BackendError::from),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };
            match result {
                Ok(value) => return value,
                Err(e) => self.remote_failed("get_state", key, conn.generation(), &e),
            }
        }
        let raw = self.fallback.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable fallback entry");
                None
            }
        }
    }

    /// Remove `key`. Always returns `true`.
    pub async fn delete_state(&self, key: &str) -> bool {
        if let Route::Remote(conn) = self.manager.route() {
            match conn.del(key).await {
                Ok(()) => return true,
                Err(e) => self.remote_failed("delete_state", key, conn.generation(), &e),
            }
        }
        let _ = self.fallback.remove(key);
        true
    }

    /// Serialize `value` and store it. `false` only if serialization fails.
    pub async fn set_typed<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match serde_json::to_value(value) {
            Ok(json) => self.set_state(key, &json, ttl).await,
            Err(e) => {
                warn!(key, error = %e, "state value not serializable");
                false
            }
        }
    }

    /// Read and decode `key`. A shape mismatch is logged and reads as `None`.
    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_state(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key, error = %e, "stored state has unexpected shape");
                None
            }
        }
    }

    pub async fn set_session(&self, session_id: &str, value: &Value, ttl: Option<Duration>) -> bool {
        self.set_state(&session_key(session_id), value, ttl).await
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Value> {
        self.get_state(&session_key(session_id)).await
    }

    pub async fn delete_session(&self, session_id: &str) -> bool {
        self.delete_state(&session_key(session_id)).await
    }

    /// Insert or replace `field` in the collection at `key`, refreshing the
    /// collection's expiry to `ttl`.
    pub async fn hash_upsert(&self, key: &str, field: &str, payload: &str, ttl: Duration) {
        if let Route::Remote(conn) = self.manager.route() {
            let result = async {
                conn.hset(key, field, payload).await?;
                conn.expire(key, ttl).await
            }
            .await;
            match result {
                Ok(()) => return,
                Err(e) => self.remote_failed("hash_upsert", key, conn.generation(), &e),
            }
        }
        self.metrics.increment("state.fallback_writes", 1);
        self.fallback
            .upsert_field(key, field, payload.to_string(), ttl);
    }

    /// Remove `field` from the collection at `key`. Absent fields are a no-op.
    pub async fn hash_remove(&self, key: &str, field: &str) {
        if let Route::Remote(conn) = self.manager.route() {
            match conn.hdel(key, field).await {
                Ok(()) => return,
                Err(e) => self.remote_failed("hash_remove", key, conn.generation(), &e),
            }
        }
        if !self.fallback.remove_field(key, field) {
            debug!(key, field, "field not present in fallback");
        }
    }

    /// Every payload in the collection at `key`, keyed by field.
    ///
    /// Fallback results keep insertion order; remote results are sorted by field.
    pub async fn hash_values(&self, key: &str) -> Vec<(String, String)> {
        if let Route::Remote(conn) = self.manager.route() {
            match conn.hgetall(key).await {
                Ok(fields) => return sorted_fields(fields),
                Err(e) => self.remote_failed("hash_values", key, conn.generation(), &e),
            }
        }
        self.fallback.field_entries(key)
    }

    fn remote_failed(&self, operation: &'static str, key: &str, generation: u64, err: &BackendError) {
        self.metrics.increment("state.remote_errors", 1);
        warn!(operation, key, error = %err, kind = err.error_kind(), "remote operation failed, using fallback");
        self.manager.report_error(operation, generation, err);
    }
}

fn sorted_fields(fields: HashMap<String, String>) -> Vec<(String, String)> {
    let mut pairs: Vec<_> = fields.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use huddle_core::ConnectivityState;
    use serde::Deserialize;
    use serde_json::json;

    struct Fixture {
        connector: MockConnector,
        manager: Arc<ConnectionManager>,
        store: StateStore,
        metrics: Arc<MetricsRecorder>,
    }

    async fn fixture(reachable: bool) -> Fixture {
        let connector = MockConnector::new();
        connector.set_reachable(reachable);
        let settings = HuddleSettings::default();
        let metrics = Arc::new(MetricsRecorder::new());
        let manager =
            ConnectionManager::start(Arc::new(connector.clone()), &settings, Arc::clone(&metrics));
        let _ = manager.wait_settled(Duration::from_secs(30)).await;
        let store = StateStore::new(
            Arc::clone(&manager),
            Arc::new(FallbackStore::new()),
            &settings,
            Arc::clone(&metrics),
        );
        Fixture {
            connector,
            manager,
            store,
            metrics,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn remote_roundtrip() {
        let f = fixture(true).await;
        let value = json!({"topic": "standup", "round": 2});
        assert!(f.store.set_state("session:a", &value, None).await);
        assert_eq!(f.store.get_state("session:a").await, Some(value));
        assert!(f.connector.raw_get("session:a").is_some());
        assert!(f.store.fallback().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_roundtrip() {
        let f = fixture(false).await;
        assert_eq!(f.manager.state(), ConnectivityState::Fallback);
        let value = json!(["a", "b"]);
        assert!(f.store.set_state("k", &value, None).await);
        assert_eq!(f.store.get_state("k").await, Some(value));
        assert_eq!(f.metrics.counter("state.fallback_writes"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_ttl_expires() {
        let f = fixture(false).await;
        f.store
            .set_state("k", &json!(1), Some(Duration::from_secs(5)))
            .await;
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(f.store.get_state("k").await, Some(json!(1)));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(f.store.get_state("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_key_is_none() {
        let f = fixture(true).await;
        assert_eq!(f.store.get_state("nope").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_on_both_backends() {
        let f = fixture(true).await;
        f.store.set_state("k", &json!(true), None).await;
        assert!(f.store.delete_state("k").await);
        assert_eq!(f.store.get_state("k").await, None);

        let f = fixture(false).await;
        f.store.set_state("k", &json!(true), None).await;
        assert!(f.store.delete_state("k").await);
        assert_eq!(f.store.get_state("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_write_failure_lands_in_fallback() {
        let f = fixture(true).await;
        f.connector.set_reachable(false);
        assert!(f.store.set_state("k", &json!("v"), None).await);
        assert!(!f.manager.is_connected());
        assert_eq!(f.store.fallback().get("k"), Some("\"v\"".to_string()));
        assert_eq!(f.metrics.counter("state.remote_errors"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn command_error_falls_back_without_disconnect() {
        let f = fixture(true).await;
        f.connector.fail_commands(true);
        assert!(f.store.set_state("k", &json!(7), None).await);
        assert!(f.manager.is_connected());
        // Reads also fail remotely, so the local copy answers.
        assert_eq!(f.store.get_state("k").await, Some(json!(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_remote_value_reads_fallback() {
        let f = fixture(true).await;
        let conn = match f.manager.route() {
            Route::Remote(conn) => conn,
            Route::Local => panic!("expected remote route"),
        };
        conn.set_ex("k", "{not json", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(f.store.get_state("k").await, None);
        assert!(f.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn typed_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Topic {
            title: String,
            votes: u32,
        }

        let f = fixture(false).await;
        let topic = Topic {
            title: "retro".into(),
            votes: 3,
        };
        assert!(f.store.set_typed("topic", &topic, None).await);
        assert_eq!(f.store.get_typed::<Topic>("topic").await, Some(topic));
        assert_eq!(f.store.get_typed::<Vec<u8>>("topic").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn session_helpers_use_session_namespace() {
        let f = fixture(true).await;
        f.store.set_session("abc", &json!({"host": "u1"}), None).await;
        assert!(f.connector.raw_get("session:abc").is_some());
        assert_eq!(
            f.store.get_session("abc").await,
            Some(json!({"host": "u1"}))
        );
        f.store.delete_session("abc").await;
        assert_eq!(f.store.get_session("abc").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn hash_operations_on_fallback() {
        let f = fixture(false).await;
        let ttl = Duration::from_secs(60);
        f.store.hash_upsert("h", "a", "1", ttl).await;
        f.store.hash_upsert("h", "b", "2", ttl).await;
        f.store.hash_upsert("h", "a", "3", ttl).await;
        assert_eq!(
            f.store.hash_values("h").await,
            vec![("b".to_string(), "2".to_string()), ("a".to_string(), "3".to_string())]
        );
        f.store.hash_remove("h", "b").await;
        f.store.hash_remove("h", "missing").await;
        assert_eq!(f.store.hash_values("h").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hash_operations_on_remote_set_expiry() {
        let f = fixture(true).await;
        f.store
            .hash_upsert("h", "a", "1", Duration::from_secs(10))
            .await;
        assert_eq!(f.connector.raw_hash("h").len(), 1);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(f.store.hash_values("h").await.is_empty());
    }
}
