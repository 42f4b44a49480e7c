//! Per-session participant lists, upserted by participant id.

use std::sync::Arc;
use std::time::Duration;

use huddle_core::keys::participants_key;
use huddle_core::{HuddleSettings, ParticipantRecord};
use tracing::warn;

use crate::state::StateStore;

pub struct ParticipantRegistry {
    state: Arc<StateStore>,
    ttl: Duration,
}

impl ParticipantRegistry {
    pub fn new(state: Arc<StateStore>, settings: &HuddleSettings) -> Self {
        Self {
            state,
            ttl: settings.participant_ttl(),
        }
    }

    /// Add `record` to the session, replacing any record with the same id.
    /// The session's list expiry is refreshed on every write.
    pub async fn add_participant(&self, session_id: &str, record: &ParticipantRecord) {
        let payload = match serde_json::to_string(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session_id, participant_id = %record.id, error = %e, "participant not serializable");
                return;
            }
        };
        self.state
            .hash_upsert(&participants_key(session_id), &record.id, &payload, self.ttl)
            .await;
    }

    /// Remove a participant. Unknown ids are ignored.
    pub async fn remove_participant(&self, session_id: &str, participant_id: &str) {
        self.state
            .hash_remove(&participants_key(session_id), participant_id)
            .await;
    }

    /// Current participants. Records that fail to decode are skipped.
    pub async fn get_participants(&self, session_id: &str) -> Vec<ParticipantRecord> {
        self.state
            .hash_values(&participants_key(session_id))
            .await
            .into_iter()
            .filter_map(|(field, payload)| {
                match serde_json::from_str::<ParticipantRecord>(&payload) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(session_id, participant_id = %field, error = %e, "skipping undecodable participant");
                        None
                    }
                }
            })
            .collect()
    }

    pub async fn participant_count(&self, session_id: &str) -> usize {
        self.get_participants(session_id).await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Connector;
    use crate::connection::ConnectionManager;
    use crate::fallback::FallbackStore;
    use crate::mock::MockConnector;
    use huddle_telemetry::MetricsRecorder;
    use serde_json::json;

    async fn registry(reachable: bool) -> (MockConnector, ParticipantRegistry) {
        let connector = MockConnector::new();
        connector.set_reachable(reachable);
        let settings = HuddleSettings::default();
        let metrics = Arc::new(MetricsRecorder::new());
        let manager =
            ConnectionManager::start(Arc::new(connector.clone()), &settings, Arc::clone(&metrics));
        let _ = manager.wait_settled(Duration::from_secs(30)).await;
        let state = Arc::new(StateStore::new(
            manager,
            Arc::new(FallbackStore::new()),
            &settings,
            metrics,
        ));
        (connector, ParticipantRegistry::new(state, &settings))
    }

    fn alice(role: &str) -> ParticipantRecord {
        ParticipantRecord::new("alice").with_field("role", json!(role))
    }

    #[tokio::test(start_paused = true)]
    async fn upsert_by_id_in_fallback() {
        let (_, registry) = registry(false).await;
        registry.add_participant("s1", &alice("guest")).await;
        registry.add_participant("s1", &alice("host")).await;

        let participants = registry.get_participants("s1").await;
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].field("role"), Some(&json!("host")));
    }

    #[tokio::test(start_paused = true)]
    async fn upsert_by_id_remote() {
        let (connector, registry) = registry(true).await;
        registry.add_participant("s1", &alice("guest")).await;
        registry.add_participant("s1", &alice("host")).await;
        registry
            .add_participant("s1", &ParticipantRecord::new("bob"))
            .await;

        assert_eq!(connector.raw_hash("participants:s1").len(), 2);
        assert_eq!(registry.participant_count("s1").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_unknown_is_noop() {
        let (_, registry) = registry(false).await;
        registry.add_participant("s1", &alice("guest")).await;
        registry.remove_participant("s1", "ghost").await;
        assert_eq!(registry.participant_count("s1").await, 1);
        registry.remove_participant("s1", "alice").await;
        assert!(registry.get_participants("s1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_are_isolated() {
        let (_, registry) = registry(false).await;
        registry.add_participant("s1", &alice("guest")).await;
        assert!(registry.get_participants("s2").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn list_expires_after_idle_ttl() {
        let (_, registry) = registry(false).await;
        registry.add_participant("s1", &alice("guest")).await;
        tokio::time::advance(Duration::from_secs(3_000)).await;
        registry
            .add_participant("s1", &ParticipantRecord::new("bob"))
            .await;
        tokio::time::advance(Duration::from_secs(3_000)).await;
        assert_eq!(registry.participant_count("s1").await, 2);
        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(registry.participant_count("s1").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_records_are_skipped() {
        let (connector, registry) = registry(true).await;
        registry.add_participant("s1", &alice("guest")).await;
        let conn = connector.command().await.unwrap();
        conn.hset("participants:s1", "broken", "{oops").await.unwrap();

        let participants = registry.get_participants("s1").await;
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].id, "alice");
    }
}
