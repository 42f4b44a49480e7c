//! Process-wide entry point tying the components together.
//!
//! One [`Backplane`] is built at startup and shared by `Arc`. It owns the
//! connection manager, the fallback store and everything layered on them,
//! plus a housekeeping task that sweeps expired fallback entries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use huddle_core::{BackendError, ConnectivityState, HealthReport, HuddleSettings};
use huddle_telemetry::MetricsRecorder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::Connector;
use crate::broadcast::EventBroadcaster;
use crate::connection::ConnectionManager;
use crate::fallback::FallbackStore;
use crate::health;
use crate::participants::ParticipantRegistry;
use crate::redis::RedisConnector;
use crate::state::StateStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Backplane {
    manager: Arc<ConnectionManager>,
    fallback: Arc<FallbackStore>,
    state: Arc<StateStore>,
    participants: ParticipantRegistry,
    events: EventBroadcaster,
    metrics: Arc<MetricsRecorder>,
    housekeeping: CancellationToken,
    closed: AtomicBool,
}

impl Backplane {
    /// Build every component over `connector` and start connecting.
    pub fn start(
        settings: &HuddleSettings,
        connector: Arc<dyn Connector>,
        metrics: Arc<MetricsRecorder>,
    ) -> Arc<Self> {
        let manager = ConnectionManager::start(connector, settings, Arc::clone(&metrics));
        let fallback = Arc::new(FallbackStore::new());
        let state = Arc::new(StateStore::new(
            Arc::clone(&manager),
            Arc::clone(&fallback),
            settings,
            Arc::clone(&metrics),
        ));
        let participants = ParticipantRegistry::new(Arc::clone(&state), settings);
        let events = EventBroadcaster::new(Arc::clone(&manager), Arc::clone(&metrics));

        let backplane = Arc::new(Self {
            manager,
            fallback,
            state,
            participants,
            events,
            metrics,
            housekeeping: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        backplane.spawn_sweeper();
        backplane
    }

    /// [`Backplane::start`] against the Redis server named in `settings`.
    pub fn connect_redis(
        settings: &HuddleSettings,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Arc<Self>, BackendError> {
        let connector = RedisConnector::from_settings(settings)?;
        Ok(Self::start(settings, Arc::new(connector), metrics))
    }

    /// Wait for the first connect outcome, up to `limit`.
    pub async fn wait_ready(&self, limit: Duration) -> ConnectivityState {
        self.manager.wait_settled(limit).await
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn participants(&self) -> &ParticipantRegistry {
        &self.participants
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn fallback(&self) -> &Arc<FallbackStore> {
        &self.fallback
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub async fn health_check(&self) -> HealthReport {
        health::health_check(&self.manager, &self.fallback).await
    }

    /// Stop reconnecting, cancel subscriptions, close connections and clear
    /// the fallback store. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("backplane already shut down");
            return;
        }
        self.housekeeping.cancel();
        self.events.close();
        self.manager.shutdown();
        let released = self.fallback.len();
        self.fallback.clear();
        self.metrics.set_gauge("fallback.entries", 0);
        info!(released, "backplane shut down");
    }

    /// Alias for [`Backplane::shutdown`].
    pub fn disconnect(&self) {
        self.shutdown();
    }

    fn spawn_sweeper(&self) {
        let fallback = Arc::clone(&self.fallback);
        let metrics = Arc::clone(&self.metrics);
        let token = self.housekeeping.clone();
        drop(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = fallback.purge_expired();
                        let remaining = i64::try_from(fallback.len()).unwrap_or(i64::MAX);
                        metrics.set_gauge("fallback.entries", remaining);
                        if purged > 0 {
                            debug!(purged, remaining, "swept expired fallback entries");
                        }
                    }
                }
            }
        }));
    }
}

impl Drop for Backplane {
    fn drop(&mut self) {
        self.housekeeping.cancel();
    }
}
