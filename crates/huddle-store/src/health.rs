//! Backend health probe.

use std::sync::Arc;

use huddle_core::HealthReport;
use tracing::warn;

use crate::connection::{ConnectionManager, Route};
use crate::fallback::FallbackStore;

/// Probe the remote backend with `PING`.
///
/// Healthy only while connected and answering. A failed probe is reported
/// to the connection manager like any other remote failure.
pub async fn health_check(manager: &Arc<ConnectionManager>, fallback: &FallbackStore) -> HealthReport {
    let entries = fallback.len();
    let Route::Remote(conn) = manager.route() else {
        return HealthReport::fallback(manager.state(), entries);
    };
    match conn.ping().await {
        Ok(()) => HealthReport::remote(entries),
        Err(e) => {
            warn!(error = %e, kind = e.error_kind(), "health probe failed");
            manager.report_error("health_check", conn.generation(), &e);
            HealthReport::fallback(manager.state(), entries)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::MockConnector;
    use huddle_core::{BackendMode, ConnectivityState, HealthStatus, HuddleSettings};
    use huddle_telemetry::MetricsRecorder;

    async fn manager(connector: &MockConnector) -> Arc<ConnectionManager> {
        let manager = ConnectionManager::start(
            Arc::new(connector.clone()),
            &HuddleSettings::default(),
            Arc::new(MetricsRecorder::new()),
        );
        let _ = manager.wait_settled(Duration::from_secs(30)).await;
        manager
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_when_connected() {
        let connector = MockConnector::new();
        let manager = manager(&connector).await;
        let report = health_check(&manager, &FallbackStore::new()).await;
        assert_eq!(report.status, HealthStatus::Ok);
        assert_eq!(report.mode, BackendMode::Remote);
        assert!(report.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_in_fallback() {
        let connector = MockConnector::new();
        connector.set_reachable(false);
        let manager = manager(&connector).await;
        let fallback = FallbackStore::new();
        fallback.set("k", "1".into(), Duration::from_secs(60));

        let report = health_check(&manager, &fallback).await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.mode, BackendMode::Fallback);
        assert!(!report.connected);
        assert_eq!(report.state, ConnectivityState::Fallback);
        assert_eq!(report.fallback_entries, 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mode"], "fallback");
        assert_eq!(json["connected"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reports_disconnect() {
        let connector = MockConnector::new();
        let manager = manager(&connector).await;
        connector.set_reachable(false);

        let report = health_check(&manager, &FallbackStore::new()).await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.connected);
        assert!(!manager.is_connected());
    }
}
