use serde::{Deserialize, Serialize};

/// Connectivity of the remote backend, owned by the connection manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    /// Not connected; an attempt is running or scheduled.
    Connecting,
    /// Command, publish and subscribe connections are open.
    Connected,
    /// Retry budget exhausted or shut down. Stays here until restart.
    Fallback,
}

impl ConnectivityState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Fallback => "fallback",
        }
    }
}

/// Which backend is serving operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    Remote,
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

/// Result of a health probe.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub mode: BackendMode,
    pub connected: bool,
    pub state: ConnectivityState,
    /// Live entries currently held by the in-process store.
    pub fallback_entries: usize,
}

impl HealthReport {
    pub fn remote(fallback_entries: usize) -> Self {
        Self {
            status: HealthStatus::Ok,
            mode: BackendMode::Remote,
            connected: true,
            state: ConnectivityState::Connected,
            fallback_entries,
        }
    }

    pub fn fallback(state: ConnectivityState, fallback_entries: usize) -> Self {
        Self {
            status: HealthStatus::Degraded,
            mode: BackendMode::Fallback,
            connected: false,
            state,
            fallback_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connected_is_connected() {
        assert!(ConnectivityState::Connected.is_connected());
        assert!(!ConnectivityState::Connecting.is_connected());
        assert!(!ConnectivityState::Fallback.is_connected());
    }

    #[test]
    fn fallback_report_serialization() {
        let report = HealthReport::fallback(ConnectivityState::Connecting, 3);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["mode"], "fallback");
        assert_eq!(json["connected"], false);
        assert_eq!(json["state"], "connecting");
        assert_eq!(json["fallback_entries"], 3);
    }

    #[test]
    fn remote_report_serialization() {
        let json = serde_json::to_value(HealthReport::remote(0)).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["mode"], "remote");
        assert_eq!(json["connected"], true);
    }
}
