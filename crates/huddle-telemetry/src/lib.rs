mod metrics;

pub use metrics::{MetricsRecorder, MetricsSnapshot};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "huddle_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build a config from a textual level ("debug", "warn", ...).
    /// Unknown levels fall back to INFO.
    pub fn from_level_str(level: &str, json: bool) -> Self {
        Self {
            log_level: level.parse().unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json,
        }
    }

    /// Add per-module levels from a `module=level,...` list. Entries that
    /// are malformed or name an unknown level are skipped.
    pub fn with_module_levels(mut self, spec: &str) -> Self {
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((module, level)) = entry.split_once('=') else {
                continue;
            };
            let module = module.trim();
            match level.trim().parse::<Level>() {
                Ok(level) if !module.is_empty() => {
                    self.module_levels.push((module.to_string(), level))
                }
                _ => {}
            }
        }
        self
    }

    fn filter_directive(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Handle returned by [`init_telemetry`]. Owns the shared metrics recorder.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    /// Shared metrics recorder for components to count into.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    // A second init (tests, embedding) keeps the first subscriber.
    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
    {
        eprintln!("huddle-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_includes_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("huddle_store".into(), Level::DEBUG)],
            json: true,
        };
        assert_eq!(config.filter_directive(), "warn,huddle_store=debug");
    }

    #[test]
    fn module_levels_parsed_from_list() {
        let config = TelemetryConfig::from_level_str("info", false)
            .with_module_levels("huddle_store=debug, redis=WARN");
        assert_eq!(config.filter_directive(), "info,huddle_store=debug,redis=warn");
    }

    #[test]
    fn malformed_module_levels_skipped() {
        let config = TelemetryConfig::from_level_str("info", false)
            .with_module_levels("huddle_store,=debug,redis=chatty,,tokio=trace");
        assert_eq!(config.module_levels, vec![("tokio".to_string(), Level::TRACE)]);
    }

    #[test]
    fn level_string_parsing() {
        assert_eq!(TelemetryConfig::from_level_str("debug", false).log_level, Level::DEBUG);
        assert_eq!(TelemetryConfig::from_level_str("WARN", false).log_level, Level::WARN);
        assert_eq!(TelemetryConfig::from_level_str("chatty", false).log_level, Level::INFO);
    }

    #[test]
    fn init_twice_is_harmless() {
        let first = init_telemetry(TelemetryConfig::default());
        let second = init_telemetry(TelemetryConfig::default());
        first.metrics().increment("a", 1);
        assert_eq!(second.metrics().counter("a"), 0);
    }
}
