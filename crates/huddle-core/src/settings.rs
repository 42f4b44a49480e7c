//! Settings loading with environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HuddleSettings::default()`]
//! 2. Apply environment variable overrides (`HUDDLE_*`, plus the bare
//!    `REDIS_URL` / `REDIS_PASSWORD` names)
//! 3. Validate
//!
//! Malformed numeric or boolean overrides are logged and ignored.

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::SettingsError;

/// Settings for the state/messaging layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HuddleSettings {
    /// Remote backend URL (`redis://`, `rediss://` or `unix://`).
    pub redis_url: String,
    /// Backend credential. Never serialized.
    #[serde(skip)]
    pub redis_password: Option<SecretString>,
    /// Reconnect attempts before settling into fallback mode.
    pub max_retries: u32,
    /// Bound on establishing each connection.
    pub connect_timeout_secs: u64,
    /// Backoff grows by this much per failed attempt.
    pub retry_step_ms: u64,
    /// Backoff ceiling.
    pub retry_cap_ms: u64,
    /// TTL applied when `set_state` is called without one.
    pub default_state_ttl_secs: u64,
    /// TTL refreshed on every participant write.
    pub participant_ttl_secs: u64,
    pub log_level: String,
    /// Per-module levels, e.g. `huddle_store=debug,redis=warn`.
    pub log_modules: String,
    pub log_json: bool,
}

impl Default for HuddleSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".into(),
            redis_password: None,
            max_retries: 5,
            connect_timeout_secs: 60,
            retry_step_ms: 100,
            retry_cap_ms: 3_000,
            default_state_ttl_secs: 3_600,
            participant_ttl_secs: 3_600,
            log_level: "info".into(),
            log_modules: String::new(),
            log_json: false,
        }
    }
}

impl HuddleSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_step(&self) -> Duration {
        Duration::from_millis(self.retry_step_ms)
    }

    pub fn retry_cap(&self) -> Duration {
        Duration::from_millis(self.retry_cap_ms)
    }

    pub fn default_state_ttl(&self) -> Duration {
        Duration::from_secs(self.default_state_ttl_secs)
    }

    pub fn participant_ttl(&self) -> Duration {
        Duration::from_secs(self.participant_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let scheme_ok = ["redis://", "rediss://", "unix://", "redis+unix://"]
            .iter()
            .any(|scheme| self.redis_url.starts_with(scheme));
        if !scheme_ok {
            return Err(SettingsError::InvalidValue {
                key: "redis_url",
                reason: format!("unsupported scheme in {:?}", self.redis_url),
            });
        }
        if self.retry_step_ms == 0 {
            return Err(SettingsError::InvalidValue {
                key: "retry_step_ms",
                reason: "must be positive".into(),
            });
        }
        if self.retry_cap_ms < self.retry_step_ms {
            return Err(SettingsError::InvalidValue {
                key: "retry_cap_ms",
                reason: format!(
                    "cap {}ms is below step {}ms",
                    self.retry_cap_ms, self.retry_step_ms
                ),
            });
        }
        Ok(())
    }
}

/// Load settings from defaults plus the process environment.
pub fn load_settings() -> Result<HuddleSettings, SettingsError> {
    load_settings_with(|name| std::env::var(name).ok())
}

/// Load settings using an arbitrary variable lookup.
pub fn load_settings_with<F>(lookup: F) -> Result<HuddleSettings, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = HuddleSettings::default();
    apply_env_overrides(&mut settings, &lookup);
    settings.validate()?;
    Ok(settings)
}

fn apply_env_overrides<F>(settings: &mut HuddleSettings, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    // ── Backend ─────────────────────────────────────────────────────
    if let Some(v) = read_string(lookup, "HUDDLE_REDIS_URL").or_else(|| read_string(lookup, "REDIS_URL")) {
        settings.redis_url = v;
    }
    if let Some(v) =
        read_string(lookup, "HUDDLE_REDIS_PASSWORD").or_else(|| read_string(lookup, "REDIS_PASSWORD"))
    {
        settings.redis_password = Some(SecretString::from(v));
    }

    // ── Retry / timeouts ────────────────────────────────────────────
    if let Some(v) = read_u64(lookup, "HUDDLE_MAX_RETRIES", 0, 100) {
        settings.max_retries = v as u32;
    }
    if let Some(v) = read_u64(lookup, "HUDDLE_CONNECT_TIMEOUT_SECS", 1, 600) {
        settings.connect_timeout_secs = v;
    }
    if let Some(v) = read_u64(lookup, "HUDDLE_RETRY_STEP_MS", 1, 60_000) {
        settings.retry_step_ms = v;
    }
    if let Some(v) = read_u64(lookup, "HUDDLE_RETRY_CAP_MS", 1, 600_000) {
        settings.retry_cap_ms = v;
    }

    // ── TTLs ────────────────────────────────────────────────────────
    if let Some(v) = read_u64(lookup, "HUDDLE_STATE_TTL_SECS", 1, 30 * 86_400) {
        settings.default_state_ttl_secs = v;
    }
    if let Some(v) = read_u64(lookup, "HUDDLE_PARTICIPANT_TTL_SECS", 1, 30 * 86_400) {
        settings.participant_ttl_secs = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_string(lookup, "HUDDLE_LOG_LEVEL") {
        settings.log_level = v;
    }
    if let Some(v) = read_string(lookup, "HUDDLE_LOG_MODULES") {
        settings.log_modules = v;
    }
    if let Some(v) = read_bool(lookup, "HUDDLE_LOG_JSON") {
        settings.log_json = v;
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

fn read_string<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).filter(|v| !v.is_empty())
}

fn read_bool<F>(lookup: &F, name: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let val = lookup(name)?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_u64<F>(lookup: &F, name: &str, min: u64, max: u64) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let val = lookup(name)?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
    }
    result
}
