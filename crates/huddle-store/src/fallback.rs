//! In-process expiring map used while the remote backend is unavailable.
//!
//! Expiry is passive: an entry past its deadline is removed by the read that
//! observes it. [`FallbackStore::purge_expired`] sweeps the rest.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::backend::effective_ttl;

#[derive(Debug)]
enum FallbackValue {
    /// Serialized state payload.
    Payload(String),
    /// Field/payload pairs in insertion order (hash stand-in).
    Fields(Vec<(String, String)>),
}

#[derive(Debug)]
struct FallbackEntry {
    value: FallbackValue,
    expires_at: Instant,
}

impl FallbackEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

fn deadline(now: Instant, ttl: Duration) -> Instant {
    now + effective_ttl(ttl)
}

/// Concurrent map of expiring entries.
///
/// Per-key operations run under that key's shard lock, so a field
/// remove-then-insert is atomic with respect to other writers of the same key.
#[derive(Debug, Default)]
pub struct FallbackStore {
    entries: DashMap<String, FallbackEntry>,
}

impl FallbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a payload, replacing whatever the key held.
    pub fn set(&self, key: &str, payload: String, ttl: Duration) {
        let entry = FallbackEntry {
            value: FallbackValue::Payload(payload),
            expires_at: deadline(Instant::now(), ttl),
        };
        let _ = self.entries.insert(key.to_string(), entry);
    }

    /// Read a payload. Expired entries are deleted and reported absent.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => {
                return match &entry.value {
                    FallbackValue::Payload(payload) => Some(payload.clone()),
                    FallbackValue::Fields(_) => None,
                };
            }
            Some(_) => true,
        };
        if expired {
            let _ = self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        None
    }

    /// Delete a key. Returns whether a live entry was removed.
    pub fn remove(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now))
    }

    /// Replace `field` in the keyed collection: any pair with the same field
    /// is dropped, then the new pair is appended. Refreshes the key's expiry.
    pub fn upsert_field(&self, key: &str, field: &str, payload: String, ttl: Duration) {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| FallbackEntry {
                value: FallbackValue::Fields(Vec::new()),
                expires_at: deadline(now, ttl),
            });
        if entry.is_expired(now) || !matches!(entry.value, FallbackValue::Fields(_)) {
            entry.value = FallbackValue::Fields(Vec::new());
        }
        if let FallbackValue::Fields(fields) = &mut entry.value {
            fields.retain(|(existing, _)| existing != field);
            fields.push((field.to_string(), payload));
        }
        entry.expires_at = deadline(now, ttl);
    }

    /// Drop `field` from the keyed collection. Absent fields are a no-op.
    /// Returns whether a pair was removed.
    pub fn remove_field(&self, key: &str, field: &str) -> bool {
        let now = Instant::now();
        let mut removed = false;
        let mut drop_key = false;
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_expired(now) {
                drop_key = true;
            } else if let FallbackValue::Fields(fields) = &mut entry.value {
                let before = fields.len();
                fields.retain(|(existing, _)| existing != field);
                removed = fields.len() != before;
                drop_key = fields.is_empty();
            }
        }
        if drop_key {
            let _ = self.entries.remove_if(key, |_, entry| match &entry.value {
                FallbackValue::Fields(fields) => fields.is_empty() || entry.is_expired(now),
                FallbackValue::Payload(_) => entry.is_expired(now),
            });
        }
        removed
    }

    /// Payloads of the keyed collection in insertion order.
    pub fn field_values(&self, key: &str) -> Vec<String> {
        self.field_entries(key)
            .into_iter()
            .map(|(_, payload)| payload)
            .collect()
    }

    /// Field/payload pairs of the keyed collection in insertion order.
    pub fn field_entries(&self, key: &str) -> Vec<(String, String)> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            None => return Vec::new(),
            Some(entry) if !entry.is_expired(now) => {
                return match &entry.value {
                    FallbackValue::Fields(fields) => fields.clone(),
                    FallbackValue::Payload(_) => Vec::new(),
                };
            }
            Some(_) => true,
        };
        if expired {
            let _ = self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Vec::new()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Release every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
