//! Negative-lookup cooldown
//!
//! Remembers URIs whose resolution failed recently so repeated lookups
//! short-circuit instead of hammering an unreachable host. Failures are
//! never cached as valid results; an entry only delays the next attempt.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

/// Bounded map of recently failed lookups
pub struct LookupCooldown {
    /// key -> time of the last failure
    entries: RwLock<HashMap<String, Instant>>,
    cooldown: Duration,
    max_tracked_keys: usize,
}

impl LookupCooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self::with_max_tracked_keys(cooldown, DEFAULT_MAX_TRACKED_KEYS)
    }

    /// Create with an explicit in-memory key cap.
    pub fn with_max_tracked_keys(cooldown: Duration, max_tracked_keys: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cooldown,
            max_tracked_keys: max_tracked_keys.max(1),
        }
    }

    fn prune_expired_locked(entries: &mut HashMap<String, Instant>, cooldown: Duration) -> usize {
        let before = entries.len();
        entries.retain(|_, failed_at| failed_at.elapsed() < cooldown);
        before - entries.len()
    }

    fn evict_oldest_locked(entries: &mut HashMap<String, Instant>) {
        let oldest_key = entries
            .iter()
            .min_by_key(|(_, failed_at)| **failed_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest_key {
            entries.remove(&key);
        }
    }

    /// Whether `key` failed within the cooldown window
    pub async fn is_cooling_down(&self, key: &str) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .is_some_and(|failed_at| failed_at.elapsed() < self.cooldown)
    }

    /// Record a failed lookup of `key`
    pub async fn mark_failed(&self, key: &str) {
        let mut entries = self.entries.write().await;

        if !entries.contains_key(key) && entries.len() >= self.max_tracked_keys {
            Self::prune_expired_locked(&mut entries, self.cooldown);
            if entries.len() >= self.max_tracked_keys {
                Self::evict_oldest_locked(&mut entries);
            }
        }

        entries.insert(key.to_string(), Instant::now());
    }

    /// Forget a failure, e.g. after a successful lookup
    pub async fn clear(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }

    /// Prune expired entries
    ///
    /// Called periodically by the staleness sweep.
    pub async fn prune_expired(&self) {
        let mut entries = self.entries.write().await;
        let removed = Self::prune_expired_locked(&mut entries, self.cooldown);

        if removed > 0 {
            tracing::debug!("Pruned {} expired lookup cooldown entries", removed);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
