//! TTL-bounded manifest cache keyed by scenario name.
//!
//! Lookups take the read lock, updates and evictions the write lock.
//! Expired entries report a miss but stay in place until replaced or
//! invalidated. There is no size bound: one entry per peer scenario.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::manifest::ToolManifest;

#[derive(Debug, Clone)]
pub struct CachedManifest {
    pub manifest: Arc<ToolManifest>,
    pub fetched_at: Instant,
}

impl CachedManifest {
    fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) <= ttl
    }
}

#[derive(Debug)]
pub struct ManifestCache {
    entries: RwLock<HashMap<String, CachedManifest>>,
    ttl: Duration,
}

impl ManifestCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh manifest for `scenario`, or `None` on miss or expiry.
    pub fn get(&self, scenario: &str) -> Option<Arc<ToolManifest>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(scenario)
            .filter(|entry| entry.is_fresh(self.ttl, Instant::now()))
            .map(|entry| entry.manifest.clone())
    }

    /// Store `manifest`, stamping `fetched_at` now.
    pub fn set(&self, scenario: &str, manifest: Arc<ToolManifest>) {
        let entry = CachedManifest {
            manifest,
            fetched_at: Instant::now(),
        };
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scenario.to_string(), entry);
    }

    pub fn invalidate(&self, scenario: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(scenario);
    }

    pub fn invalidate_all(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of stored entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
