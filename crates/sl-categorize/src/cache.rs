// SPDX-License-Identifier: MIT OR Apache-2.0
//! The content-addressed categorization cache.
//!
//! Keys are description fingerprints with the stage token baked in. Entries
//! expire 30 days after their last use, so hot keys survive the sweep.
//! Writes are best-effort: a racing insert on the same fingerprint is a
//! success, not a conflict.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sl_core::{AccountId, VendorId};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// One cached categorization decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Row identifier.
    pub id: Uuid,
    /// The fingerprint key.
    pub fingerprint: String,
    /// Stage token the fingerprint was computed with.
    pub stage: String,
    /// The decided account.
    pub account: AccountId,
    /// Account display name at decision time.
    pub account_name: String,
    /// Confidence of the original decision.
    pub confidence: u8,
    /// Reasoning text from the original decision.
    pub reasoning: String,
    /// Vendor of the expense that populated the entry, when known.
    pub vendor: Option<VendorId>,
    /// How often the entry has answered a lookup.
    pub hit_count: u64,
    /// When the entry was inserted.
    pub created_at: DateTime<Utc>,
    /// When the entry last answered a lookup.
    pub last_used_at: DateTime<Utc>,
}

/// The cache. Clone-free; share behind an `Arc`.
#[derive(Debug)]
pub struct CategorizationCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CategorizationCache {
    /// Create a cache whose entries live `ttl_days` after last use.
    #[must_use]
    pub fn new(ttl_days: i64) -> Self {
        Self {
            ttl: Duration::days(ttl_days.max(1)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a fingerprint. Expired entries are misses.
    #[must_use]
    pub fn lookup(&self, fingerprint: &str) -> Option<CacheEntry> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        let entry = entries.get(fingerprint)?;
        if Utc::now() - entry.last_used_at > self.ttl {
            return None;
        }
        Some(entry.clone())
    }

    /// Record a lookup hit: bump the hit count and refresh last-used.
    pub fn touch(&self, fingerprint: &str) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(entry) = entries.get_mut(fingerprint) {
            entry.hit_count += 1;
            entry.last_used_at = Utc::now();
        }
    }

    /// Insert a decision.
    ///
    /// When the fingerprint is already present (a parallel lookup raced this
    /// insert), the existing entry wins and the call still succeeds.
    pub fn insert(
        &self,
        fingerprint: &str,
        stage: &str,
        account: AccountId,
        account_name: &str,
        confidence: u8,
        reasoning: &str,
        vendor: Option<VendorId>,
    ) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if entries.contains_key(fingerprint) {
            debug!(fingerprint, "cache insert collision treated as success");
            return;
        }
        let now = Utc::now();
        entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                id: Uuid::new_v4(),
                fingerprint: fingerprint.to_string(),
                stage: stage.to_string(),
                account,
                account_name: account_name.to_string(),
                confidence,
                reasoning: reasoning.to_string(),
                vendor,
                hit_count: 0,
                created_at: now,
                last_used_at: now,
            },
        );
    }

    /// Remove entries whose last use is beyond the TTL. Returns the number
    /// removed.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now() - self.ttl;
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.last_used_at >= cutoff);
        before - entries.len()
    }

    /// Drop every entry populated from the given vendor. Returns the number
    /// removed.
    pub fn invalidate_vendor(&self, vendor: VendorId) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.vendor != Some(vendor));
        before - entries.len()
    }

    /// Number of live entries (including not-yet-swept expired ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn backdate(&self, fingerprint: &str, last_used: DateTime<Utc>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(entry) = entries.get_mut(fingerprint) {
            entry.last_used_at = last_used;
        }
    }
}
