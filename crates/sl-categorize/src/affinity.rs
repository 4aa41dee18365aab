// SPDX-License-Identifier: MIT OR Apache-2.0
//! The vendor-account affinity index.
//!
//! Per vendor, a histogram over account assignments rebuilt from the source
//! of truth on every qualifying write. The dominant-account rule answers
//! only when support and ratio thresholds are both met — correctness beats
//! speed because per-vendor volume is small.

use serde::{Deserialize, Serialize};
use sl_core::{AccountId, VendorId};
use std::collections::HashMap;
use std::sync::Mutex;

/// Minimum assignments of a (vendor, account) pair before it can dominate.
pub const MIN_COUNT: u64 = 5;

/// Minimum share of the vendor's assignments for dominance.
pub const MIN_RATIO: f64 = 0.90;

/// One (vendor, account) histogram row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityRow {
    /// The vendor.
    pub vendor: VendorId,
    /// The account.
    pub account: AccountId,
    /// Assignments of this account for this vendor.
    pub count: u64,
    /// Total assignments across all accounts for this vendor.
    pub vendor_total: u64,
    /// `count / vendor_total`.
    pub ratio: f64,
}

/// The index. Share behind an `Arc`.
#[derive(Debug, Default)]
pub struct AffinityIndex {
    histograms: Mutex<HashMap<VendorId, HashMap<AccountId, u64>>>,
}

impl AffinityIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a vendor's histogram with a fresh scan of its account
    /// assignments.
    ///
    /// Callers pass every (account) assignment currently on file for the
    /// vendor; no partial updates, so late edits are tolerated by
    /// construction.
    pub fn recompute(&self, vendor: VendorId, assignments: impl IntoIterator<Item = AccountId>) {
        let mut histogram: HashMap<AccountId, u64> = HashMap::new();
        for account in assignments {
            *histogram.entry(account).or_insert(0) += 1;
        }
        let mut histograms = self.histograms.lock().expect("affinity lock poisoned");
        if histogram.is_empty() {
            histograms.remove(&vendor);
        } else {
            histograms.insert(vendor, histogram);
        }
    }

    /// The dominant account for a vendor, when one exists: count ≥ 5 and
    /// ratio ≥ 0.90.
    #[must_use]
    pub fn dominant_account(&self, vendor: VendorId) -> Option<AffinityRow> {
        let histograms = self.histograms.lock().expect("affinity lock poisoned");
        let histogram = histograms.get(&vendor)?;
        let vendor_total: u64 = histogram.values().sum();
        if vendor_total == 0 {
            return None;
        }
        let (account, count) = histogram
            .iter()
            .max_by_key(|(account, count)| (**count, *account))
            .map(|(account, count)| (*account, *count))?;
        let ratio = count as f64 / vendor_total as f64;
        (count >= MIN_COUNT && ratio >= MIN_RATIO).then_some(AffinityRow {
            vendor,
            account,
            count,
            vendor_total,
            ratio,
        })
    }

    /// All rows for a vendor, for diagnostics.
    #[must_use]
    pub fn rows(&self, vendor: VendorId) -> Vec<AffinityRow> {
        let histograms = self.histograms.lock().expect("affinity lock poisoned");
        let Some(histogram) = histograms.get(&vendor) else {
            return Vec::new();
        };
        let vendor_total: u64 = histogram.values().sum();
        let mut rows: Vec<AffinityRow> = histogram
            .iter()
            .map(|(account, count)| AffinityRow {
                vendor,
                account: *account,
                count: *count,
                vendor_total,
                ratio: *count as f64 / vendor_total as f64,
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then(a.account.cmp(&b.account)));
        rows
    }
}
