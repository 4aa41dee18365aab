// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-categorize
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Vendor-account affinity index.
pub mod affinity;
/// Content-addressed categorization cache.
pub mod cache;
/// N-gram classifier over historical assignments.
pub mod classifier;
/// The escalation engine.
pub mod engine;

pub use affinity::{AffinityIndex, AffinityRow};
pub use cache::{CacheEntry, CategorizationCache};
pub use classifier::{Classifier, TrainingExample};
pub use engine::{
    AccountRef, CategorizationEngine, CategorizeRow, Correction, RowResult, RowWarning,
};
