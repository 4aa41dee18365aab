// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-autoauth
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The rule engine.
pub mod engine;
/// Vendor-name similarity.
pub mod fuzzy;
/// Decision records, reports, and master-data seams.
pub mod report;

pub use engine::{AutoAuthEngine, rules};
pub use fuzzy::{levenshtein_distance, vendor_similarity};
pub use report::{
    AuthReport, BillProvider, BillRecord, Decision, DecisionRecord, InMemoryBillProvider,
    InMemoryVendorDirectory, VendorDirectory,
};
