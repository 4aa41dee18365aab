// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-store
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Deferred audit-row job handler.
pub mod audit;
/// The expense store itself.
pub mod store;
/// Summary aggregation.
pub mod summary;

pub use audit::AuditJobHandler;
pub use store::{AuditMode, AuditReconciliation, EngineMark, ExpenseStore, OverrideRow};
pub use summary::{SummaryGroupBy, SummaryReport, SummaryRow};
