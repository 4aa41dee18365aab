// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable domain contract for SiteLedger.

/// Expense records, patches, filters, and audit rows.
pub mod expense;
/// Description normalization and content fingerprints.
pub mod fingerprint;
/// Entity identifiers.
pub mod ids;
/// Receipt-intake records.
pub mod intake;
/// Fixed-point money.
pub mod money;
/// Pagination primitives.
pub mod page;
/// Parsed receipt records produced by OCR.
pub mod receipt;
/// Status enums and their transition tables.
pub mod status;

pub use expense::{
    ChangeLogRow, DuplicateKey, Expense, ExpenseFilter, ExpensePatch, NewExpense, StatusLogRow,
};
pub use fingerprint::{description_fingerprint, fingerprint, normalize_description};
pub use ids::{
    AccountId, BatchId, BillId, ChannelKey, ExpenseId, IntakeId, JobId, MessageId,
    PaymentMethodId, ProjectId, ReportId, UserId, VendorId,
};
pub use intake::IntakeRecord;
pub use money::{Money, MoneyError};
pub use page::{Page, PageRequest};
pub use receipt::{LineItem, ParsedReceipt, ReceiptConfidence, TotalMatchType};
pub use status::{CategorizationSource, ExpenseStatus, IntakeStatus};
