// SPDX-License-Identifier: MIT OR Apache-2.0
//! Receipt intake records.

use crate::ids::{BatchId, ExpenseId, IntakeId, ProjectId, UserId};
use crate::receipt::ParsedReceipt;
use crate::status::IntakeStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A receipt or bill upload in flight toward becoming one or more expenses.
///
/// Owned exclusively by the intake queue. The file hash is computed exactly
/// once, at upload; `created_expense_ids` records only expenses that were
/// actually written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeRecord {
    /// Opaque identifier.
    pub id: IntakeId,
    /// Project the receipt belongs to.
    pub project: ProjectId,
    /// Who uploaded the file.
    pub uploader: UserId,
    /// Blob-storage key of the original file.
    pub storage_key: String,
    /// MIME type declared at upload.
    pub mime_type: String,
    /// Hex SHA-256 of the file bytes.
    pub file_hash: String,
    /// Text extracted in fast mode, when any.
    pub extracted_text: Option<String>,
    /// Structured fields produced by OCR, when processing succeeded.
    pub parsed: Option<ParsedReceipt>,
    /// Lifecycle state.
    pub status: IntakeStatus,
    /// Reason recorded with the most recent status change, when any.
    pub status_reason: Option<String>,
    /// Expenses created from this intake, in creation order.
    pub created_expense_ids: Vec<ExpenseId>,
    /// Upload batch this intake arrived in.
    pub batch: Option<BatchId>,
    /// Blob key of a rendered thumbnail, when one was produced.
    pub thumbnail_key: Option<String>,
    /// Reference into the document vault.
    pub vault_ref: Option<String>,
    /// Upload timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent state change.
    pub updated_at: DateTime<Utc>,
}

impl IntakeRecord {
    /// Whether this intake satisfies the linked-state invariant: `linked`
    /// requires a non-empty created-expense set.
    #[must_use]
    pub fn link_invariant_holds(&self) -> bool {
        self.status != IntakeStatus::Linked || !self.created_expense_ids.is_empty()
    }
}
