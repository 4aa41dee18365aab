// SPDX-License-Identifier: MIT OR Apache-2.0
//! The canonical ledger expense and its audit rows.

use crate::fingerprint::description_fingerprint;
use crate::ids::{
    AccountId, BillId, ExpenseId, PaymentMethodId, ProjectId, UserId, VendorId,
};
use crate::money::Money;
use crate::status::{CategorizationSource, ExpenseStatus};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Expense
// ---------------------------------------------------------------------------

/// A single ledger line.
///
/// Owned exclusively by the expense store; every other component holds the
/// id. The `version_token` rotates on every mutation and must be echoed on
/// updates to detect concurrent writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expense {
    /// Opaque identifier.
    pub id: ExpenseId,
    /// Project the expense is booked against.
    pub project: ProjectId,
    /// Transaction date — the single canonical date field.
    pub transaction_date: NaiveDate,
    /// Exact amount, two fractional digits.
    pub amount: Money,
    /// Vendor, when known.
    pub vendor: Option<VendorId>,
    /// Ledger account, when categorized.
    pub account: Option<AccountId>,
    /// Free-text description.
    pub description: String,
    /// Payment method, when known.
    pub payment_method: Option<PaymentMethodId>,
    /// Bill this expense settles, when known.
    pub bill: Option<BillId>,
    /// Identifier carried over from a reference accounting system.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    /// Authorization state.
    pub status: ExpenseStatus,
    /// Who authorized; set only while status is `authorized`.
    pub authorizer: Option<UserId>,
    /// Reason for the most recent status change.
    pub status_reason: Option<String>,
    /// Actor of the most recent mutation. Set on every write.
    pub updated_by: UserId,
    /// Categorization confidence 0–100, when categorized.
    pub confidence: Option<u8>,
    /// Which tier produced the account assignment.
    pub categorization_source: Option<CategorizationSource>,
    /// Opaque concurrency token; rotates on every mutation.
    pub version_token: Uuid,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent mutation.
    pub updated_at: DateTime<Utc>,
}

impl Expense {
    /// The duplicate-detection key for this expense.
    #[must_use]
    pub fn duplicate_key(&self) -> DuplicateKey {
        DuplicateKey {
            project: self.project,
            vendor: self.vendor,
            cents: self.amount.cents(),
            transaction_date: self.transaction_date,
            description_fingerprint: description_fingerprint(&self.description),
        }
    }
}

/// The tuple that no two expenses in status {authorized, pending} may share.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DuplicateKey {
    /// Project scope.
    pub project: ProjectId,
    /// Vendor, if set.
    pub vendor: Option<VendorId>,
    /// Amount rounded to cents.
    pub cents: i64,
    /// Transaction date.
    pub transaction_date: NaiveDate,
    /// Fingerprint of the normalized description.
    pub description_fingerprint: String,
}

// ---------------------------------------------------------------------------
// NewExpense / ExpensePatch
// ---------------------------------------------------------------------------

/// Input for creating an expense. The store fills in id, status, version
/// token, and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExpense {
    /// Project the expense is booked against.
    pub project: ProjectId,
    /// Transaction date.
    pub transaction_date: NaiveDate,
    /// Exact amount.
    pub amount: Money,
    /// Vendor, when known.
    #[serde(default)]
    pub vendor: Option<VendorId>,
    /// Ledger account, when already categorized.
    #[serde(default)]
    pub account: Option<AccountId>,
    /// Free-text description.
    pub description: String,
    /// Payment method.
    #[serde(default)]
    pub payment_method: Option<PaymentMethodId>,
    /// Bill reference.
    #[serde(default)]
    pub bill: Option<BillId>,
    /// Upstream accounting-system reference.
    #[serde(default)]
    pub external_ref: Option<String>,
    /// Categorization confidence, when pre-categorized.
    #[serde(default)]
    pub confidence: Option<u8>,
    /// Categorization source, when pre-categorized.
    #[serde(default)]
    pub categorization_source: Option<CategorizationSource>,
}

/// A partial update. `None` fields are left untouched.
///
/// `expected_version` must match the stored `version_token`; a mismatch is a
/// conflict and nothing is written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpensePatch {
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New amount.
    #[serde(default)]
    pub amount: Option<Money>,
    /// New transaction date.
    #[serde(default)]
    pub transaction_date: Option<NaiveDate>,
    /// New vendor.
    #[serde(default)]
    pub vendor: Option<VendorId>,
    /// New account.
    #[serde(default)]
    pub account: Option<AccountId>,
    /// New payment method.
    #[serde(default)]
    pub payment_method: Option<PaymentMethodId>,
    /// Concurrency token observed by the caller.
    pub expected_version: Uuid,
}

impl ExpensePatch {
    /// Whether the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.amount.is_none()
            && self.transaction_date.is_none()
            && self.vendor.is_none()
            && self.account.is_none()
            && self.payment_method.is_none()
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Filter for listing and summarising expenses. Empty filter matches all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpenseFilter {
    /// Restrict to one project.
    #[serde(default)]
    pub project: Option<ProjectId>,
    /// Inclusive lower bound on transaction date.
    #[serde(default)]
    pub from: Option<NaiveDate>,
    /// Inclusive upper bound on transaction date.
    #[serde(default)]
    pub to: Option<NaiveDate>,
    /// Restrict to one status.
    #[serde(default)]
    pub status: Option<ExpenseStatus>,
    /// Restrict to one vendor.
    #[serde(default)]
    pub vendor: Option<VendorId>,
    /// Restrict to one account.
    #[serde(default)]
    pub account: Option<AccountId>,
}

impl ExpenseFilter {
    /// Whether `expense` satisfies every set predicate.
    #[must_use]
    pub fn matches(&self, expense: &Expense) -> bool {
        if let Some(project) = self.project
            && expense.project != project
        {
            return false;
        }
        if let Some(from) = self.from
            && expense.transaction_date < from
        {
            return false;
        }
        if let Some(to) = self.to
            && expense.transaction_date > to
        {
            return false;
        }
        if let Some(status) = self.status
            && expense.status != status
        {
            return false;
        }
        if let Some(vendor) = self.vendor
            && expense.vendor != Some(vendor)
        {
            return false;
        }
        if let Some(account) = self.account
            && expense.account != Some(account)
        {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Audit rows
// ---------------------------------------------------------------------------

/// Append-only change event: one row per modified field per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogRow {
    /// Row identifier.
    pub id: Uuid,
    /// Expense the change applies to.
    pub expense_id: ExpenseId,
    /// Field name (stable snake_case).
    pub field: String,
    /// Previous value rendered as a string.
    pub old_value: String,
    /// New value rendered as a string.
    pub new_value: String,
    /// Who made the change.
    pub actor: UserId,
    /// When the change was made.
    pub at: DateTime<Utc>,
    /// Expense status at the time of the change.
    pub status_at: ExpenseStatus,
}

/// Append-only status transition event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLogRow {
    /// Row identifier.
    pub id: Uuid,
    /// Expense the transition applies to.
    pub expense_id: ExpenseId,
    /// Status before.
    pub from: ExpenseStatus,
    /// Status after.
    pub to: ExpenseStatus,
    /// Reason, when one was supplied.
    pub reason: Option<String>,
    /// Who made the transition.
    pub actor: UserId,
    /// When the transition was made.
    pub at: DateTime<Utc>,
}
