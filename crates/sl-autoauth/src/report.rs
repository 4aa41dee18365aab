// SPDX-License-Identifier: MIT OR Apache-2.0
//! Decision records and run reports.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sl_core::{BillId, ExpenseId, Money, ProjectId, ReportId, VendorId};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// What the engine decided for one expense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The expense was authorized.
    Authorized,
    /// A duplicate already exists; no mutation.
    Duplicate,
    /// Required fields are missing; a prompt was emitted.
    MissingInfo,
    /// Escalated to a human; no mutation.
    Escalated,
}

/// One engine decision, captured inside the run's report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// The expense decided on.
    pub expense_id: ExpenseId,
    /// Stable identifier of the rule that matched.
    pub rule: String,
    /// The decision.
    pub decision: Decision,
    /// Human-readable reason.
    pub reason: String,
    /// The amount considered.
    pub amount: Money,
    /// Fields found missing, for `missing_info` decisions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
    /// A concurrent actor won the conditional update; the row was left
    /// alone.
    #[serde(default)]
    pub skipped_race: bool,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

/// The append-only artifact of one engine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthReport {
    /// Report id.
    pub id: ReportId,
    /// Caller-supplied run id; repeated run ids never produce a second
    /// digest.
    pub run_id: Uuid,
    /// The project scanned.
    pub project: ProjectId,
    /// Expenses scanned.
    pub scanned: usize,
    /// All decisions, in scan order.
    pub decisions: Vec<DecisionRecord>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl AuthReport {
    /// Count decisions of one kind.
    #[must_use]
    pub fn count(&self, decision: Decision) -> usize {
        self.decisions
            .iter()
            .filter(|d| d.decision == decision && !d.skipped_race)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Bills (external master data)
// ---------------------------------------------------------------------------

/// A bill row from the reference accounting system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillRecord {
    /// Bill id.
    pub id: BillId,
    /// Vendor id, when mapped.
    pub vendor: Option<VendorId>,
    /// Vendor name as imported.
    pub vendor_name: Option<String>,
    /// Bill amount.
    pub amount: Money,
    /// Bill date.
    pub date: NaiveDate,
    /// Expense this bill references directly, when any.
    pub expense_ref: Option<ExpenseId>,
}

/// Read-only access to imported bills.
#[async_trait]
pub trait BillProvider: Send + Sync {
    /// Bills for one project.
    async fn bills_for_project(&self, project: ProjectId) -> Vec<BillRecord>;
}

/// In-memory provider for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryBillProvider {
    bills: Mutex<HashMap<ProjectId, Vec<BillRecord>>>,
}

impl InMemoryBillProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bill.
    pub fn add(&self, project: ProjectId, bill: BillRecord) {
        self.bills
            .lock()
            .expect("bill provider lock poisoned")
            .entry(project)
            .or_default()
            .push(bill);
    }
}

#[async_trait]
impl BillProvider for InMemoryBillProvider {
    async fn bills_for_project(&self, project: ProjectId) -> Vec<BillRecord> {
        self.bills
            .lock()
            .expect("bill provider lock poisoned")
            .get(&project)
            .cloned()
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Vendor names (external master data)
// ---------------------------------------------------------------------------

/// Read-only vendor-name lookup, for fuzzy bill matching.
#[async_trait]
pub trait VendorDirectory: Send + Sync {
    /// The display name of a vendor.
    async fn name_of(&self, vendor: VendorId) -> Option<String>;
}

/// In-memory directory for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryVendorDirectory {
    names: Mutex<HashMap<VendorId, String>>,
}

impl InMemoryVendorDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a vendor name.
    pub fn add(&self, vendor: VendorId, name: &str) {
        self.names
            .lock()
            .expect("vendor directory lock poisoned")
            .insert(vendor, name.to_string());
    }
}

#[async_trait]
impl VendorDirectory for InMemoryVendorDirectory {
    async fn name_of(&self, vendor: VendorId) -> Option<String> {
        self.names
            .lock()
            .expect("vendor directory lock poisoned")
            .get(&vendor)
            .cloned()
    }
}
