// SPDX-License-Identifier: MIT OR Apache-2.0
//! The canonical expense store.
//!
//! Single owner of expense rows and their audit trails. All mutations go
//! through the compare-and-set version token; status transitions are
//! validated against the transition table and logged in the same unit of
//! work. Field-level change rows are written inline by default, or deferred
//! through the background orchestrator.

use chrono::Utc;
use serde_json::json;
use sl_auth::{Action, CapabilityGate, Module, Role};
use sl_core::{
    ChangeLogRow, DuplicateKey, Expense, ExpenseFilter, ExpenseId, ExpensePatch, ExpenseStatus,
    Money, NewExpense, Page, PageRequest, StatusLogRow, UserId,
};
use sl_error::{CoreError, CoreResult};
use sl_jobs::{JobKind, JobQueue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Audit mode
// ---------------------------------------------------------------------------

/// How field-level change rows are written.
///
/// Status-log rows are always written in the same unit of work as the
/// mutation regardless of mode.
#[derive(Clone)]
pub enum AuditMode {
    /// Change rows land inside the mutating call.
    Inline,
    /// Change rows are enqueued as `write_change_log` jobs; a failed write
    /// is logged but never undoes the commit.
    Deferred(JobQueue),
}

// ---------------------------------------------------------------------------
// Engine marks and overrides
// ---------------------------------------------------------------------------

/// Marker left on an expense the auto-auth engine acted on, for override
/// capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMark {
    /// The rule that produced the engine's decision.
    pub rule: String,
    /// The status the engine set.
    pub engine_status: ExpenseStatus,
}

/// A human action that revised an engine decision.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OverrideRow {
    /// The expense.
    pub expense_id: ExpenseId,
    /// The rule the engine had matched.
    pub rule: String,
    /// The status the engine had set.
    pub engine_status: ExpenseStatus,
    /// The status the human set.
    pub new_status: ExpenseStatus,
    /// The human actor.
    pub actor: UserId,
    /// When the override happened.
    pub at: chrono::DateTime<Utc>,
}

/// Report of expenses whose recorded mutations exceed their change rows.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditReconciliation {
    /// Expenses with missing change rows and the size of the gap.
    pub gaps: Vec<(ExpenseId, u64)>,
}

// ---------------------------------------------------------------------------
// Store internals
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    expenses: HashMap<ExpenseId, Expense>,
    change_log: Vec<ChangeLogRow>,
    status_log: Vec<StatusLogRow>,
    overrides: Vec<OverrideRow>,
    engine_marks: HashMap<ExpenseId, EngineMark>,
    /// Field-mutation count per expense, for audit reconciliation.
    mutation_counts: HashMap<ExpenseId, u64>,
    /// Idempotency key → ids returned by the original batch create.
    batch_keys: HashMap<String, Vec<ExpenseId>>,
}

/// The expense store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ExpenseStore {
    gate: Arc<CapabilityGate>,
    inner: Arc<RwLock<Inner>>,
    audit: AuditMode,
}

impl ExpenseStore {
    /// Create a store with inline audit writes.
    #[must_use]
    pub fn new(gate: Arc<CapabilityGate>) -> Self {
        Self {
            gate,
            inner: Arc::new(RwLock::new(Inner::default())),
            audit: AuditMode::Inline,
        }
    }

    /// Create a store that defers change rows through the given queue.
    #[must_use]
    pub fn with_audit_queue(gate: Arc<CapabilityGate>, queue: JobQueue) -> Self {
        Self {
            gate,
            inner: Arc::new(RwLock::new(Inner::default())),
            audit: AuditMode::Deferred(queue),
        }
    }

    async fn require(&self, actor: UserId, action: Action) -> CoreResult<()> {
        if self.gate.capability(actor, Module::Expenses, action).await {
            Ok(())
        } else {
            Err(CoreError::unauthorized(format!(
                "user {actor} lacks Expenses.{action:?}"
            )))
        }
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    /// Insert one expense in status `pending`.
    pub async fn create(&self, actor: UserId, new: NewExpense) -> CoreResult<ExpenseId> {
        let ids = self.create_batch(actor, vec![new], None).await?;
        Ok(ids[0])
    }

    /// Insert a batch atomically: either every row lands or none does.
    ///
    /// A repeated `idempotency_key` returns the ids from the original call
    /// without writing anything.
    pub async fn create_batch(
        &self,
        actor: UserId,
        rows: Vec<NewExpense>,
        idempotency_key: Option<String>,
    ) -> CoreResult<Vec<ExpenseId>> {
        self.require(actor, Action::Create).await?;
        if rows.is_empty() {
            return Err(CoreError::validation("batch is empty"));
        }

        let mut inner = self.inner.write().await;

        if let Some(ref key) = idempotency_key
            && let Some(existing) = inner.batch_keys.get(key)
        {
            return Ok(existing.clone());
        }

        // Validate every row before writing any.
        let mut row_errors = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            if let Err(message) = validate_new(row) {
                row_errors.push(json!({ "index": index, "message": message }));
            }
        }
        if !row_errors.is_empty() {
            return Err(
                CoreError::validation("batch contains invalid rows")
                    .with_context("row_errors", row_errors),
            );
        }

        // Duplicate-pair check against existing rows and within the batch.
        let mut batch_keys_seen: Vec<DuplicateKey> = Vec::new();
        let now = Utc::now();
        let mut staged: Vec<Expense> = Vec::with_capacity(rows.len());
        for row in rows {
            let expense = Expense {
                id: ExpenseId::new(),
                project: row.project,
                transaction_date: row.transaction_date,
                amount: row.amount,
                vendor: row.vendor,
                account: row.account,
                description: row.description,
                payment_method: row.payment_method,
                bill: row.bill,
                external_ref: row.external_ref,
                status: ExpenseStatus::Pending,
                authorizer: None,
                status_reason: None,
                updated_by: actor,
                confidence: row.confidence,
                categorization_source: row.categorization_source,
                version_token: Uuid::new_v4(),
                created_at: now,
                updated_at: now,
            };
            let key = expense.duplicate_key();
            if batch_keys_seen.contains(&key)
                || find_duplicate_in(&inner.expenses, &key, None).is_some()
            {
                return Err(CoreError::conflict("duplicate expense")
                    .with_context("description", expense.description.clone())
                    .with_context("amount", expense.amount.to_string()));
            }
            batch_keys_seen.push(key);
            staged.push(expense);
        }

        let ids: Vec<ExpenseId> = staged.iter().map(|e| e.id).collect();
        for expense in staged {
            inner.mutation_counts.insert(expense.id, 0);
            inner.expenses.insert(expense.id, expense);
        }
        if let Some(key) = idempotency_key {
            inner.batch_keys.insert(key, ids.clone());
        }
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    /// Fetch one expense.
    pub async fn get(&self, actor: UserId, id: ExpenseId) -> CoreResult<Expense> {
        self.require(actor, Action::Read).await?;
        let inner = self.inner.read().await;
        inner
            .expenses
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("expense", id))
    }

    /// Paginated listing, ordered by (transaction_date, id).
    pub async fn list(
        &self,
        actor: UserId,
        filter: &ExpenseFilter,
        request: PageRequest,
    ) -> CoreResult<Page<Expense>> {
        self.require(actor, Action::Read).await?;
        let inner = self.inner.read().await;
        let mut matching: Vec<&Expense> = inner
            .expenses
            .values()
            .filter(|e| filter.matches(e))
            .collect();
        matching.sort_by_key(|e| (e.transaction_date, e.id));
        let total = matching.len();
        let start = request.offset().min(total);
        let end = (start + request.size).min(total);
        Ok(Page {
            items: matching[start..end].iter().map(|e| (*e).clone()).collect(),
            page: request.page,
            size: request.size,
            total,
        })
    }

    /// Find an expense in status {authorized, pending} sharing the duplicate
    /// key, excluding `exclude` when given.
    pub async fn find_duplicate(
        &self,
        key: &DuplicateKey,
        exclude: Option<ExpenseId>,
    ) -> Option<Expense> {
        let inner = self.inner.read().await;
        find_duplicate_in(&inner.expenses, key, exclude).cloned()
    }

    /// The change-log rows for one expense, in write order.
    pub async fn change_log(&self, id: ExpenseId) -> Vec<ChangeLogRow> {
        let inner = self.inner.read().await;
        inner
            .change_log
            .iter()
            .filter(|row| row.expense_id == id)
            .cloned()
            .collect()
    }

    /// The status-log rows for one expense, in write order.
    pub async fn status_log(&self, id: ExpenseId) -> Vec<StatusLogRow> {
        let inner = self.inner.read().await;
        inner
            .status_log
            .iter()
            .filter(|row| row.expense_id == id)
            .cloned()
            .collect()
    }

    /// Overrides captured when humans revised engine decisions.
    pub async fn overrides(&self) -> Vec<OverrideRow> {
        self.inner.read().await.overrides.clone()
    }

    /// The engine mark on an expense, if the engine acted on it last.
    pub async fn engine_mark(&self, id: ExpenseId) -> Option<EngineMark> {
        self.inner.read().await.engine_marks.get(&id).cloned()
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    /// Apply a field patch under compare-and-set.
    ///
    /// A bookkeeper editing non-status fields of an `authorized` expense
    /// auto-transitions the row to `review`, clearing the authorizer.
    pub async fn update(
        &self,
        actor: UserId,
        id: ExpenseId,
        patch: ExpensePatch,
    ) -> CoreResult<Expense> {
        self.require(actor, Action::Update).await?;
        if patch.is_empty() {
            return Err(CoreError::validation("patch changes nothing"));
        }
        let actor_role = self.gate.role(actor).await;

        let mut inner = self.inner.write().await;
        let current = inner
            .expenses
            .get(&id)
            .ok_or_else(|| CoreError::not_found("expense", id))?
            .clone();

        if current.version_token != patch.expected_version {
            return Err(CoreError::conflict("stale version token")
                .with_context("expense_id", id.to_string()));
        }

        let mut next = current.clone();
        let mut changes: Vec<(String, String, String)> = Vec::new();

        if let Some(description) = patch.description {
            if description.trim().is_empty() {
                return Err(CoreError::validation("description must not be empty"));
            }
            record_change(&mut changes, "description", &next.description, &description);
            next.description = description;
        }
        if let Some(amount) = patch.amount {
            record_change(
                &mut changes,
                "amount",
                &next.amount.to_string(),
                &amount.to_string(),
            );
            next.amount = amount;
        }
        if let Some(date) = patch.transaction_date {
            record_change(
                &mut changes,
                "transaction_date",
                &next.transaction_date.to_string(),
                &date.to_string(),
            );
            next.transaction_date = date;
        }
        if let Some(vendor) = patch.vendor {
            record_change(
                &mut changes,
                "vendor",
                &display_opt(next.vendor.as_ref()),
                &vendor.to_string(),
            );
            next.vendor = Some(vendor);
        }
        if let Some(account) = patch.account {
            record_change(
                &mut changes,
                "account",
                &display_opt(next.account.as_ref()),
                &account.to_string(),
            );
            next.account = Some(account);
        }
        if let Some(payment_method) = patch.payment_method {
            record_change(
                &mut changes,
                "payment_method",
                &display_opt(next.payment_method.as_ref()),
                &payment_method.to_string(),
            );
            next.payment_method = Some(payment_method);
        }

        if changes.is_empty() {
            return Err(CoreError::validation("patch changes nothing"));
        }

        // The dup-pair invariant also holds across edits.
        let key = next.duplicate_key();
        if matches!(next.status, ExpenseStatus::Pending | ExpenseStatus::Authorized)
            && find_duplicate_in(&inner.expenses, &key, Some(id)).is_some()
        {
            return Err(CoreError::conflict("edit would duplicate an existing expense"));
        }

        let now = Utc::now();
        next.updated_by = actor;
        next.updated_at = now;
        next.version_token = Uuid::new_v4();

        // Bookkeeper edits to an authorized row put it back under review.
        let mut status_row = None;
        if next.status == ExpenseStatus::Authorized && actor_role == Some(Role::Bookkeeper) {
            let reason = "edited by bookkeeper after authorization".to_string();
            status_row = Some(StatusLogRow {
                id: Uuid::new_v4(),
                expense_id: id,
                from: ExpenseStatus::Authorized,
                to: ExpenseStatus::Review,
                reason: Some(reason.clone()),
                actor,
                at: now,
            });
            next.status = ExpenseStatus::Review;
            next.authorizer = None;
            next.status_reason = Some(reason);
        }

        let status_at = next.status;
        let rows: Vec<ChangeLogRow> = changes
            .into_iter()
            .map(|(field, old_value, new_value)| ChangeLogRow {
                id: Uuid::new_v4(),
                expense_id: id,
                field,
                old_value,
                new_value,
                actor,
                at: now,
                status_at,
            })
            .collect();

        *inner.mutation_counts.entry(id).or_insert(0) += rows.len() as u64;
        inner.expenses.insert(id, next.clone());
        if let Some(row) = status_row {
            inner.status_log.push(row);
        }
        self.write_change_rows(&mut inner, rows);

        // A human edit clears any engine mark without recording an override:
        // field edits are corrections, not authorization reversals.
        if actor_role != Some(Role::Bot) {
            inner.engine_marks.remove(&id);
        }

        Ok(next)
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    /// Validate and apply a status transition under compare-and-set.
    pub async fn set_status(
        &self,
        actor: UserId,
        id: ExpenseId,
        new_status: ExpenseStatus,
        reason: Option<String>,
        expected_version: Uuid,
    ) -> CoreResult<Expense> {
        self.require(actor, Action::Authorize).await?;
        let actor_role = self.gate.role(actor).await;
        let mut inner = self.inner.write().await;
        let current = inner
            .expenses
            .get(&id)
            .ok_or_else(|| CoreError::not_found("expense", id))?
            .clone();

        if current.version_token != expected_version {
            return Err(CoreError::conflict("stale version token"));
        }
        self.apply_transition(&mut inner, current, actor, actor_role, new_status, reason, None)
    }

    /// Conditional authorization for the auto-auth engine: succeeds only if
    /// the row is still `pending`, otherwise reports the lost race.
    ///
    /// Returns `Ok(true)` when the row was authorized, `Ok(false)` when a
    /// concurrent actor got there first.
    pub async fn set_status_if_pending(
        &self,
        actor: UserId,
        id: ExpenseId,
        new_status: ExpenseStatus,
        reason: Option<String>,
        rule: &str,
    ) -> CoreResult<bool> {
        self.require(actor, Action::Authorize).await?;
        let actor_role = self.gate.role(actor).await;
        let mut inner = self.inner.write().await;
        let current = inner
            .expenses
            .get(&id)
            .ok_or_else(|| CoreError::not_found("expense", id))?
            .clone();
        if current.status != ExpenseStatus::Pending {
            return Ok(false);
        }
        self.apply_transition(
            &mut inner,
            current,
            actor,
            actor_role,
            new_status,
            reason,
            Some(rule),
        )?;
        Ok(true)
    }

    /// Soft delete: transition to `review`, clear the authorizer, record the
    /// reason.
    pub async fn soft_delete(
        &self,
        actor: UserId,
        id: ExpenseId,
        reason: String,
    ) -> CoreResult<Expense> {
        self.require(actor, Action::Delete).await?;
        let actor_role = self.gate.role(actor).await;
        let mut inner = self.inner.write().await;
        let current = inner
            .expenses
            .get(&id)
            .ok_or_else(|| CoreError::not_found("expense", id))?
            .clone();
        if current.status == ExpenseStatus::Review {
            return Err(CoreError::business_rule("expense is already under review"));
        }
        self.apply_transition(
            &mut inner,
            current,
            actor,
            actor_role,
            ExpenseStatus::Review,
            Some(reason),
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_transition(
        &self,
        inner: &mut Inner,
        current: Expense,
        actor: UserId,
        actor_role: Option<Role>,
        new_status: ExpenseStatus,
        reason: Option<String>,
        engine_rule: Option<&str>,
    ) -> CoreResult<Expense> {
        if !current.status.can_transition_to(new_status) {
            return Err(CoreError::business_rule(format!(
                "illegal transition {} -> {}",
                current.status, new_status
            )));
        }
        if new_status == ExpenseStatus::Review && reason.is_none() {
            return Err(CoreError::validation("review requires a reason"));
        }

        let now = Utc::now();
        let id = current.id;
        let mut next = current.clone();
        next.status = new_status;
        next.status_reason = reason.clone();
        next.authorizer = (new_status == ExpenseStatus::Authorized).then_some(actor);
        next.updated_by = actor;
        next.updated_at = now;
        next.version_token = Uuid::new_v4();

        inner.status_log.push(StatusLogRow {
            id: Uuid::new_v4(),
            expense_id: id,
            from: current.status,
            to: new_status,
            reason,
            actor,
            at: now,
        });
        inner.expenses.insert(id, next.clone());

        // Override capture: a human changing status on an engine-touched row.
        match engine_rule {
            Some(rule) => {
                inner.engine_marks.insert(
                    id,
                    EngineMark {
                        rule: rule.to_string(),
                        engine_status: new_status,
                    },
                );
            }
            None => {
                if actor_role != Some(Role::Bot)
                    && let Some(mark) = inner.engine_marks.remove(&id)
                    && mark.engine_status != new_status
                {
                    inner.overrides.push(OverrideRow {
                        expense_id: id,
                        rule: mark.rule,
                        engine_status: mark.engine_status,
                        new_status,
                        actor,
                        at: now,
                    });
                }
            }
        }

        Ok(next)
    }

    // -----------------------------------------------------------------------
    // Audit plumbing
    // -----------------------------------------------------------------------

    fn write_change_rows(&self, inner: &mut Inner, rows: Vec<ChangeLogRow>) {
        match &self.audit {
            AuditMode::Inline => inner.change_log.extend(rows),
            AuditMode::Deferred(queue) => {
                let payload = match serde_json::to_value(&rows) {
                    Ok(v) => json!({ "rows": v }),
                    Err(e) => {
                        error!(error = %e, "change rows failed to serialize; writing inline");
                        inner.change_log.extend(rows);
                        return;
                    }
                };
                if let Err(e) = queue.enqueue(JobKind::WriteChangeLog, payload) {
                    // Best effort only — the commit stands, reconcile_audit
                    // will surface the gap.
                    warn!(error = %e, "failed to enqueue change-log job");
                }
            }
        }
    }

    /// Append change rows produced by a deferred job.
    pub async fn apply_change_rows(&self, rows: Vec<ChangeLogRow>) {
        let mut inner = self.inner.write().await;
        inner.change_log.extend(rows);
    }

    /// Append status rows produced by a replay or backfill job.
    pub async fn apply_status_rows(&self, rows: Vec<StatusLogRow>) {
        let mut inner = self.inner.write().await;
        inner.status_log.extend(rows);
    }

    /// Compare per-expense mutation counts against logged change rows and
    /// report any expense whose rows are missing.
    pub async fn reconcile_audit(&self) -> AuditReconciliation {
        let inner = self.inner.read().await;
        let mut logged: HashMap<ExpenseId, u64> = HashMap::new();
        for row in &inner.change_log {
            *logged.entry(row.expense_id).or_insert(0) += 1;
        }
        let mut gaps: Vec<(ExpenseId, u64)> = inner
            .mutation_counts
            .iter()
            .filter_map(|(id, count)| {
                let have = logged.get(id).copied().unwrap_or(0);
                (have < *count).then_some((*id, *count - have))
            })
            .collect();
        gaps.sort_by_key(|(id, _)| *id);
        AuditReconciliation { gaps }
    }

    /// Recent human account corrections for a project: change-log rows that
    /// reassigned an account, newest first, paired with the expense
    /// description at the time.
    pub async fn recent_account_corrections(
        &self,
        project: sl_core::ProjectId,
        limit: usize,
    ) -> Vec<(String, sl_core::AccountId)> {
        let inner = self.inner.read().await;
        let mut corrections: Vec<(chrono::DateTime<Utc>, String, sl_core::AccountId)> = inner
            .change_log
            .iter()
            .filter(|row| row.field == "account")
            .filter_map(|row| {
                let expense = inner.expenses.get(&row.expense_id)?;
                if expense.project != project {
                    return None;
                }
                let account: sl_core::AccountId = row.new_value.parse().ok()?;
                Some((row.at, expense.description.clone(), account))
            })
            .collect();
        corrections.sort_by(|a, b| b.0.cmp(&a.0));
        corrections
            .into_iter()
            .take(limit)
            .map(|(_, description, account)| (description, account))
            .collect()
    }

    /// Sum of `amount` over every expense matching the filter, computed by
    /// exhaustive pagination.
    pub async fn sum_amounts(&self, actor: UserId, filter: &ExpenseFilter) -> CoreResult<Money> {
        let all = sl_core::page::collect_all_pages(sl_core::page::DEFAULT_PAGE_SIZE, |req| {
            let filter = filter.clone();
            async move { self.list(actor, &filter, req).await }
        })
        .await?;
        Ok(all.into_iter().map(|e| e.amount).sum())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_new(row: &NewExpense) -> Result<(), String> {
    if row.description.trim().is_empty() {
        return Err("description must not be empty".into());
    }
    if let Some(confidence) = row.confidence
        && confidence > 100
    {
        return Err("confidence must be 0-100".into());
    }
    Ok(())
}

fn record_change(changes: &mut Vec<(String, String, String)>, field: &str, old: &str, new: &str) {
    if old != new {
        changes.push((field.to_string(), old.to_string(), new.to_string()));
    }
}

fn display_opt<T: std::fmt::Display>(value: Option<&T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn find_duplicate_in<'a>(
    expenses: &'a HashMap<ExpenseId, Expense>,
    key: &DuplicateKey,
    exclude: Option<ExpenseId>,
) -> Option<&'a Expense> {
    expenses.values().find(|e| {
        Some(e.id) != exclude
            && matches!(e.status, ExpenseStatus::Pending | ExpenseStatus::Authorized)
            && &e.duplicate_key() == key
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
