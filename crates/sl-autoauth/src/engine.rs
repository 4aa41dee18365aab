// SPDX-License-Identifier: MIT OR Apache-2.0
//! The auto-authorization engine.
//!
//! Rules run in a fixed order and the first match wins. Rules that mutate
//! go through the store's conditional update, so a human who got there
//! first always wins and the lost race is recorded on the decision. One
//! report per run; one consolidated digest per project.

use crate::fuzzy::vendor_similarity;
use crate::report::{
    AuthReport, BillProvider, BillRecord, Decision, DecisionRecord, VendorDirectory,
};
use chrono::{Duration, NaiveDate, Utc};
use sl_chat::{Author, MessageBlock, MessageHub, PostMessage};
use sl_config::SiteLedgerConfig;
use sl_core::{
    ChannelKey, Expense, ExpenseFilter, ExpenseStatus, IntakeStatus, ProjectId, ReportId, UserId,
    page::{DEFAULT_PAGE_SIZE, collect_all_pages},
};
use sl_error::CoreResult;
use sl_intake::IntakeQueue;
use sl_store::ExpenseStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Date window for bill matching.
const BILL_DATE_WINDOW_DAYS: i64 = 3;

/// Stable rule identifiers.
pub mod rules {
    /// Exact duplicate of an authorized or pending expense.
    pub const R1_EXACT_DUP: &str = "R1_EXACT_DUP";
    /// A bill references or matches the expense.
    pub const R2_BILL_HINT: &str = "R2_BILL_HINT";
    /// A linked receipt covers the expense.
    pub const R3_RECEIPT_SUFFICIENT: &str = "R3_RECEIPT_SUFFICIENT";
    /// Required fields are missing.
    pub const R4_MISSING_INFO: &str = "R4_MISSING_INFO";
    /// Policy escalation: amount or lexicon.
    pub const R5_POLICY_ESCALATE: &str = "R5_POLICY_ESCALATE";
    /// Health sweep for stale pending rows.
    pub const R6_HEALTH: &str = "R6_HEALTH";
}

/// The engine. Share behind an `Arc`.
pub struct AutoAuthEngine {
    config: SiteLedgerConfig,
    store: ExpenseStore,
    intakes: IntakeQueue,
    bills: Arc<dyn BillProvider>,
    vendors: Arc<dyn VendorDirectory>,
    hub: MessageHub,
    /// The engine's bot identity; set as authorizer on engine decisions.
    bot: UserId,
    reports: RwLock<HashMap<ReportId, AuthReport>>,
    /// run_id → report, for digest dedup across retried runs.
    runs: Mutex<HashMap<Uuid, ReportId>>,
    /// Per-project digest lines awaiting the flush cadence.
    digests: Mutex<HashMap<ProjectId, Vec<String>>>,
}

impl AutoAuthEngine {
    /// Assemble the engine.
    #[must_use]
    pub fn new(
        config: SiteLedgerConfig,
        store: ExpenseStore,
        intakes: IntakeQueue,
        bills: Arc<dyn BillProvider>,
        vendors: Arc<dyn VendorDirectory>,
        hub: MessageHub,
        bot: UserId,
    ) -> Self {
        Self {
            config,
            store,
            intakes,
            bills,
            vendors,
            hub,
            bot,
            reports: RwLock::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            digests: Mutex::new(HashMap::new()),
        }
    }

    /// Run the engine over a project's pending expenses.
    ///
    /// `window` bounds the transaction dates scanned. A repeated `run_id`
    /// returns the original report without re-running — that is what keeps
    /// digests deduplicated across client retries.
    pub async fn run(
        &self,
        project: ProjectId,
        window: Option<(NaiveDate, NaiveDate)>,
        run_id: Uuid,
    ) -> CoreResult<AuthReport> {
        {
            let runs = self.runs.lock().await;
            if let Some(report_id) = runs.get(&run_id)
                && let Some(report) = self.reports.read().await.get(report_id)
            {
                info!(%run_id, "repeated run id; returning original report");
                return Ok(report.clone());
            }
        }

        let started_at = Utc::now();
        let filter = ExpenseFilter {
            project: Some(project),
            status: Some(ExpenseStatus::Pending),
            from: window.map(|(from, _)| from),
            to: window.map(|(_, to)| to),
            ..Default::default()
        };
        let candidates: Vec<Expense> = collect_all_pages(DEFAULT_PAGE_SIZE, |req| {
            let filter = filter.clone();
            async move { self.store.list(self.bot, &filter, req).await }
        })
        .await?;

        let bills = self.bills.bills_for_project(project).await;
        let linked = self.intakes.linked_intakes().await;

        let mut decisions = Vec::new();
        for expense in &candidates {
            let decision = self.decide(expense, &candidates, &bills, &linked).await?;
            if let Some(decision) = decision {
                decisions.push(decision);
            }
        }

        let report = AuthReport {
            id: ReportId::new(),
            run_id,
            project,
            scanned: candidates.len(),
            decisions,
            started_at,
            finished_at: Utc::now(),
        };

        self.queue_digest(&report).await;
        self.reports.write().await.insert(report.id, report.clone());
        self.runs.lock().await.insert(run_id, report.id);
        info!(
            %project,
            scanned = report.scanned,
            decisions = report.decisions.len(),
            "auto-auth run finished"
        );
        Ok(report)
    }

    async fn decide(
        &self,
        expense: &Expense,
        _candidates: &[Expense],
        bills: &[BillRecord],
        linked: &[sl_core::IntakeRecord],
    ) -> CoreResult<Option<DecisionRecord>> {
        let record = |rule: &str, decision, reason: String, missing: Vec<String>, raced| {
            Some(DecisionRecord {
                expense_id: expense.id,
                rule: rule.to_string(),
                decision,
                reason,
                amount: expense.amount,
                missing_fields: missing,
                skipped_race: raced,
                decided_at: Utc::now(),
            })
        };

        // R1: another authorized/pending expense with the same key.
        if self
            .store
            .find_duplicate(&expense.duplicate_key(), Some(expense.id))
            .await
            .is_some()
        {
            return Ok(record(
                rules::R1_EXACT_DUP,
                Decision::Duplicate,
                "an identical expense already exists in this project".into(),
                vec![],
                false,
            ));
        }

        // R2: a bill references or matches this expense.
        if self.config.allow_bill_authorization
            && let Some(bill) = self.matching_bill(expense, bills).await
        {
            let reason = format!("bill {} covers this expense", bill.id);
            let won = self
                .store
                .set_status_if_pending(
                    self.bot,
                    expense.id,
                    ExpenseStatus::Authorized,
                    Some(reason.clone()),
                    rules::R2_BILL_HINT,
                )
                .await?;
            return Ok(record(
                rules::R2_BILL_HINT,
                Decision::Authorized,
                reason,
                vec![],
                !won,
            ));
        }

        // R3: a linked intake created this expense.
        if linked.iter().any(|intake| {
            intake.status == IntakeStatus::Linked
                && intake.created_expense_ids.contains(&expense.id)
        }) {
            // Receipts never authorize a guarded or uncategorized line.
            if expense.account.is_some() && !self.config.matches_power_tool(&expense.description)
            {
                let reason = "a linked receipt covers this expense".to_string();
                let won = self
                    .store
                    .set_status_if_pending(
                        self.bot,
                        expense.id,
                        ExpenseStatus::Authorized,
                        Some(reason.clone()),
                        rules::R3_RECEIPT_SUFFICIENT,
                    )
                    .await?;
                return Ok(record(
                    rules::R3_RECEIPT_SUFFICIENT,
                    Decision::Authorized,
                    reason,
                    vec![],
                    !won,
                ));
            }
        }

        // R4: required fields missing. A guarded power-tool line is not
        // missing info — its account is deliberately withheld and R5 owns it.
        let guarded = self.config.matches_power_tool(&expense.description);
        let mut missing = Vec::new();
        if expense.vendor.is_none() {
            missing.push("vendor".to_string());
        }
        if expense.account.is_none() && !guarded {
            missing.push("account".to_string());
        }
        if expense.amount.is_zero() {
            missing.push("amount".to_string());
        }
        if !missing.is_empty() {
            return Ok(record(
                rules::R4_MISSING_INFO,
                Decision::MissingInfo,
                format!("missing: {}", missing.join(", ")),
                missing,
                false,
            ));
        }

        // R5: policy escalation by amount or lexicon.
        if expense.amount > self.config.escalation_amount {
            return Ok(record(
                rules::R5_POLICY_ESCALATE,
                Decision::Escalated,
                format!(
                    "amount {} exceeds the escalation threshold {}",
                    expense.amount, self.config.escalation_amount
                ),
                vec![],
                false,
            ));
        }
        if guarded {
            return Ok(record(
                rules::R5_POLICY_ESCALATE,
                Decision::Escalated,
                "description matches the escalation lexicon".into(),
                vec![],
                false,
            ));
        }

        // R6: stale pending rows with no other rule hit.
        let age = Utc::now() - expense.created_at;
        if age >= Duration::days(self.config.pending_escalation_age_days) {
            return Ok(record(
                rules::R6_HEALTH,
                Decision::Escalated,
                format!(
                    "pending for {} days with no matching rule",
                    age.num_days()
                ),
                vec![],
                false,
            ));
        }

        Ok(None)
    }

    async fn matching_bill<'b>(
        &self,
        expense: &Expense,
        bills: &'b [BillRecord],
    ) -> Option<&'b BillRecord> {
        let expense_vendor_name = match expense.vendor {
            Some(vendor) => self.vendors.name_of(vendor).await,
            None => None,
        };
        bills.iter().find(|bill| {
            if bill.expense_ref == Some(expense.id) {
                return true;
            }
            let vendor_matches = match (bill.vendor, expense.vendor) {
                (Some(bill_vendor), Some(expense_vendor)) => bill_vendor == expense_vendor,
                _ => match (&bill.vendor_name, &expense_vendor_name) {
                    (Some(bill_name), Some(expense_name)) => {
                        vendor_similarity(bill_name, expense_name) >= self.config.fuzzy_threshold
                    }
                    _ => false,
                },
            };
            vendor_matches
                && bill.amount.within_tolerance(
                    expense.amount,
                    self.config.tolerance_abs,
                    self.config.tolerance_rel,
                )
                && (bill.date - expense.transaction_date)
                    .num_days()
                    .abs()
                    <= BILL_DATE_WINDOW_DAYS
        })
    }

    // -----------------------------------------------------------------------
    // Reports and digests
    // -----------------------------------------------------------------------

    /// Fetch a report.
    pub async fn report(&self, id: ReportId) -> Option<AuthReport> {
        self.reports.read().await.get(&id).cloned()
    }

    /// The most recent decision for an expense, for `explain_decision`.
    pub async fn explain(&self, expense: sl_core::ExpenseId) -> Option<DecisionRecord> {
        let reports = self.reports.read().await;
        reports
            .values()
            .flat_map(|r| r.decisions.iter())
            .filter(|d| d.expense_id == expense)
            .max_by_key(|d| d.decided_at)
            .cloned()
    }

    async fn queue_digest(&self, report: &AuthReport) {
        if report.decisions.is_empty() {
            return;
        }
        let line = format!(
            "{} scanned: {} authorized, {} duplicates, {} missing info, {} escalated",
            report.scanned,
            report.count(Decision::Authorized),
            report.count(Decision::Duplicate),
            report.count(Decision::MissingInfo),
            report.count(Decision::Escalated),
        );
        self.digests
            .lock()
            .await
            .entry(report.project)
            .or_default()
            .push(line);
    }

    /// Flush the pending digest for a project as one consolidated message.
    ///
    /// Called on the digest cadence by the background orchestrator. Returns
    /// whether a message was posted.
    pub async fn flush_digest(&self, project: ProjectId) -> CoreResult<bool> {
        let lines = {
            let mut digests = self.digests.lock().await;
            digests.remove(&project)
        };
        let Some(lines) = lines else {
            return Ok(false);
        };
        if lines.is_empty() {
            return Ok(false);
        }
        let body = lines.join("\n");
        let result = self
            .hub
            .post(PostMessage {
                channel: ChannelKey::new("project", project),
                author: Author::Bot {
                    name: "authorization-agent".into(),
                },
                body: body.clone(),
                blocks: vec![MessageBlock::Card {
                    title: "Auto-authorization digest".into(),
                    body,
                    buttons: vec![],
                }],
                metadata: serde_json::json!({ "kind": "auto_auth_digest" }),
                mentions: vec![],
                reply_to: None,
            })
            .await;
        if let Err(err) = result {
            warn!(%project, error = %err, "digest post failed");
            return Err(err);
        }
        Ok(true)
    }

    /// Projects with digest lines waiting to flush.
    pub async fn projects_with_pending_digests(&self) -> Vec<ProjectId> {
        self.digests.lock().await.keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
