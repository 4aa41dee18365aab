// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-reconcile
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sl_config::SiteLedgerConfig;
use sl_core::{Expense, ExpenseId, IntakeId, IntakeStatus, Money, NewExpense, UserId};
use sl_error::{CoreError, CoreResult};
use sl_llm::{LlmGateway, PageImage};
use sl_ocr::receipt_schema;
use sl_store::ExpenseStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Suggestions
// ---------------------------------------------------------------------------

/// How the receipt and its created expenses disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// The receipt carries items that never became expenses.
    MissingItems,
    /// The same receipt line became two expenses.
    DuplicatedLine,
    /// The originally extracted total was wrong; the expenses are right.
    TotalWrong,
    /// One expense consolidates several receipt lines.
    AmountsConsolidated,
}

/// A proposed new expense inside a suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedExpense {
    /// Line description from the re-read.
    pub description: String,
    /// Line amount.
    pub amount: Money,
}

/// The concrete correction a suggestion proposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuggestionAction {
    /// Create these additional expenses.
    CreateExpenses {
        /// The proposed expenses.
        expenses: Vec<SuggestedExpense>,
    },
    /// Split one expense into several lines.
    SplitExpense {
        /// The consolidated expense.
        expense_id: ExpenseId,
        /// The lines it should become.
        into: Vec<SuggestedExpense>,
    },
    /// Route to a human.
    ManualReview,
}

/// A persisted correction suggestion. Never applied automatically unless
/// the operator opted in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSuggestion {
    /// Suggestion id.
    pub id: Uuid,
    /// The intake reconciled.
    pub intake_id: IntakeId,
    /// Discrepancy classification.
    pub kind: DiscrepancyKind,
    /// Proposed correction.
    pub action: SuggestionAction,
    /// Receipt total minus created-expense sum.
    pub difference: Money,
    /// Confidence of the re-read evidence, 0–100.
    pub confidence: u8,
    /// Whether the suggestion was auto-applied.
    pub applied: bool,
    /// When the suggestion was recorded.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// The reconciler. Share behind an `Arc`.
pub struct Reconciler {
    config: SiteLedgerConfig,
    gateway: Arc<dyn LlmGateway>,
    intakes: sl_intake::IntakeQueue,
    store: ExpenseStore,
    /// Acting identity for reads and (opted-in) correction writes.
    bot: UserId,
    suggestions: RwLock<Vec<ReconcileSuggestion>>,
}

impl Reconciler {
    /// Assemble the reconciler.
    #[must_use]
    pub fn new(
        config: SiteLedgerConfig,
        gateway: Arc<dyn LlmGateway>,
        intakes: sl_intake::IntakeQueue,
        store: ExpenseStore,
        bot: UserId,
    ) -> Self {
        Self {
            config,
            gateway,
            intakes,
            store,
            bot,
            suggestions: RwLock::new(Vec::new()),
        }
    }

    /// Reconcile one linked intake.
    ///
    /// Returns `None` when the receipt total and the created expenses
    /// already agree within tolerance.
    pub async fn reconcile(&self, intake_id: IntakeId) -> CoreResult<Option<ReconcileSuggestion>> {
        let intake = self.intakes.get(self.bot, intake_id).await?;
        if intake.status != IntakeStatus::Linked {
            return Err(CoreError::business_rule(format!(
                "intake is {}, only linked intakes reconcile",
                intake.status
            )));
        }
        let parsed = intake
            .parsed
            .as_ref()
            .ok_or_else(|| CoreError::business_rule("intake has no parsed receipt"))?;
        let Some(receipt_total) = parsed.total else {
            return Err(CoreError::business_rule("intake has no receipt total"));
        };

        let mut expenses: Vec<Expense> = Vec::with_capacity(intake.created_expense_ids.len());
        for id in &intake.created_expense_ids {
            expenses.push(self.store.get(self.bot, *id).await?);
        }
        let expense_sum: Money = expenses.iter().map(|e| e.amount).sum();

        if expense_sum.within_tolerance(
            receipt_total,
            self.config.tolerance_abs,
            self.config.tolerance_rel,
        ) && parsed.total_match_type != sl_core::TotalMatchType::Mismatch
        {
            return Ok(None);
        }
        let difference = receipt_total
            .checked_sub(expense_sum)
            .map_err(|e| CoreError::internal(e.to_string()))?;

        // Re-read the receipt, biased toward finding what was missed.
        let blob = self.intakes.blob(intake_id).await?;
        let pages = vec![PageImage {
            bytes: blob,
            mime: intake.mime_type.clone(),
        }];
        let reply = self
            .gateway
            .extract_vision(&pages, &reread_prompt(&expenses), &receipt_schema())
            .await
            .map_err(CoreError::from)?;
        drop(pages);
        let reread = sl_ocr::receipt_from_value(&reply.value)?;

        let (kind, action, confidence) =
            classify(&reread, &expenses, receipt_total, difference);

        let mut suggestion = ReconcileSuggestion {
            id: Uuid::new_v4(),
            intake_id,
            kind,
            action,
            difference,
            confidence,
            applied: false,
            created_at: Utc::now(),
        };

        if self.should_auto_apply(&suggestion) {
            match self.apply(&suggestion, &intake.project).await {
                Ok(()) => suggestion.applied = true,
                Err(err) => {
                    warn!(intake = %intake_id, error = %err, "auto-apply failed; keeping suggestion")
                }
            }
        }

        info!(
            intake = %intake_id,
            kind = ?suggestion.kind,
            difference = %suggestion.difference,
            applied = suggestion.applied,
            "reconciliation recorded"
        );
        self.suggestions.write().await.push(suggestion.clone());
        Ok(Some(suggestion))
    }

    fn should_auto_apply(&self, suggestion: &ReconcileSuggestion) -> bool {
        self.config.reconcile_auto_apply
            && suggestion.confidence >= self.config.reconcile_auto_apply_min_confidence
            && matches!(suggestion.action, SuggestionAction::CreateExpenses { .. })
    }

    async fn apply(
        &self,
        suggestion: &ReconcileSuggestion,
        project: &sl_core::ProjectId,
    ) -> CoreResult<()> {
        let SuggestionAction::CreateExpenses { expenses } = &suggestion.action else {
            return Ok(());
        };
        let intake = self.intakes.get(self.bot, suggestion.intake_id).await?;
        let date = intake
            .parsed
            .as_ref()
            .and_then(|p| p.date)
            .unwrap_or_else(|| Utc::now().date_naive());
        let rows: Vec<NewExpense> = expenses
            .iter()
            .map(|e| NewExpense {
                project: *project,
                transaction_date: date,
                amount: e.amount,
                vendor: None,
                account: None,
                description: e.description.clone(),
                payment_method: None,
                bill: None,
                external_ref: None,
                confidence: Some(suggestion.confidence),
                categorization_source: None,
            })
            .collect();
        let ids = self
            .store
            .create_batch(
                self.bot,
                rows,
                Some(format!("reconcile-{}", suggestion.id)),
            )
            .await?;
        self.intakes
            .append_linked(suggestion.intake_id, ids)
            .await?;
        Ok(())
    }

    /// All persisted suggestions.
    pub async fn suggestions(&self) -> Vec<ReconcileSuggestion> {
        self.suggestions.read().await.clone()
    }

    /// Suggestions for one intake.
    pub async fn for_intake(&self, intake: IntakeId) -> Vec<ReconcileSuggestion> {
        self.suggestions
            .read()
            .await
            .iter()
            .filter(|s| s.intake_id == intake)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

fn reread_prompt(expenses: &[Expense]) -> String {
    let mut prompt = String::from(
        "Re-read this receipt carefully. The ledger currently shows these \
         expenses for it:\n",
    );
    for expense in expenses {
        prompt.push_str(&format!("  {} — {}\n", expense.description, expense.amount));
    }
    prompt.push_str(
        "Look specifically for purchase lines that are NOT in that list. \
         Report every line with its printed amount, plus vendor, date, \
         subtotal, tax, and total.",
    );
    prompt
}

fn classify(
    reread: &sl_core::ParsedReceipt,
    expenses: &[Expense],
    receipt_total: Money,
    difference: Money,
) -> (DiscrepancyKind, SuggestionAction, u8) {
    let reread_confidence = reread
        .line_items
        .iter()
        .map(|i| i.confidence)
        .min()
        .unwrap_or(0);

    // Count expense amounts so matching consumes them one by one.
    let mut unmatched_expense_counts: HashMap<i64, usize> = HashMap::new();
    for expense in expenses {
        *unmatched_expense_counts
            .entry(expense.amount.cents())
            .or_insert(0) += 1;
    }

    let mut missing: Vec<SuggestedExpense> = Vec::new();
    for item in &reread.line_items {
        let Some(amount) = item.line_total else {
            continue;
        };
        match unmatched_expense_counts.get_mut(&amount.cents()) {
            Some(count) if *count > 0 => *count -= 1,
            _ => missing.push(SuggestedExpense {
                description: item.description.clone(),
                amount,
            }),
        }
    }
    let leftover_expenses: usize = unmatched_expense_counts.values().sum();

    // Receipt lines absent from the ledger whose sum explains the gap.
    if !missing.is_empty() {
        let missing_sum: Money = missing.iter().map(|m| m.amount).sum();
        if missing_sum.abs_diff(difference).cents().abs() <= 5 {
            return (
                DiscrepancyKind::MissingItems,
                SuggestionAction::CreateExpenses { expenses: missing },
                reread_confidence,
            );
        }
        // Several re-read lines summing to one ledger amount: consolidated.
        if let Some(consolidated) = expenses.iter().find(|e| {
            let lines_sum: Money = missing.iter().map(|m| m.amount).sum();
            e.amount == lines_sum
        }) {
            return (
                DiscrepancyKind::AmountsConsolidated,
                SuggestionAction::SplitExpense {
                    expense_id: consolidated.id,
                    into: missing,
                },
                reread_confidence,
            );
        }
    }

    // More ledger rows than receipt lines at some amount: a duplicate.
    if leftover_expenses > 0 && missing.is_empty() && difference.is_negative() {
        return (
            DiscrepancyKind::DuplicatedLine,
            SuggestionAction::ManualReview,
            reread_confidence,
        );
    }

    // The re-read agrees with the ledger: the original total was misread.
    let reread_line_sum = reread.line_total_sum();
    let ledger_sum = receipt_total
        .checked_sub(difference)
        .unwrap_or(receipt_total);
    if reread_line_sum == ledger_sum
        || reread.total.is_some_and(|t| t == ledger_sum)
    {
        return (
            DiscrepancyKind::TotalWrong,
            SuggestionAction::ManualReview,
            reread_confidence,
        );
    }

    (
        DiscrepancyKind::TotalWrong,
        SuggestionAction::ManualReview,
        reread_confidence,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
