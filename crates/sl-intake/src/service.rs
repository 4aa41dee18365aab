// SPDX-License-Identifier: MIT OR Apache-2.0
//! The composed ingest service: OCR → categorization → expense creation.
//!
//! Partial creation is explicit: line items without an amount, and items
//! whose categorization exhausted every tier, are skipped and surfaced in
//! the outcome. The intake still links when at least one expense landed.

use crate::queue::IntakeQueue;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sl_categorize::{AccountRef, CategorizationEngine, CategorizeRow, Correction, RowWarning};
use sl_core::{
    ExpenseId, IntakeId, IntakeRecord, IntakeStatus, NewExpense, UserId, VendorId,
};
use sl_error::{CoreError, CoreResult};
use sl_ocr::{OcrPipeline, OcrRequest};
use sl_store::ExpenseStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Vendor resolution
// ---------------------------------------------------------------------------

/// Resolves a printed vendor string to master-data vendor ids.
#[async_trait]
pub trait VendorResolver: Send + Sync {
    /// Resolve a vendor name, case-insensitively.
    async fn resolve(&self, name: &str) -> Option<VendorId>;
}

/// In-memory resolver for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryVendorResolver {
    names: Mutex<HashMap<String, VendorId>>,
}

impl InMemoryVendorResolver {
    /// Create an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a vendor name.
    pub fn add(&self, name: &str, id: VendorId) {
        self.names
            .lock()
            .expect("vendor resolver lock poisoned")
            .insert(name.to_lowercase(), id);
    }
}

#[async_trait]
impl VendorResolver for InMemoryVendorResolver {
    async fn resolve(&self, name: &str) -> Option<VendorId> {
        self.names
            .lock()
            .expect("vendor resolver lock poisoned")
            .get(&name.to_lowercase())
            .copied()
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why a line item was not turned into an expense.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipReason {
    /// Index of the line item on the receipt.
    pub row_index: usize,
    /// Human-readable reason.
    pub reason: String,
}

/// Result of expense creation from one intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreationOutcome {
    /// The intake after the attempt.
    pub intake: IntakeRecord,
    /// Expenses actually written, in line-item order.
    pub created: Vec<ExpenseId>,
    /// Number of skipped line items.
    pub skipped: usize,
    /// Why each skipped item was skipped.
    pub reasons: Vec<SkipReason>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Composes the queue, OCR pipeline, categorization engine, and expense
/// store into the upload-to-ledger flow.
pub struct IntakeService {
    queue: IntakeQueue,
    ocr: Arc<OcrPipeline>,
    engine: Arc<CategorizationEngine>,
    store: ExpenseStore,
    vendors: Arc<dyn VendorResolver>,
    hitl_confidence: u8,
}

impl IntakeService {
    /// Assemble the service.
    #[must_use]
    pub fn new(
        queue: IntakeQueue,
        ocr: Arc<OcrPipeline>,
        engine: Arc<CategorizationEngine>,
        store: ExpenseStore,
        vendors: Arc<dyn VendorResolver>,
        hitl_confidence: u8,
    ) -> Self {
        Self {
            queue,
            ocr,
            engine,
            store,
            vendors,
            hitl_confidence,
        }
    }

    /// The underlying queue.
    #[must_use]
    pub fn queue(&self) -> &IntakeQueue {
        &self.queue
    }

    /// The expense store handle.
    #[must_use]
    pub fn store(&self) -> &ExpenseStore {
        &self.store
    }

    /// Run OCR on a pending intake and route it to `ready`, `check_review`,
    /// `duplicate`, or `error`.
    pub async fn process(
        &self,
        actor: UserId,
        id: IntakeId,
        stage: &str,
    ) -> CoreResult<IntakeRecord> {
        let record = self.queue.get(actor, id).await?;
        if record.status != IntakeStatus::Pending {
            return Err(CoreError::business_rule(format!(
                "intake is {}, not pending",
                record.status
            )));
        }
        self.queue
            .transition(id, IntakeStatus::Processing, None)
            .await?;

        let blob = self.queue.blob(id).await?;
        let request = OcrRequest {
            blob,
            mime_type: record.mime_type.clone(),
            project: record.project,
            stage: stage.to_string(),
            declared_text: record.extracted_text.clone(),
            agent: "receipt-agent".into(),
        };
        let outcome = match self.ocr.process(request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(intake = %id, error = %err, "ocr failed");
                return self
                    .queue
                    .transition(id, IntakeStatus::Error, Some(err.to_string()))
                    .await;
            }
        };

        self.queue
            .attach_parse(id, outcome.receipt.clone(), outcome.extracted_text)
            .await?;

        // Field-tuple dedup now that fields exist.
        if self.queue.field_duplicate_exists(id).await? {
            return self
                .queue
                .transition(
                    id,
                    IntakeStatus::Duplicate,
                    Some("matching receipt already accepted in the last 30 days".into()),
                )
                .await;
        }

        let mismatch =
            outcome.receipt.total_match_type == sl_core::TotalMatchType::Mismatch;
        let weak_confidence =
            outcome.receipt.confidence.min_present(&outcome.receipt) < self.hitl_confidence;
        let (next, reason) = if mismatch {
            (
                IntakeStatus::CheckReview,
                Some("line totals disagree with the receipt total".to_string()),
            )
        } else if weak_confidence {
            (
                IntakeStatus::CheckReview,
                Some("extraction confidence below the review threshold".to_string()),
            )
        } else {
            (IntakeStatus::Ready, None)
        };
        self.queue.transition(id, next, reason).await
    }

    /// Create expenses from a processed intake's line items and link them.
    ///
    /// `accounts` is the catalog for categorization; `corrections` are
    /// recent human corrections for the project/stage context.
    pub async fn create_expenses(
        &self,
        actor: UserId,
        id: IntakeId,
        stage: &str,
        accounts: &[AccountRef],
        corrections: &[Correction],
    ) -> CoreResult<CreationOutcome> {
        let record = self.queue.get(actor, id).await?;
        if !matches!(
            record.status,
            IntakeStatus::Ready | IntakeStatus::CheckReview
        ) {
            return Err(CoreError::business_rule(format!(
                "intake is {}, expenses can only be created from ready or check_review",
                record.status
            )));
        }
        let parsed = record
            .parsed
            .clone()
            .ok_or_else(|| CoreError::business_rule("intake has no parsed receipt"))?;

        let vendor = match &parsed.vendor {
            Some(name) => self.vendors.resolve(name).await,
            None => None,
        };

        // Categorize only the items that can become expenses at all.
        let mut reasons: Vec<SkipReason> = Vec::new();
        let mut rows: Vec<CategorizeRow> = Vec::new();
        let mut amounts: Vec<(usize, sl_core::Money)> = Vec::new();
        for (index, item) in parsed.line_items.iter().enumerate() {
            match item.line_total {
                Some(amount) => {
                    rows.push(CategorizeRow {
                        row_index: index,
                        description: item.description.clone(),
                        stage: stage.to_string(),
                        vendor,
                        project: Some(record.project),
                    });
                    amounts.push((index, amount));
                }
                None => reasons.push(SkipReason {
                    row_index: index,
                    reason: "line item has no amount".into(),
                }),
            }
        }

        let (results, _) = self.engine.categorize(&rows, accounts, corrections).await;
        let date = parsed.date.unwrap_or_else(|| Utc::now().date_naive());

        let mut to_create: Vec<NewExpense> = Vec::new();
        let mut created_indexes: Vec<usize> = Vec::new();
        for result in &results {
            let (index, amount) = amounts
                .iter()
                .find(|(i, _)| *i == result.row_index)
                .copied()
                .expect("categorization result for unknown row");
            if result.warning == Some(RowWarning::Exhausted) {
                reasons.push(SkipReason {
                    row_index: index,
                    reason: "categorization exhausted every tier".into(),
                });
                continue;
            }
            let description = parsed.line_items[index].description.clone();
            to_create.push(NewExpense {
                project: record.project,
                transaction_date: date,
                amount,
                vendor,
                account: result.account,
                description,
                payment_method: None,
                bill: None,
                external_ref: None,
                confidence: Some(result.confidence),
                categorization_source: result.source,
            });
            created_indexes.push(index);
        }

        if to_create.is_empty() {
            let skipped = reasons.len();
            return Ok(CreationOutcome {
                intake: record,
                created: Vec::new(),
                skipped,
                reasons,
            });
        }

        let created = self
            .store
            .create_batch(actor, to_create, Some(format!("intake-{id}")))
            .await?;
        let intake = self.queue.link(id, created.clone()).await?;
        info!(
            intake = %id,
            created = created.len(),
            skipped = reasons.len(),
            "expenses created from intake"
        );
        Ok(CreationOutcome {
            intake,
            created,
            skipped: reasons.len(),
            reasons,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
