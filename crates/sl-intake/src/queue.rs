// SPDX-License-Identifier: MIT OR Apache-2.0
//! The intake queue and its state machine.
//!
//! Uploads are hashed exactly once. Duplicate detection runs before
//! processing: first by file hash against non-terminal intakes in the same
//! project, then — once fields exist — by (project, vendor, amount, date)
//! against accepted intakes of the last 30 days.

use crate::blob::BlobStore;
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use sl_auth::{Action, CapabilityGate, Module};
use sl_core::{
    BatchId, ExpenseId, IntakeId, IntakeRecord, IntakeStatus, ParsedReceipt, ProjectId, UserId,
};
use sl_error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Window for field-tuple duplicate detection.
const FIELD_DEDUP_DAYS: i64 = 30;

/// An upload handed to the queue.
pub struct UploadRequest {
    /// File bytes; stored once, referenced by key afterwards.
    pub bytes: Vec<u8>,
    /// Declared MIME type.
    pub mime_type: String,
    /// Target project.
    pub project: ProjectId,
    /// Uploading user.
    pub uploader: UserId,
    /// Optional upload batch.
    pub batch: Option<BatchId>,
    /// Text attached by an upstream OCR pass, when declared.
    pub declared_text: Option<String>,
}

/// The intake queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct IntakeQueue {
    gate: Arc<CapabilityGate>,
    blobs: Arc<dyn BlobStore>,
    max_upload_bytes: usize,
    records: Arc<RwLock<HashMap<IntakeId, IntakeRecord>>>,
}

impl IntakeQueue {
    /// Create a queue over the given blob store.
    #[must_use]
    pub fn new(gate: Arc<CapabilityGate>, blobs: Arc<dyn BlobStore>, max_upload_bytes: usize) -> Self {
        Self {
            gate,
            blobs,
            max_upload_bytes,
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn require(&self, actor: UserId, action: Action) -> CoreResult<()> {
        if self.gate.capability(actor, Module::Receipts, action).await {
            Ok(())
        } else {
            Err(CoreError::unauthorized(format!(
                "user {actor} lacks Receipts.{action:?}"
            )))
        }
    }

    /// Accept an upload: hash, store the blob, and dedup by file hash.
    ///
    /// Returns the new intake, which lands in `pending` — or in `duplicate`
    /// when a non-terminal intake with the same hash already exists in the
    /// project.
    pub async fn upload(&self, request: UploadRequest) -> CoreResult<IntakeRecord> {
        self.require(request.uploader, Action::Create).await?;
        if request.bytes.is_empty() {
            return Err(CoreError::validation("uploaded file is empty"));
        }
        if request.bytes.len() > self.max_upload_bytes {
            return Err(CoreError::validation("uploaded file exceeds the size limit")
                .with_context("payload_too_large", true)
                .with_context("max_bytes", self.max_upload_bytes));
        }

        // The hash is computed exactly once, here.
        let file_hash = hex_sha256(&request.bytes);
        let id = IntakeId::new();
        let storage_key = format!("receipts/{id}");

        // In-flight and linked intakes block a re-upload; rejected, errored,
        // and duplicate ones leave the hash free for a retry.
        let mut records = self.records.write().await;
        let duplicate = records.values().any(|r| {
            r.project == request.project
                && r.file_hash == file_hash
                && (!r.status.is_terminal() || r.status == IntakeStatus::Linked)
        });

        let now = Utc::now();
        let mut record = IntakeRecord {
            id,
            project: request.project,
            uploader: request.uploader,
            storage_key: storage_key.clone(),
            mime_type: request.mime_type,
            file_hash,
            extracted_text: request.declared_text,
            parsed: None,
            status: IntakeStatus::Pending,
            status_reason: None,
            created_expense_ids: Vec::new(),
            batch: request.batch,
            thumbnail_key: None,
            vault_ref: None,
            created_at: now,
            updated_at: now,
        };

        if duplicate {
            record.status = IntakeStatus::Duplicate;
            record.status_reason = Some("file hash already uploaded to this project".into());
            info!(intake = %id, "duplicate upload by hash");
        } else {
            self.blobs.put(&storage_key, request.bytes).await?;
        }

        records.insert(id, record.clone());
        Ok(record)
    }

    /// Fetch one intake.
    pub async fn get(&self, actor: UserId, id: IntakeId) -> CoreResult<IntakeRecord> {
        self.require(actor, Action::Read).await?;
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("intake", id))
    }

    /// The stored blob for an intake.
    pub async fn blob(&self, id: IntakeId) -> CoreResult<Vec<u8>> {
        let key = {
            let records = self.records.read().await;
            records
                .get(&id)
                .ok_or_else(|| CoreError::not_found("intake", id))?
                .storage_key
                .clone()
        };
        self.blobs.get(&key).await
    }

    /// Validate and apply a status transition.
    pub async fn transition(
        &self,
        id: IntakeId,
        next: IntakeStatus,
        reason: Option<String>,
    ) -> CoreResult<IntakeRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("intake", id))?;
        if !record.status.can_transition_to(next) {
            return Err(CoreError::business_rule(format!(
                "illegal intake transition {} -> {}",
                record.status, next
            )));
        }
        record.status = next;
        record.status_reason = reason;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    /// Store OCR output on an intake.
    pub async fn attach_parse(
        &self,
        id: IntakeId,
        parsed: ParsedReceipt,
        extracted_text: Option<String>,
    ) -> CoreResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("intake", id))?;
        record.parsed = Some(parsed);
        if extracted_text.is_some() {
            record.extracted_text = extracted_text;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Field-tuple dedup: does an accepted intake of the last 30 days in the
    /// same project carry the same (vendor, total, date)?
    pub async fn field_duplicate_exists(&self, id: IntakeId) -> CoreResult<bool> {
        let records = self.records.read().await;
        let record = records
            .get(&id)
            .ok_or_else(|| CoreError::not_found("intake", id))?;
        let Some(parsed) = &record.parsed else {
            return Ok(false);
        };
        let (Some(vendor), Some(total), Some(date)) =
            (&parsed.vendor, parsed.total, parsed.date)
        else {
            return Ok(false);
        };
        let cutoff = Utc::now() - Duration::days(FIELD_DEDUP_DAYS);
        Ok(records.values().any(|other| {
            other.id != record.id
                && other.project == record.project
                && other.created_at >= cutoff
                && matches!(
                    other.status,
                    IntakeStatus::Ready | IntakeStatus::CheckReview | IntakeStatus::Linked
                )
                && other.parsed.as_ref().is_some_and(|p| {
                    p.vendor.as_deref().is_some_and(|v| {
                        v.eq_ignore_ascii_case(vendor)
                    }) && p.total == Some(total)
                        && p.date == Some(date)
                })
        }))
    }

    /// Link created expenses to a `ready` (or `check_review`) intake.
    pub async fn link(&self, id: IntakeId, expense_ids: Vec<ExpenseId>) -> CoreResult<IntakeRecord> {
        if expense_ids.is_empty() {
            return Err(CoreError::business_rule(
                "linked requires at least one created expense",
            ));
        }
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("intake", id))?;
        if !record.status.can_transition_to(IntakeStatus::Linked) {
            return Err(CoreError::business_rule(format!(
                "illegal intake transition {} -> linked",
                record.status
            )));
        }
        record.created_expense_ids = expense_ids;
        record.status = IntakeStatus::Linked;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    /// Append correction expenses to an already-linked intake.
    pub async fn append_linked(
        &self,
        id: IntakeId,
        expense_ids: Vec<ExpenseId>,
    ) -> CoreResult<IntakeRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("intake", id))?;
        if record.status != IntakeStatus::Linked {
            return Err(CoreError::business_rule(
                "only linked intakes can take correction expenses",
            ));
        }
        record.created_expense_ids.extend(expense_ids);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    /// Manual override: reject a non-terminal intake.
    pub async fn mark_rejected(
        &self,
        actor: UserId,
        id: IntakeId,
        reason: String,
    ) -> CoreResult<IntakeRecord> {
        self.require(actor, Action::Update).await?;
        self.transition(id, IntakeStatus::Rejected, Some(reason)).await
    }

    /// Intakes for a project, newest first.
    pub async fn list_project(&self, actor: UserId, project: ProjectId) -> CoreResult<Vec<IntakeRecord>> {
        self.require(actor, Action::Read).await?;
        let records = self.records.read().await;
        let mut list: Vec<IntakeRecord> = records
            .values()
            .filter(|r| r.project == project)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    /// Linked intakes across all projects (the reconciler's scan set).
    pub async fn linked_intakes(&self) -> Vec<IntakeRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.status == IntakeStatus::Linked)
            .cloned()
            .collect()
    }
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use sl_auth::{InMemoryRoleProvider, Role};
    use sl_core::{LineItem, Money, ReceiptConfidence, TotalMatchType};

    fn queue() -> (IntakeQueue, UserId) {
        let provider = Arc::new(InMemoryRoleProvider::new());
        let user = UserId::new();
        provider.add_user(user, "field@x", "pw", Role::Field);
        let gate = Arc::new(CapabilityGate::new(provider));
        (
            IntakeQueue::new(gate, Arc::new(InMemoryBlobStore::new()), 1024 * 1024),
            user,
        )
    }

    fn upload(bytes: &[u8], project: ProjectId, uploader: UserId) -> UploadRequest {
        UploadRequest {
            bytes: bytes.to_vec(),
            mime_type: "image/png".into(),
            project,
            uploader,
            batch: None,
            declared_text: None,
        }
    }

    fn parsed(vendor: &str, total: &str, date: (i32, u32, u32)) -> ParsedReceipt {
        ParsedReceipt {
            vendor: Some(vendor.into()),
            date: chrono::NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            total: Some(Money::parse(total).unwrap()),
            subtotal: None,
            tax: None,
            line_items: vec![LineItem {
                description: "item".into(),
                quantity: None,
                unit_price: None,
                line_total: Some(Money::parse(total).unwrap()),
                confidence: 95,
            }],
            confidence: ReceiptConfidence {
                vendor: 95,
                date: 95,
                total: 95,
                subtotal: 0,
                tax: 0,
            },
            total_match_type: TotalMatchType::Total,
        }
    }

    #[tokio::test]
    async fn upload_hashes_and_stores() {
        let (queue, user) = queue();
        let record = queue
            .upload(upload(b"receipt-bytes", ProjectId::nil(), user))
            .await
            .unwrap();
        assert_eq!(record.status, IntakeStatus::Pending);
        assert_eq!(record.file_hash.len(), 64);
        assert_eq!(queue.blob(record.id).await.unwrap(), b"receipt-bytes");
    }

    #[tokio::test]
    async fn zero_byte_upload_is_validation_error() {
        let (queue, user) = queue();
        let err = queue
            .upload(upload(b"", ProjectId::nil(), user))
            .await
            .unwrap_err();
        assert_eq!(err.kind, sl_error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn oversize_upload_is_flagged() {
        let provider = Arc::new(InMemoryRoleProvider::new());
        let user = UserId::new();
        provider.add_user(user, "f@x", "pw", Role::Field);
        let gate = Arc::new(CapabilityGate::new(provider));
        let queue = IntakeQueue::new(gate, Arc::new(InMemoryBlobStore::new()), 4);
        let err = queue
            .upload(upload(b"way too big", ProjectId::nil(), user))
            .await
            .unwrap_err();
        assert_eq!(err.context["payload_too_large"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn duplicate_hash_same_project() {
        let (queue, user) = queue();
        let project = ProjectId::nil();
        queue.upload(upload(b"same", project, user)).await.unwrap();
        let second = queue.upload(upload(b"same", project, user)).await.unwrap();
        assert_eq!(second.status, IntakeStatus::Duplicate);
    }

    #[tokio::test]
    async fn same_hash_different_project_is_fine() {
        let (queue, user) = queue();
        queue
            .upload(upload(b"same", ProjectId::new(), user))
            .await
            .unwrap();
        let second = queue
            .upload(upload(b"same", ProjectId::new(), user))
            .await
            .unwrap();
        assert_eq!(second.status, IntakeStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_intake_does_not_block_rehash() {
        let (queue, user) = queue();
        let project = ProjectId::nil();
        let first = queue.upload(upload(b"same", project, user)).await.unwrap();
        queue
            .mark_rejected(user, first.id, "bad scan".into())
            .await
            .unwrap();
        let second = queue.upload(upload(b"same", project, user)).await.unwrap();
        assert_eq!(second.status, IntakeStatus::Pending);
    }

    #[tokio::test]
    async fn transition_table_enforced() {
        let (queue, user) = queue();
        let record = queue
            .upload(upload(b"x", ProjectId::nil(), user))
            .await
            .unwrap();
        // pending -> ready skips processing.
        let err = queue
            .transition(record.id, IntakeStatus::Ready, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, sl_error::ErrorKind::BusinessRule);
        queue
            .transition(record.id, IntakeStatus::Processing, None)
            .await
            .unwrap();
        queue
            .transition(record.id, IntakeStatus::Ready, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn only_one_terminal_transition() {
        let (queue, user) = queue();
        let record = queue
            .upload(upload(b"x", ProjectId::nil(), user))
            .await
            .unwrap();
        queue
            .mark_rejected(user, record.id, "dupe".into())
            .await
            .unwrap();
        let err = queue
            .transition(record.id, IntakeStatus::Error, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, sl_error::ErrorKind::BusinessRule);
    }

    #[tokio::test]
    async fn link_requires_expenses() {
        let (queue, user) = queue();
        let record = queue
            .upload(upload(b"x", ProjectId::nil(), user))
            .await
            .unwrap();
        queue
            .transition(record.id, IntakeStatus::Processing, None)
            .await
            .unwrap();
        queue
            .transition(record.id, IntakeStatus::Ready, None)
            .await
            .unwrap();
        assert!(queue.link(record.id, vec![]).await.is_err());
        let linked = queue
            .link(record.id, vec![ExpenseId::new()])
            .await
            .unwrap();
        assert_eq!(linked.status, IntakeStatus::Linked);
        assert!(linked.link_invariant_holds());
    }

    #[tokio::test]
    async fn field_duplicate_detection() {
        let (queue, user) = queue();
        let project = ProjectId::nil();

        let first = queue.upload(upload(b"one", project, user)).await.unwrap();
        queue
            .transition(first.id, IntakeStatus::Processing, None)
            .await
            .unwrap();
        queue
            .attach_parse(first.id, parsed("Home Depot", "17.82", (2026, 3, 10)), None)
            .await
            .unwrap();
        queue
            .transition(first.id, IntakeStatus::Ready, None)
            .await
            .unwrap();

        // Different bytes, same parsed fields.
        let second = queue.upload(upload(b"two", project, user)).await.unwrap();
        queue
            .transition(second.id, IntakeStatus::Processing, None)
            .await
            .unwrap();
        queue
            .attach_parse(second.id, parsed("HOME DEPOT", "17.82", (2026, 3, 10)), None)
            .await
            .unwrap();
        assert!(queue.field_duplicate_exists(second.id).await.unwrap());

        // A different total is not a duplicate.
        let third = queue.upload(upload(b"three", project, user)).await.unwrap();
        queue
            .transition(third.id, IntakeStatus::Processing, None)
            .await
            .unwrap();
        queue
            .attach_parse(third.id, parsed("Home Depot", "18.00", (2026, 3, 10)), None)
            .await
            .unwrap();
        assert!(!queue.field_duplicate_exists(third.id).await.unwrap());
    }
}
