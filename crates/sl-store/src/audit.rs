// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handler for deferred audit-row jobs.

use crate::store::ExpenseStore;
use async_trait::async_trait;
use sl_core::{ChangeLogRow, StatusLogRow};
use sl_error::{CoreError, CoreResult};
use sl_jobs::{Job, JobHandler, JobKind};

/// Applies `write_change_log` and `write_status_log` job payloads back into
/// the store's append-only streams.
pub struct AuditJobHandler {
    store: ExpenseStore,
}

impl AuditJobHandler {
    /// Wrap a store handle.
    #[must_use]
    pub fn new(store: ExpenseStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for AuditJobHandler {
    async fn handle(&self, job: &Job) -> CoreResult<()> {
        let rows = job
            .payload
            .get("rows")
            .cloned()
            .ok_or_else(|| CoreError::validation("audit job payload missing rows"))?;
        match job.kind {
            JobKind::WriteChangeLog => {
                let rows: Vec<ChangeLogRow> = serde_json::from_value(rows)
                    .map_err(|e| CoreError::validation(format!("bad change rows: {e}")))?;
                self.store.apply_change_rows(rows).await;
                Ok(())
            }
            JobKind::WriteStatusLog => {
                let rows: Vec<StatusLogRow> = serde_json::from_value(rows)
                    .map_err(|e| CoreError::validation(format!("bad status rows: {e}")))?;
                self.store.apply_status_rows(rows).await;
                Ok(())
            }
            other => Err(CoreError::validation(format!(
                "audit handler cannot run {other}"
            ))),
        }
    }
}
