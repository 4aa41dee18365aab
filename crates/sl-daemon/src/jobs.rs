// SPDX-License-Identifier: MIT OR Apache-2.0
//! Background job handlers wiring the orchestrator to the components.

use crate::state::AppState;
use async_trait::async_trait;
use serde_json::Value;
use sl_core::{ProjectId, VendorId, page::DEFAULT_PAGE_SIZE};
use sl_error::{CoreError, CoreResult};
use sl_jobs::{Job, JobHandler, JobKind, Orchestrator};
use std::sync::Arc;
use tracing::info;

/// Runs `trigger_auto_auth` jobs: payload `{ "project": "<uuid>" }`.
pub struct TriggerAutoAuthHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl JobHandler for TriggerAutoAuthHandler {
    async fn handle(&self, job: &Job) -> CoreResult<()> {
        let project = payload_project(&job.payload)?;
        // The job id doubles as the run id, so a redelivered job can never
        // double a digest.
        self.state.autoauth.run(project, None, job.id.0).await?;
        Ok(())
    }
}

/// Runs `send_chat_digest` jobs: payload `{ "project": "<uuid>" }`.
pub struct SendChatDigestHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl JobHandler for SendChatDigestHandler {
    async fn handle(&self, job: &Job) -> CoreResult<()> {
        let project = payload_project(&job.payload)?;
        self.state.autoauth.flush_digest(project).await?;
        Ok(())
    }
}

/// Runs `refresh_affinity` jobs: payload `{ "vendor": "<uuid>" }`.
///
/// Recomputes the vendor histogram from a full scan of the expense ledger —
/// the affinity source of truth.
pub struct RefreshAffinityHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl JobHandler for RefreshAffinityHandler {
    async fn handle(&self, job: &Job) -> CoreResult<()> {
        let vendor = payload_vendor(&job.payload)?;
        let filter = sl_core::ExpenseFilter {
            vendor: Some(vendor),
            ..Default::default()
        };
        let bot = self.state.bot;
        let expenses = sl_core::page::collect_all_pages(DEFAULT_PAGE_SIZE, |req| {
            let filter = filter.clone();
            async move { self.state.store.list(bot, &filter, req).await }
        })
        .await?;
        let assignments = expenses.into_iter().filter_map(|e| e.account);
        self.state
            .categorization
            .affinity()
            .recompute(vendor, assignments);
        Ok(())
    }
}

/// Runs `invalidate_cache_for_vendor` jobs: payload `{ "vendor": "<uuid>" }`.
pub struct InvalidateCacheHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl JobHandler for InvalidateCacheHandler {
    async fn handle(&self, job: &Job) -> CoreResult<()> {
        let vendor = payload_vendor(&job.payload)?;
        let removed = self
            .state
            .categorization
            .cache()
            .invalidate_vendor(vendor);
        info!(%vendor, removed, "vendor cache entries invalidated");
        Ok(())
    }
}

/// Runs `cleanup_cache_tombstones` jobs (no payload).
pub struct CacheSweepHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl JobHandler for CacheSweepHandler {
    async fn handle(&self, _job: &Job) -> CoreResult<()> {
        let removed = self.state.categorization.cache().sweep();
        info!(removed, "cache sweep finished");
        Ok(())
    }
}

/// Register every job handler on the orchestrator.
pub fn register_handlers(orchestrator: &mut Orchestrator, state: Arc<AppState>) {
    orchestrator.register(
        JobKind::WriteChangeLog,
        Arc::new(sl_store::AuditJobHandler::new(state.store.clone())),
    );
    orchestrator.register(
        JobKind::WriteStatusLog,
        Arc::new(sl_store::AuditJobHandler::new(state.store.clone())),
    );
    orchestrator.register(
        JobKind::TriggerAutoAuth,
        Arc::new(TriggerAutoAuthHandler {
            state: Arc::clone(&state),
        }),
    );
    orchestrator.register(
        JobKind::SendChatDigest,
        Arc::new(SendChatDigestHandler {
            state: Arc::clone(&state),
        }),
    );
    orchestrator.register(
        JobKind::RefreshAffinity,
        Arc::new(RefreshAffinityHandler {
            state: Arc::clone(&state),
        }),
    );
    orchestrator.register(
        JobKind::InvalidateCacheForVendor,
        Arc::new(InvalidateCacheHandler {
            state: Arc::clone(&state),
        }),
    );
    orchestrator.register(
        JobKind::CleanupCacheTombstones,
        Arc::new(CacheSweepHandler { state }),
    );
}

fn payload_project(payload: &Value) -> CoreResult<ProjectId> {
    payload
        .get("project")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| CoreError::validation("job payload missing project"))
}

fn payload_vendor(payload: &Value) -> CoreResult<VendorId> {
    payload
        .get("vendor")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| CoreError::validation("job payload missing vendor"))
}
