// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-jobs
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sl_core::JobId;
use sl_error::{CoreError, CoreResult};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Maximum execution attempts before a job is dead-lettered.
pub const MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// The closed set of background jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Append deferred change-log rows for an expense mutation.
    WriteChangeLog,
    /// Append deferred status-log rows for an expense transition.
    WriteStatusLog,
    /// Run auto-authorization for a project after an expense insert.
    TriggerAutoAuth,
    /// Recompute a vendor's account affinity histogram.
    RefreshAffinity,
    /// Drop categorization cache entries for a vendor.
    InvalidateCacheForVendor,
    /// Flush the pending auto-auth digest for a project.
    SendChatDigest,
    /// Sweep expired categorization cache entries.
    CleanupCacheTombstones,
}

impl JobKind {
    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WriteChangeLog => "write_change_log",
            Self::WriteStatusLog => "write_status_log",
            Self::TriggerAutoAuth => "trigger_auto_auth",
            Self::RefreshAffinity => "refresh_affinity",
            Self::InvalidateCacheForVendor => "invalidate_cache_for_vendor",
            Self::SendChatDigest => "send_chat_digest",
            Self::CleanupCacheTombstones => "cleanup_cache_tombstones",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One unit of deferred work.
///
/// Payloads reference entities by id or blob key — never by value — so the
/// queue never pins large buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier; the at-most-once key.
    pub id: JobId,
    /// Which handler runs this job.
    pub kind: JobKind,
    /// Structured payload of ids and keys.
    pub payload: serde_json::Value,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// Errors from [`JobQueue`] operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue has reached its maximum capacity.
    #[error("job queue is full (max {max})")]
    Full {
        /// Maximum number of queued jobs.
        max: usize,
    },
    /// A job with this id was already enqueued or executed.
    #[error("duplicate job id: {0}")]
    DuplicateId(JobId),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Final outcome of a job's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// The job's handler returned success.
    Succeeded,
    /// All attempts failed; the job moved to the dead-letter table.
    DeadLettered,
}

/// Per-job success/failure record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// The job id.
    pub job_id: JobId,
    /// The job kind.
    pub kind: JobKind,
    /// Attempts consumed.
    pub attempts: u32,
    /// Final outcome.
    pub outcome: JobOutcome,
    /// Message of the last failure, when any attempt failed.
    pub last_error: Option<String>,
    /// When the record was written.
    pub finished_at: DateTime<Utc>,
}

/// A job that exhausted its attempts, parked for manual review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The failed job.
    pub job: Job,
    /// Attempts consumed.
    pub attempts: u32,
    /// Message of the final failure.
    pub last_error: String,
    /// When the job was parked.
    pub parked_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// JobHandler
// ---------------------------------------------------------------------------

/// Implemented by each component that owns a job kind.
///
/// Handler bodies must be idempotent: the queue guarantees at-most-once
/// execution per job id, but a retried attempt re-runs the body.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job.
    async fn handle(&self, job: &Job) -> CoreResult<()>;
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Job>,
    seen: HashSet<JobId>,
    records: Vec<JobRecord>,
    dead_letters: Vec<DeadLetter>,
}

/// A bounded queue of named jobs with at-most-once admission per id.
#[derive(Clone)]
pub struct JobQueue {
    state: Arc<Mutex<QueueState>>,
    max_size: usize,
}

impl JobQueue {
    /// Create a queue with the given capacity.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            max_size,
        }
    }

    /// Enqueue a job with a fresh id.
    pub fn enqueue(&self, kind: JobKind, payload: serde_json::Value) -> Result<JobId, QueueError> {
        self.enqueue_with_id(JobId::new(), kind, payload)
    }

    /// Enqueue a job under a caller-supplied id.
    ///
    /// A repeated id is rejected — this is the at-most-once guarantee that
    /// lets callers safely retry their own enqueue calls.
    pub fn enqueue_with_id(
        &self,
        id: JobId,
        kind: JobKind,
        payload: serde_json::Value,
    ) -> Result<JobId, QueueError> {
        let mut state = self.state.lock().expect("job queue lock poisoned");
        if state.pending.len() >= self.max_size {
            return Err(QueueError::Full { max: self.max_size });
        }
        if !state.seen.insert(id) {
            return Err(QueueError::DuplicateId(id));
        }
        state.pending.push_back(Job {
            id,
            kind,
            payload,
            enqueued_at: Utc::now(),
        });
        Ok(id)
    }

    /// Number of jobs waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("job queue lock poisoned").pending.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All per-job records written so far.
    #[must_use]
    pub fn records(&self) -> Vec<JobRecord> {
        self.state
            .lock()
            .expect("job queue lock poisoned")
            .records
            .clone()
    }

    /// The dead-letter table.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state
            .lock()
            .expect("job queue lock poisoned")
            .dead_letters
            .clone()
    }

    fn pop(&self) -> Option<Job> {
        self.state
            .lock()
            .expect("job queue lock poisoned")
            .pending
            .pop_front()
    }

    fn finish(&self, record: JobRecord, dead_letter: Option<DeadLetter>) {
        let mut state = self.state.lock().expect("job queue lock poisoned");
        state.records.push(record);
        if let Some(dl) = dead_letter {
            state.dead_letters.push(dl);
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Dispatches queued jobs to registered handlers with retry and backoff.
pub struct Orchestrator {
    queue: JobQueue,
    handlers: BTreeMap<JobKind, Arc<dyn JobHandler>>,
    backoff_base: Duration,
}

impl Orchestrator {
    /// Create an orchestrator over the given queue.
    #[must_use]
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            handlers: BTreeMap::new(),
            backoff_base: Duration::from_millis(250),
        }
    }

    /// Override the backoff base delay (tests use a small value).
    #[must_use]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Register the handler for a job kind, replacing any previous one.
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// The underlying queue handle.
    #[must_use]
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Process queued jobs until the queue is empty.
    ///
    /// Each job gets up to [`MAX_ATTEMPTS`] tries with exponential backoff;
    /// `validation` and `business_rule` failures are terminal on the first
    /// attempt. Returns the number of jobs processed.
    pub async fn run_until_idle(&self) -> usize {
        let mut processed = 0;
        while let Some(job) = self.queue.pop() {
            self.run_job(job).await;
            processed += 1;
        }
        processed
    }

    async fn run_job(&self, job: Job) {
        let Some(handler) = self.handlers.get(&job.kind) else {
            error!(job = %job.kind, id = %job.id, "no handler registered");
            self.queue.finish(
                JobRecord {
                    job_id: job.id,
                    kind: job.kind,
                    attempts: 0,
                    outcome: JobOutcome::DeadLettered,
                    last_error: Some("no handler registered".into()),
                    finished_at: Utc::now(),
                },
                Some(DeadLetter {
                    attempts: 0,
                    last_error: "no handler registered".into(),
                    parked_at: Utc::now(),
                    job,
                }),
            );
            return;
        };

        let mut last_error: Option<CoreError> = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match handler.handle(&job).await {
                Ok(()) => {
                    info!(job = %job.kind, id = %job.id, attempt, "job succeeded");
                    self.queue.finish(
                        JobRecord {
                            job_id: job.id,
                            kind: job.kind,
                            attempts: attempt,
                            outcome: JobOutcome::Succeeded,
                            last_error: last_error.as_ref().map(|e| e.to_string()),
                            finished_at: Utc::now(),
                        },
                        None,
                    );
                    return;
                }
                Err(err) => {
                    let terminal = err.kind.is_terminal_for_jobs();
                    warn!(
                        job = %job.kind,
                        id = %job.id,
                        attempt,
                        error = %err,
                        terminal,
                        "job attempt failed"
                    );
                    let stop = terminal || attempt == MAX_ATTEMPTS;
                    last_error = Some(err);
                    if stop {
                        break;
                    }
                    tokio::time::sleep(self.backoff_base * 2u32.pow(attempt - 1)).await;
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".into());
        error!(job = %job.kind, id = %job.id, error = %message, "job dead-lettered");
        self.queue.finish(
            JobRecord {
                job_id: job.id,
                kind: job.kind,
                attempts: MAX_ATTEMPTS,
                outcome: JobOutcome::DeadLettered,
                last_error: Some(message.clone()),
                finished_at: Utc::now(),
            },
            Some(DeadLetter {
                attempts: MAX_ATTEMPTS,
                last_error: message,
                parked_at: Utc::now(),
                job,
            }),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sl_error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
        error_kind: ErrorKind,
    }

    impl CountingHandler {
        fn new(fail_first: u32, error_kind: ErrorKind) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first,
                error_kind,
            })
        }
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> CoreResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(CoreError::new(self.error_kind, "induced failure"))
            } else {
                Ok(())
            }
        }
    }

    fn orchestrator(handler: Arc<CountingHandler>) -> Orchestrator {
        let mut orch = Orchestrator::new(JobQueue::new(16))
            .with_backoff_base(Duration::from_millis(1));
        orch.register(JobKind::RefreshAffinity, handler);
        orch
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let queue = JobQueue::new(4);
        let id = JobId::new();
        queue
            .enqueue_with_id(id, JobKind::SendChatDigest, serde_json::json!({}))
            .unwrap();
        assert!(matches!(
            queue.enqueue_with_id(id, JobKind::SendChatDigest, serde_json::json!({})),
            Err(QueueError::DuplicateId(_))
        ));
    }

    #[test]
    fn full_queue_rejects() {
        let queue = JobQueue::new(1);
        queue
            .enqueue(JobKind::SendChatDigest, serde_json::json!({}))
            .unwrap();
        assert!(matches!(
            queue.enqueue(JobKind::SendChatDigest, serde_json::json!({})),
            Err(QueueError::Full { max: 1 })
        ));
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let handler = CountingHandler::new(0, ErrorKind::Internal);
        let orch = orchestrator(Arc::clone(&handler));
        orch.queue()
            .enqueue(JobKind::RefreshAffinity, serde_json::json!({"vendor": "v1"}))
            .unwrap();
        assert_eq!(orch.run_until_idle().await, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let records = orch.queue().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, JobOutcome::Succeeded);
        assert!(orch.queue().dead_letters().is_empty());
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let handler = CountingHandler::new(2, ErrorKind::UpstreamTimeout);
        let orch = orchestrator(Arc::clone(&handler));
        orch.queue()
            .enqueue(JobKind::RefreshAffinity, serde_json::json!({}))
            .unwrap();
        orch.run_until_idle().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let records = orch.queue().records();
        assert_eq!(records[0].outcome, JobOutcome::Succeeded);
        assert_eq!(records[0].attempts, 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_dead_letter() {
        let handler = CountingHandler::new(10, ErrorKind::Internal);
        let orch = orchestrator(Arc::clone(&handler));
        orch.queue()
            .enqueue(JobKind::RefreshAffinity, serde_json::json!({}))
            .unwrap();
        orch.run_until_idle().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
        let dead = orch.queue().dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn validation_failure_is_terminal_immediately() {
        let handler = CountingHandler::new(10, ErrorKind::Validation);
        let orch = orchestrator(Arc::clone(&handler));
        orch.queue()
            .enqueue(JobKind::RefreshAffinity, serde_json::json!({}))
            .unwrap();
        orch.run_until_idle().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.queue().dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn missing_handler_dead_letters() {
        let orch = Orchestrator::new(JobQueue::new(4));
        orch.queue()
            .enqueue(JobKind::CleanupCacheTombstones, serde_json::json!({}))
            .unwrap();
        orch.run_until_idle().await;
        let dead = orch.queue().dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error, "no handler registered");
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(JobKind::WriteChangeLog.as_str(), "write_change_log");
        assert_eq!(
            JobKind::InvalidateCacheForVendor.as_str(),
            "invalidate_cache_for_vendor"
        );
    }
}
