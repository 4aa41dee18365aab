// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-daemon
#![deny(unsafe_code)]

/// Background job handler wiring.
pub mod jobs;
/// Middleware: request ids, logging, rate limiting, CORS.
pub mod middleware;
/// Application state and component wiring.
pub mod state;

pub use state::AppState;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path as AxPath, Query, State},
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sl_agents::{AgentEvent, AgentKind, DispatchOutcome};
use sl_core::{
    BatchId, ChannelKey, ExpenseFilter, ExpenseId, ExpensePatch, ExpenseStatus, IntakeId,
    MessageId, NewExpense, PageRequest, ProjectId, ReportId, UserId,
};
use sl_error::{CoreError, ErrorKind};
use sl_intake::UploadRequest;
use sl_jobs::Orchestrator;
use sl_store::SummaryGroupBy;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error plumbing
// ---------------------------------------------------------------------------

/// HTTP-facing wrapper over [`CoreError`].
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self
            .0
            .context
            .get("payload_too_large")
            .is_some_and(|v| v == &json!(true))
        {
            StatusCode::PAYLOAD_TOO_LARGE
        } else {
            StatusCode::from_u16(self.0.kind.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        };
        if self.0.kind == ErrorKind::Internal {
            error!(error = %self.0, "internal error");
        }
        (status, Json(self.0.to_wire())).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

/// The resolved acting user, available as an extension on authorized routes.
#[derive(Debug, Clone, Copy)]
pub struct ActingUser(pub UserId);

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let path = req.uri().path();
    if path == "/health" || path == "/auth/login" {
        return next.run(req).await;
    }
    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(token) = token else {
        return ApiError(CoreError::new(
            ErrorKind::Unauthenticated,
            "missing bearer token",
        ))
        .into_response();
    };
    match state.tokens.validate(token) {
        Ok(user) => {
            req.extensions_mut().insert(ActingUser(user));
            next.run(req).await
        }
        Err(err) => ApiError(CoreError::new(ErrorKind::Unauthenticated, err.to_string()))
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the Axum router with all daemon routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    let limiter = middleware::RateLimiter::new(600, Duration::from_secs(60));
    Router::new()
        .route("/health", get(cmd_health))
        .route("/auth/login", post(cmd_login))
        .route("/expenses", get(cmd_list_expenses).post(cmd_create_expense))
        .route("/expenses/batch", post(cmd_create_batch))
        .route("/expenses/summary", get(cmd_summaries))
        .route(
            "/expenses/{id}",
            get(cmd_get_expense)
                .patch(cmd_patch_expense)
                .delete(cmd_soft_delete),
        )
        .route("/expenses/{id}/status", post(cmd_set_status))
        .route("/receipts", get(cmd_list_receipts).post(cmd_upload_receipt))
        .route("/receipts/{id}", get(cmd_get_receipt))
        .route("/receipts/{id}/process", post(cmd_process_receipt))
        .route("/receipts/{id}/expenses", post(cmd_create_from_receipt))
        .route("/receipts/{id}/reject", post(cmd_reject_receipt))
        .route("/reconcile/{id}", post(cmd_reconcile))
        .route("/autoauth/run", post(cmd_run_autoauth))
        .route("/reports/{id}", get(cmd_get_report))
        .route("/audit/reconciliation", get(cmd_audit_reconciliation))
        .route("/classifier/retrain", post(cmd_retrain_classifier))
        .route("/messages", post(cmd_post_message))
        .route("/messages/unread_counts", get(cmd_unread_counts))
        .route("/agents/events", post(cmd_agent_event))
        .layer(from_fn_with_state(Arc::clone(&state), auth_middleware))
        .layer(from_fn(middleware::request_id_middleware))
        .layer(from_fn(middleware::RequestLogger::layer))
        .layer(from_fn_with_state(
            limiter,
            middleware::RateLimiter::middleware,
        ))
        .layer(middleware::cors_layer())
        .layer(DefaultBodyLimit::max(
            state.config.max_upload_bytes + 64 * 1024,
        ))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health and auth
// ---------------------------------------------------------------------------

async fn cmd_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn cmd_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = state
        .gate
        .login(&req.email, &req.password, &state.tokens)
        .await
        .ok_or_else(|| CoreError::new(ErrorKind::Unauthenticated, "bad credentials"))?;
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// Expenses
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    project: Option<ProjectId>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    status: Option<ExpenseStatus>,
    vendor: Option<sl_core::VendorId>,
    account: Option<sl_core::AccountId>,
    page: Option<usize>,
    size: Option<usize>,
}

impl ListQuery {
    fn filter(&self) -> ExpenseFilter {
        ExpenseFilter {
            project: self.project,
            from: self.from,
            to: self.to,
            status: self.status,
            vendor: self.vendor,
            account: self.account,
        }
    }

    fn page(&self) -> PageRequest {
        let mut request = PageRequest::first(self.size.unwrap_or(sl_core::page::DEFAULT_PAGE_SIZE));
        request.page = self.page.unwrap_or(1).max(1);
        request
    }
}

/// Queue the derived-data maintenance that follows a qualifying expense
/// write: affinity recompute for the vendor, and cache invalidation when
/// the account assignment changed.
fn queue_vendor_maintenance(state: &AppState, expense: &sl_core::Expense, account_changed: bool) {
    if let Some(vendor) = expense.vendor {
        if expense.account.is_some() {
            let _ = state.jobs.enqueue(
                sl_jobs::JobKind::RefreshAffinity,
                json!({ "vendor": vendor }),
            );
        }
        if account_changed {
            let _ = state.jobs.enqueue(
                sl_jobs::JobKind::InvalidateCacheForVendor,
                json!({ "vendor": vendor }),
            );
        }
    }
}

async fn cmd_list_expenses(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let page = state.store.list(user, &query.filter(), query.page()).await?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
struct ExpenseCreated {
    id: ExpenseId,
    version_token: Uuid,
}

async fn cmd_create_expense(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    Json(new): Json<NewExpense>,
) -> ApiResult<impl IntoResponse> {
    let id = state.store.create(user, new).await?;
    let expense = state.store.get(user, id).await?;
    queue_vendor_maintenance(&state, &expense, false);
    Ok(Json(ExpenseCreated {
        id,
        version_token: expense.version_token,
    }))
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    items: Vec<NewExpense>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn cmd_create_batch(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<impl IntoResponse> {
    let ids = state
        .store
        .create_batch(user, req.items, req.idempotency_key)
        .await?;
    for id in &ids {
        if let Ok(expense) = state.store.get(user, *id).await {
            queue_vendor_maintenance(&state, &expense, false);
        }
    }
    Ok(Json(json!({ "ids": ids })))
}

async fn cmd_get_expense(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    AxPath(id): AxPath<ExpenseId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.get(user, id).await?))
}

async fn cmd_patch_expense(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    AxPath(id): AxPath<ExpenseId>,
    Json(patch): Json<ExpensePatch>,
) -> ApiResult<impl IntoResponse> {
    let account_changed = patch.account.is_some();
    let expense = state.store.update(user, id, patch).await?;
    queue_vendor_maintenance(&state, &expense, account_changed);
    Ok(Json(ExpenseCreated {
        id,
        version_token: expense.version_token,
    }))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: ExpenseStatus,
    #[serde(default)]
    reason: Option<String>,
    version_token: Uuid,
}

async fn cmd_set_status(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    AxPath(id): AxPath<ExpenseId>,
    Json(req): Json<StatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let expense = state
        .store
        .set_status(user, id, req.status, req.reason, req.version_token)
        .await?;
    Ok(Json(json!({
        "id": id,
        "status": expense.status,
        "version_token": expense.version_token,
    })))
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    reason: String,
}

async fn cmd_soft_delete(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    AxPath(id): AxPath<ExpenseId>,
    Json(req): Json<DeleteRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.soft_delete(user, id, req.reason).await?))
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    group_by: SummaryGroupBy,
    project: Option<ProjectId>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    status: Option<ExpenseStatus>,
}

async fn cmd_summaries(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    Query(query): Query<SummaryQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = ExpenseFilter {
        project: query.project,
        from: query.from,
        to: query.to,
        status: query.status,
        ..Default::default()
    };
    let report = state.store.summaries(user, &filter, query.group_by).await?;
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

async fn cmd_upload_receipt(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let mut bytes: Option<Vec<u8>> = None;
    let mut mime_type = "application/octet-stream".to_string();
    let mut project: Option<ProjectId> = None;
    let mut declared_text: Option<String> = None;
    let mut batch: Option<BatchId> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CoreError::validation(format!("bad multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                if let Some(content_type) = field.content_type() {
                    mime_type = content_type.to_string();
                }
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| CoreError::validation(format!("bad file field: {e}")))?
                        .to_vec(),
                );
            }
            "project" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| CoreError::validation(format!("bad project field: {e}")))?;
                project = Some(
                    raw.parse()
                        .map_err(|_| CoreError::validation("project must be a UUID"))?,
                );
            }
            "declared_text" => {
                declared_text = Some(field.text().await.map_err(|e| {
                    CoreError::validation(format!("bad declared_text field: {e}"))
                })?);
            }
            "batch" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| CoreError::validation(format!("bad batch field: {e}")))?;
                batch = raw.parse().ok();
            }
            _ => {}
        }
    }

    let bytes = bytes.ok_or_else(|| CoreError::validation("missing file field"))?;
    let project = project.ok_or_else(|| CoreError::validation("missing project field"))?;
    let record = state
        .intake
        .queue()
        .upload(UploadRequest {
            bytes,
            mime_type,
            project,
            uploader: user,
            batch,
            declared_text,
        })
        .await?;
    Ok(Json(json!({
        "intake_id": record.id,
        "hash": record.file_hash,
        "status": record.status,
    })))
}

#[derive(Debug, Deserialize)]
struct ReceiptListQuery {
    project: ProjectId,
}

async fn cmd_list_receipts(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    Query(query): Query<ReceiptListQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .intake
            .queue()
            .list_project(user, query.project)
            .await?,
    ))
}

async fn cmd_get_receipt(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    AxPath(id): AxPath<IntakeId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.intake.queue().get(user, id).await?))
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    #[serde(default = "default_stage")]
    stage: String,
}

fn default_stage() -> String {
    "general".to_string()
}

async fn cmd_process_receipt(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    AxPath(id): AxPath<IntakeId>,
    Json(req): Json<ProcessRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = state.intake.process(user, id, &req.stage).await?;
    // Fresh expenses mean fresh auto-auth work for the project.
    let _ = state.jobs.enqueue(
        sl_jobs::JobKind::TriggerAutoAuth,
        json!({ "project": record.project }),
    );
    Ok(Json(record))
}

async fn cmd_create_from_receipt(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    AxPath(id): AxPath<IntakeId>,
    Json(req): Json<ProcessRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = state.intake.queue().get(user, id).await?;
    let corrections: Vec<sl_categorize::Correction> = state
        .store
        .recent_account_corrections(record.project, 5)
        .await
        .into_iter()
        .filter_map(|(description, account)| {
            state
                .accounts
                .iter()
                .find(|a| a.id == account)
                .map(|a| sl_categorize::Correction {
                    description,
                    account_name: a.name.clone(),
                })
        })
        .collect();
    let outcome = state
        .intake
        .create_expenses(user, id, &req.stage, &state.accounts, &corrections)
        .await?;
    for expense_id in &outcome.created {
        if let Ok(expense) = state.store.get(user, *expense_id).await {
            queue_vendor_maintenance(&state, &expense, false);
        }
    }
    let _ = state.jobs.enqueue(
        sl_jobs::JobKind::TriggerAutoAuth,
        json!({ "project": outcome.intake.project }),
    );
    let status = if outcome.skipped > 0 && !outcome.created.is_empty() {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

async fn cmd_reject_receipt(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    AxPath(id): AxPath<IntakeId>,
    Json(req): Json<DeleteRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .intake
            .queue()
            .mark_rejected(user, id, req.reason)
            .await?,
    ))
}

async fn cmd_reconcile(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    AxPath(id): AxPath<IntakeId>,
) -> ApiResult<impl IntoResponse> {
    require(&state, user, sl_auth::Module::Receipts, sl_auth::Action::Update).await?;
    let suggestion = state.reconciler.reconcile(id).await?;
    Ok(Json(json!({ "suggestion": suggestion })))
}

// ---------------------------------------------------------------------------
// Auto-auth
// ---------------------------------------------------------------------------

async fn require(
    state: &AppState,
    user: UserId,
    module: sl_auth::Module,
    action: sl_auth::Action,
) -> Result<(), ApiError> {
    if state.gate.capability(user, module, action).await {
        Ok(())
    } else {
        Err(ApiError(CoreError::unauthorized(format!(
            "user {user} lacks {module:?}.{action:?}"
        ))))
    }
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    project: ProjectId,
    #[serde(default)]
    run_id: Option<Uuid>,
}

async fn cmd_run_autoauth(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    Json(req): Json<RunRequest>,
) -> ApiResult<impl IntoResponse> {
    require(&state, user, sl_auth::Module::AutoAuth, sl_auth::Action::Create).await?;
    let run_id = req.run_id.unwrap_or_else(Uuid::new_v4);
    let report = state.autoauth.run(req.project, None, run_id).await?;
    Ok(Json(json!({
        "report_id": report.id,
        "run_id": report.run_id,
        "scanned": report.scanned,
        "authorized": report.count(sl_autoauth::Decision::Authorized),
        "duplicates": report.count(sl_autoauth::Decision::Duplicate),
        "missing_info": report.count(sl_autoauth::Decision::MissingInfo),
        "escalated": report.count(sl_autoauth::Decision::Escalated),
    })))
}

/// Force a classifier rebuild, independent of the retrain cadence.
async fn cmd_retrain_classifier(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
) -> ApiResult<impl IntoResponse> {
    require(&state, user, sl_auth::Module::AutoAuth, sl_auth::Action::Create).await?;
    let examples = retrain_classifier(&state).await?;
    Ok(Json(json!({
        "examples": examples,
        "version": state.categorization.classifier().version(),
    })))
}

async fn cmd_audit_reconciliation(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
) -> ApiResult<impl IntoResponse> {
    require(&state, user, sl_auth::Module::Reports, sl_auth::Action::Read).await?;
    Ok(Json(state.store.reconcile_audit().await))
}

async fn cmd_get_report(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    AxPath(id): AxPath<ReportId>,
) -> ApiResult<impl IntoResponse> {
    require(&state, user, sl_auth::Module::Reports, sl_auth::Action::Read).await?;
    let report = state
        .autoauth
        .report(id)
        .await
        .ok_or_else(|| CoreError::not_found("report", id))?;
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// Messages and agents
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    channel_key: String,
    body: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    reply_to: Option<MessageId>,
    #[serde(default)]
    mentions: Vec<UserId>,
}

async fn cmd_post_message(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    Json(req): Json<PostMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let channel = ChannelKey::parse(&req.channel_key)
        .map_err(|e| CoreError::validation(e.to_string()))?;
    let message = state
        .hub
        .post(sl_chat::PostMessage {
            channel,
            author: sl_chat::Author::User { id: user },
            body: req.body,
            blocks: vec![],
            metadata: req.metadata.unwrap_or_else(|| json!({})),
            mentions: req.mentions,
            reply_to: req.reply_to,
        })
        .await?;
    Ok(Json(message))
}

async fn cmd_unread_counts(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.hub.unread_counts(user).await?))
}

#[derive(Debug, Deserialize)]
struct AgentEventRequest {
    channel_key: String,
    agent: AgentKind,
    text: String,
}

async fn cmd_agent_event(
    State(state): State<Arc<AppState>>,
    axum::Extension(ActingUser(user)): axum::Extension<ActingUser>,
    Json(req): Json<AgentEventRequest>,
) -> ApiResult<impl IntoResponse> {
    let channel = ChannelKey::parse(&req.channel_key)
        .map_err(|e| CoreError::validation(e.to_string()))?;
    let outcome = state
        .dispatcher
        .dispatch(AgentEvent {
            user,
            channel,
            target: req.agent,
            text: req.text,
            at: chrono::Utc::now(),
        })
        .await?;
    Ok(Json(match outcome {
        DispatchOutcome::Suppressed => json!({ "outcome": "suppressed" }),
        DispatchOutcome::Replied { message } => {
            json!({ "outcome": "replied", "message_id": message })
        }
    }))
}

// ---------------------------------------------------------------------------
// Background loop
// ---------------------------------------------------------------------------

/// Drive the background orchestrator: drain jobs continuously and schedule
/// digest flushes on the configured cadence.
pub fn spawn_background(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let mut orchestrator = Orchestrator::new(state.jobs.clone());
    jobs::register_handlers(&mut orchestrator, Arc::clone(&state));
    tokio::spawn(async move {
        let mut drain = interval(Duration::from_secs(1));
        let mut digest = interval(Duration::from_secs(
            state.config.digest_interval_hours.max(1) * 3600,
        ));
        let mut retrain = interval(Duration::from_secs(
            state.config.retrain_interval_hours.max(1) * 3600,
        ));
        // The first interval tick fires immediately; skip the slow ones.
        digest.tick().await;
        retrain.tick().await;
        loop {
            tokio::select! {
                _ = drain.tick() => {
                    orchestrator.run_until_idle().await;
                }
                _ = digest.tick() => {
                    for project in state.autoauth.projects_with_pending_digests().await {
                        let _ = state.jobs.enqueue(
                            sl_jobs::JobKind::SendChatDigest,
                            json!({ "project": project }),
                        );
                    }
                    let _ = state
                        .jobs
                        .enqueue(sl_jobs::JobKind::CleanupCacheTombstones, json!({}));
                }
                _ = retrain.tick() => {
                    if state.categorization.classifier().needs_retrain(
                        state.config.retrain_interval_hours,
                    ) && let Err(err) = retrain_classifier(&state).await {
                        error!(error = %err, "classifier retrain failed");
                    }
                }
            }
        }
    })
}

/// Rebuild the classifier from human-verified ledger assignments.
///
/// Returns the number of training examples used. Called on the retrain
/// cadence by the background loop and on demand via the HTTP trigger.
async fn retrain_classifier(state: &Arc<AppState>) -> Result<usize, CoreError> {
    let bot = state.bot;
    let expenses = sl_core::page::collect_all_pages(
        sl_core::page::DEFAULT_PAGE_SIZE,
        |req| async move {
            state
                .store
                .list(bot, &ExpenseFilter::default(), req)
                .await
        },
    )
    .await?;
    let examples: Vec<sl_categorize::TrainingExample> = expenses
        .into_iter()
        .filter(|e| {
            e.categorization_source
                .is_some_and(|source| source.is_human_verified())
                && e.confidence.is_some_and(|c| c >= 90)
        })
        .filter_map(|e| {
            e.account.map(|account| sl_categorize::TrainingExample {
                description: e.description,
                stage: String::new(),
                account,
            })
        })
        .collect();
    if !examples.is_empty() {
        state.categorization.classifier().train(&examples);
    }
    Ok(examples.len())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
