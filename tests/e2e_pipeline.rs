// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios over the full in-process pipeline: upload → OCR →
//! categorization → expense creation → auto-authorization → chat.

use serde_json::json;
use sl_auth::{CapabilityGate, InMemoryRoleProvider, Role};
use sl_autoauth::{AutoAuthEngine, Decision, InMemoryBillProvider, InMemoryVendorDirectory, rules};
use sl_categorize::{
    AccountRef, AffinityIndex, CategorizationCache, CategorizationEngine, Classifier,
};
use sl_chat::{Author, MessageHub, NoopPushNotifier, PushNotifier};
use sl_config::SiteLedgerConfig;
use sl_core::{
    AccountId, ChannelKey, ExpensePatch, ExpenseStatus, IntakeStatus, Money, ProjectId,
    TotalMatchType, UserId, VendorId,
};
use sl_intake::{
    InMemoryBlobStore, InMemoryVendorResolver, IntakeQueue, IntakeService, UploadRequest,
    VendorResolver,
};
use sl_llm::{LlmGateway, MockGateway};
use sl_ocr::{OcrPipeline, PassthroughRasterizer};
use sl_reconcile::{DiscrepancyKind, Reconciler, SuggestionAction};
use sl_store::ExpenseStore;
use sl_telemetry::MetricsCollector;
use std::sync::Arc;
use uuid::Uuid;

const FRAMING_RECEIPT: &str = "\
THE HOME DEPOT #4512
2026-03-10
2x4 lumber x2        12.00
wood screws 1lb       4.50
TOTAL                16.50
";

const DRILL_RECEIPT: &str = "\
HARBOR FREIGHT TOOLS
2026-03-11
DeWalt 20V drill    199.00
TOTAL               199.00
";

const MISMATCH_RECEIPT: &str = "\
FERGUSON
2026-03-12
copper fittings     850.00
TOTAL              1048.05
";

struct Pipeline {
    service: Arc<IntakeService>,
    store: ExpenseStore,
    intakes: IntakeQueue,
    autoauth: Arc<AutoAuthEngine>,
    reconciler: Reconciler,
    hub: MessageHub,
    gateway: Arc<MockGateway>,
    accounts: Vec<AccountRef>,
    admin: UserId,
    bookkeeper: UserId,
    field: UserId,
    project: ProjectId,
}

fn pipeline() -> Pipeline {
    let provider = Arc::new(InMemoryRoleProvider::new());
    let admin = UserId::new();
    let bookkeeper = UserId::new();
    let field = UserId::new();
    let bot = UserId::new();
    provider.add_user(admin, "admin@x", "pw", Role::Admin);
    provider.add_user(bookkeeper, "books@x", "pw", Role::Bookkeeper);
    provider.add_user(field, "field@x", "pw", Role::Field);
    provider.add_user(bot, "bot@x", "pw", Role::Bot);
    let gate = Arc::new(CapabilityGate::new(provider));

    let config = SiteLedgerConfig::default();
    let gateway = Arc::new(MockGateway::new());
    let collector = MetricsCollector::new();
    let ocr = Arc::new(OcrPipeline::new(
        config.clone(),
        Arc::clone(&gateway) as Arc<dyn LlmGateway>,
        Arc::new(PassthroughRasterizer),
        collector.clone(),
    ));
    let categorization = Arc::new(CategorizationEngine::new(
        config.clone(),
        Arc::new(CategorizationCache::new(30)),
        Arc::new(AffinityIndex::new()),
        Arc::new(Classifier::new()),
        Arc::clone(&gateway) as Arc<dyn LlmGateway>,
        collector,
    ));
    let store = ExpenseStore::new(Arc::clone(&gate));
    let intakes = IntakeQueue::new(
        Arc::clone(&gate),
        Arc::new(InMemoryBlobStore::new()),
        config.max_upload_bytes,
    );
    let resolver = Arc::new(InMemoryVendorResolver::new());
    resolver.add("Home Depot", VendorId::new());
    resolver.add("Harbor Freight", VendorId::new());
    resolver.add("Ferguson", VendorId::new());
    let service = Arc::new(IntakeService::new(
        intakes.clone(),
        ocr,
        Arc::clone(&categorization),
        store.clone(),
        Arc::clone(&resolver) as Arc<dyn VendorResolver>,
        config.hitl_confidence,
    ));

    let hub = MessageHub::new(
        Arc::clone(&gate),
        Arc::new(NoopPushNotifier) as Arc<dyn PushNotifier>,
    );
    let autoauth = Arc::new(AutoAuthEngine::new(
        config.clone(),
        store.clone(),
        intakes.clone(),
        Arc::new(InMemoryBillProvider::new()),
        Arc::new(InMemoryVendorDirectory::new()),
        hub.clone(),
        bot,
    ));
    let reconciler = Reconciler::new(
        config,
        Arc::clone(&gateway) as Arc<dyn LlmGateway>,
        intakes.clone(),
        store.clone(),
        bot,
    );

    let accounts = vec![
        AccountRef {
            id: AccountId::new(),
            name: "Lumber & Materials".into(),
        },
        AccountRef {
            id: AccountId::new(),
            name: "Fasteners".into(),
        },
        AccountRef {
            id: AccountId::new(),
            name: "Tools & Equipment".into(),
        },
    ];

    Pipeline {
        service,
        store,
        intakes,
        autoauth,
        reconciler,
        hub,
        gateway,
        accounts,
        admin,
        bookkeeper,
        field,
        project: ProjectId::nil(),
    }
}

async fn upload(p: &Pipeline, text: &str) -> sl_core::IntakeRecord {
    p.intakes
        .upload(UploadRequest {
            bytes: text.as_bytes().to_vec(),
            mime_type: "text/plain".into(),
            project: p.project,
            uploader: p.field,
            batch: None,
            declared_text: None,
        })
        .await
        .unwrap()
}

fn llm_reply(account: AccountId, confidence: u8) -> serde_json::Value {
    json!({
        "account": account.to_string(),
        "confidence": confidence,
        "reasoning": "categorized from description"
    })
}

// ---------------------------------------------------------------------------
// Scenario 1: happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_upload_to_authorized_with_one_digest() {
    let p = pipeline();
    p.gateway.push_reply(llm_reply(p.accounts[0].id, 90));
    p.gateway.push_reply(llm_reply(p.accounts[1].id, 85));

    let intake = upload(&p, FRAMING_RECEIPT).await;
    assert_eq!(intake.status, IntakeStatus::Pending);

    let processed = p
        .service
        .process(p.field, intake.id, "Framing")
        .await
        .unwrap();
    assert_eq!(processed.status, IntakeStatus::Ready);

    let outcome = p
        .service
        .create_expenses(p.admin, intake.id, "Framing", &p.accounts, &[])
        .await
        .unwrap();
    assert_eq!(outcome.created.len(), 2);
    assert_eq!(outcome.intake.status, IntakeStatus::Linked);

    // Both expenses are pending with a categorization source.
    for id in &outcome.created {
        let expense = p.store.get(p.admin, *id).await.unwrap();
        assert_eq!(expense.status, ExpenseStatus::Pending);
        assert!(expense.categorization_source.is_some());
        assert!(expense.confidence.is_some());
    }

    // Auto-auth authorizes both under the receipt rule.
    let report = p
        .autoauth
        .run(p.project, None, Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(report.count(Decision::Authorized), 2);
    for decision in &report.decisions {
        assert_eq!(decision.rule, rules::R3_RECEIPT_SUFFICIENT);
    }
    for id in &outcome.created {
        let expense = p.store.get(p.admin, *id).await.unwrap();
        assert_eq!(expense.status, ExpenseStatus::Authorized);
    }

    // Exactly one digest message for the project.
    assert!(p.autoauth.flush_digest(p.project).await.unwrap());
    let channel = ChannelKey::new("project", p.project);
    let messages = p.hub.recent(&channel, 10).await;
    assert_eq!(messages.len(), 1);
    assert!(matches!(
        messages[0].author,
        Author::Bot { ref name } if name == "authorization-agent"
    ));
    // Nothing left to flush.
    assert!(!p.autoauth.flush_digest(p.project).await.unwrap());
}

// ---------------------------------------------------------------------------
// Scenario 2: duplicate by hash
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reupload_same_file_is_duplicate_without_expenses() {
    let p = pipeline();
    p.gateway.push_reply(llm_reply(p.accounts[0].id, 90));
    p.gateway.push_reply(llm_reply(p.accounts[1].id, 85));

    let first = upload(&p, FRAMING_RECEIPT).await;
    p.service.process(p.field, first.id, "Framing").await.unwrap();
    p.service
        .create_expenses(p.admin, first.id, "Framing", &p.accounts, &[])
        .await
        .unwrap();

    let second = upload(&p, FRAMING_RECEIPT).await;
    assert_eq!(second.status, IntakeStatus::Duplicate);
    assert!(second.created_expense_ids.is_empty());

    // Still exactly two expenses in the ledger.
    let page = p
        .store
        .list(
            p.admin,
            &sl_core::ExpenseFilter::default(),
            sl_core::PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 2);
}

// ---------------------------------------------------------------------------
// Scenario 3: power tool guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn power_tool_is_pinned_and_escalated_not_authorized() {
    let p = pipeline();
    // No LLM replies queued: the guard must fire before any tier runs.

    let intake = upload(&p, DRILL_RECEIPT).await;
    p.service.process(p.field, intake.id, "Framing").await.unwrap();
    let outcome = p
        .service
        .create_expenses(p.admin, intake.id, "Framing", &p.accounts, &[])
        .await
        .unwrap();
    assert_eq!(outcome.created.len(), 1);
    assert_eq!(p.gateway.call_count(), 0);

    let expense = p.store.get(p.admin, outcome.created[0]).await.unwrap();
    assert_eq!(expense.status, ExpenseStatus::Pending);
    assert_eq!(expense.confidence, Some(0));
    assert!(expense.account.is_none());

    let report = p
        .autoauth
        .run(p.project, None, Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(report.decisions.len(), 1);
    assert_eq!(report.decisions[0].rule, rules::R5_POLICY_ESCALATE);
    assert_eq!(report.decisions[0].decision, Decision::Escalated);

    // Not authorized by the linked receipt.
    let expense = p.store.get(p.admin, outcome.created[0]).await.unwrap();
    assert_eq!(expense.status, ExpenseStatus::Pending);
}

// ---------------------------------------------------------------------------
// Scenario 4: mismatch reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mismatch_reconciler_suggests_missing_items_without_writes() {
    let p = pipeline();
    // Categorization answer for the one parsed line.
    p.gateway.push_reply(llm_reply(p.accounts[0].id, 80));

    let intake = upload(&p, MISMATCH_RECEIPT).await;
    let processed = p
        .service
        .process(p.field, intake.id, "Plumbing")
        .await
        .unwrap();
    // Line totals disagree with the printed total.
    assert_eq!(processed.status, IntakeStatus::CheckReview);
    assert_eq!(
        processed.parsed.as_ref().unwrap().total_match_type,
        TotalMatchType::Mismatch
    );

    let outcome = p
        .service
        .create_expenses(p.admin, intake.id, "Plumbing", &p.accounts, &[])
        .await
        .unwrap();
    assert_eq!(outcome.created.len(), 1);

    // The vision re-read finds the lines the text parse missed.
    p.gateway.push_reply(json!({
        "vendor": "Ferguson",
        "date": "2026-03-12",
        "total": "1048.05",
        "subtotal": null,
        "tax": null,
        "line_items": [
            { "description": "copper fittings", "line_total": "850.00", "confidence": 96 },
            { "description": "pipe hangers", "line_total": "120.05", "confidence": 94 },
            { "description": "solder kit", "line_total": "78.00", "confidence": 93 }
        ],
        "confidence": { "vendor": 95, "date": 95, "total": 97, "subtotal": 0, "tax": 0 }
    }));

    let suggestion = p.reconciler.reconcile(intake.id).await.unwrap().unwrap();
    assert_eq!(suggestion.kind, DiscrepancyKind::MissingItems);
    assert_eq!(suggestion.difference, Money::parse("198.05").unwrap());
    let SuggestionAction::CreateExpenses { expenses } = &suggestion.action else {
        panic!("expected create-expenses suggestion");
    };
    let suggested: Money = expenses.iter().map(|e| e.amount).sum();
    assert_eq!(suggested, Money::parse("198.05").unwrap());
    assert!(!suggestion.applied);

    // No automatic writes: the intake still links exactly one expense.
    let record = p.intakes.get(p.admin, intake.id).await.unwrap();
    assert_eq!(record.status, IntakeStatus::Linked);
    assert_eq!(record.created_expense_ids.len(), 1);
}

// ---------------------------------------------------------------------------
// Scenario 5: bookkeeper edit of an authorized expense
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bookkeeper_edit_reopens_review_with_full_audit_trail() {
    let p = pipeline();
    p.gateway.push_reply(llm_reply(p.accounts[0].id, 90));
    p.gateway.push_reply(llm_reply(p.accounts[1].id, 85));

    let intake = upload(&p, FRAMING_RECEIPT).await;
    p.service.process(p.field, intake.id, "Framing").await.unwrap();
    let outcome = p
        .service
        .create_expenses(p.admin, intake.id, "Framing", &p.accounts, &[])
        .await
        .unwrap();
    p.autoauth
        .run(p.project, None, Uuid::new_v4())
        .await
        .unwrap();

    let id = outcome.created[0];
    let authorized = p.store.get(p.admin, id).await.unwrap();
    assert_eq!(authorized.status, ExpenseStatus::Authorized);

    let edited = p
        .store
        .update(
            p.bookkeeper,
            id,
            ExpensePatch {
                description: Some("2x4 lumber (pressure treated)".into()),
                expected_version: authorized.version_token,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.status, ExpenseStatus::Review);
    assert_eq!(edited.authorizer, None);
    assert!(edited.status_reason.is_some());

    let change_log = p.store.change_log(id).await;
    assert!(change_log.iter().any(|row| row.field == "description"));
    let status_log = p.store.status_log(id).await;
    let last = status_log.last().unwrap();
    assert_eq!(last.from, ExpenseStatus::Authorized);
    assert_eq!(last.to, ExpenseStatus::Review);
    assert_eq!(last.actor, p.bookkeeper);
}

// ---------------------------------------------------------------------------
// Scenario 6: cooldown suppression
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_mention_within_cooldown_is_suppressed() {
    use sl_agents::{AgentDispatcher, AgentEvent, AgentKind, ChatAgent, DispatchOutcome};
    use std::time::Duration;

    let p = pipeline();
    let mut dispatcher = AgentDispatcher::new(
        Arc::clone(&p.gateway) as Arc<dyn LlmGateway>,
        p.hub.clone(),
        Duration::from_secs(5),
    );
    dispatcher.register(Arc::new(ChatAgent::new(p.store.clone())));
    p.gateway
        .push_reply(json!({ "action": "free_chat", "ack_message": "looking good" }));

    let event = AgentEvent {
        user: p.admin,
        channel: ChannelKey::new("project", p.project),
        target: AgentKind::Chat,
        text: "@chat how are we doing".into(),
        at: chrono::Utc::now(),
    };
    let first = dispatcher.dispatch(event.clone()).await.unwrap();
    assert!(matches!(first, DispatchOutcome::Replied { .. }));

    // Two seconds later, same user, channel, and agent.
    let calls_before = p.gateway.call_count();
    let second = dispatcher.dispatch(event).await.unwrap();
    assert!(matches!(second, DispatchOutcome::Suppressed));
    assert_eq!(p.gateway.call_count(), calls_before);
    assert_eq!(dispatcher.cooldowns().suppressions().await.len(), 1);

    let channel = ChannelKey::new("project", p.project);
    assert_eq!(p.hub.recent(&channel, 10).await.len(), 1);
}
