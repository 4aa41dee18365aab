// SPDX-License-Identifier: MIT OR Apache-2.0
//! Application state and component wiring.

use sl_agents::{AgentDispatcher, AuthorizationAgent, ChatAgent, ReceiptAgent};
use sl_auth::{CapabilityGate, InMemoryRoleProvider, Role, TokenValidator};
use sl_autoauth::{AutoAuthEngine, InMemoryBillProvider, InMemoryVendorDirectory};
use sl_categorize::{
    AccountRef, AffinityIndex, CategorizationCache, CategorizationEngine, Classifier,
};
use sl_chat::{MessageHub, NoopPushNotifier, PushNotifier};
use sl_config::SiteLedgerConfig;
use sl_core::UserId;
use sl_intake::{
    InMemoryBlobStore, InMemoryVendorResolver, IntakeQueue, IntakeService, VendorResolver,
};
use sl_jobs::JobQueue;
use sl_llm::{HttpGateway, LlmGateway, MockGateway};
use sl_ocr::{OcrPipeline, PassthroughRasterizer};
use sl_reconcile::Reconciler;
use sl_store::ExpenseStore;
use sl_telemetry::MetricsCollector;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Capacity of the background job queue.
const JOB_QUEUE_CAPACITY: usize = 1_024;

/// Everything the handlers need. Stored behind one `Arc`.
pub struct AppState {
    /// Runtime configuration.
    pub config: SiteLedgerConfig,
    /// The capability gate.
    pub gate: Arc<CapabilityGate>,
    /// Token issuing and validation.
    pub tokens: TokenValidator,
    /// The expense store.
    pub store: ExpenseStore,
    /// The composed intake service.
    pub intake: Arc<IntakeService>,
    /// The categorization engine.
    pub categorization: Arc<CategorizationEngine>,
    /// The auto-authorization engine.
    pub autoauth: Arc<AutoAuthEngine>,
    /// The mismatch reconciler.
    pub reconciler: Arc<Reconciler>,
    /// The messaging substrate.
    pub hub: MessageHub,
    /// The agent dispatcher.
    pub dispatcher: Arc<AgentDispatcher>,
    /// The background job queue.
    pub jobs: JobQueue,
    /// Metrics collector shared across pipelines.
    pub metrics: MetricsCollector,
    /// The engine's bot identity.
    pub bot: UserId,
    /// The account catalog handed to categorization.
    pub accounts: Vec<AccountRef>,
    /// Seam registries kept for operator tooling.
    pub role_provider: Arc<InMemoryRoleProvider>,
    /// Vendor-name resolver used at intake time.
    pub vendor_resolver: Arc<InMemoryVendorResolver>,
}

impl AppState {
    /// Wire the full pipeline from configuration.
    ///
    /// Without LLM credentials the gateway falls back to the mock, which
    /// keeps the daemon bootable for local work; the warning is logged at
    /// startup.
    #[must_use]
    pub fn build(config: SiteLedgerConfig) -> Arc<AppState> {
        let gateway: Arc<dyn LlmGateway> = match HttpGateway::from_config(&config) {
            Ok(gateway) => Arc::new(gateway),
            Err(err) => {
                warn!(error = %err, "LLM gateway unavailable; using the mock");
                Arc::new(MockGateway::new())
            }
        };
        Self::build_with_gateway(config, gateway)
    }

    /// Wire the pipeline around a caller-supplied gateway (tests hand in a
    /// mock they keep a handle to).
    #[must_use]
    pub fn build_with_gateway(
        config: SiteLedgerConfig,
        gateway: Arc<dyn LlmGateway>,
    ) -> Arc<AppState> {
        let role_provider = Arc::new(InMemoryRoleProvider::new());
        let bot = UserId::new();
        role_provider.add_user(bot, "autoauth@siteledger.internal", "", Role::Bot);
        let gate = Arc::new(CapabilityGate::new(
            Arc::clone(&role_provider) as Arc<dyn sl_auth::RoleProvider>
        ));
        let tokens = TokenValidator::new(config.token_secret.clone());

        let metrics = MetricsCollector::new();
        let cache = Arc::new(CategorizationCache::new(config.cache_ttl_days));
        let affinity = Arc::new(AffinityIndex::new());
        let classifier = Arc::new(Classifier::new());
        let categorization = Arc::new(CategorizationEngine::new(
            config.clone(),
            cache,
            affinity,
            classifier,
            Arc::clone(&gateway),
            metrics.clone(),
        ));

        let ocr = Arc::new(OcrPipeline::new(
            config.clone(),
            Arc::clone(&gateway),
            Arc::new(PassthroughRasterizer),
            metrics.clone(),
        ));

        let jobs = JobQueue::new(JOB_QUEUE_CAPACITY);
        let store = ExpenseStore::new(Arc::clone(&gate));
        let blobs = Arc::new(InMemoryBlobStore::new());
        let queue = IntakeQueue::new(Arc::clone(&gate), blobs, config.max_upload_bytes);
        let vendor_resolver = Arc::new(InMemoryVendorResolver::new());
        let intake = Arc::new(IntakeService::new(
            queue.clone(),
            ocr,
            Arc::clone(&categorization),
            store.clone(),
            Arc::clone(&vendor_resolver) as Arc<dyn VendorResolver>,
            config.hitl_confidence,
        ));

        let hub = MessageHub::new(
            Arc::clone(&gate),
            Arc::new(NoopPushNotifier) as Arc<dyn PushNotifier>,
        );
        let autoauth = Arc::new(AutoAuthEngine::new(
            config.clone(),
            store.clone(),
            queue.clone(),
            Arc::new(InMemoryBillProvider::new()),
            Arc::new(InMemoryVendorDirectory::new()),
            hub.clone(),
            bot,
        ));
        let reconciler = Arc::new(Reconciler::new(
            config.clone(),
            Arc::clone(&gateway),
            queue,
            store.clone(),
            bot,
        ));

        // Account master data lives with an external system; the daemon
        // seeds the standard construction catalog until a sync replaces it.
        let accounts: Vec<AccountRef> = [
            "Lumber & Materials",
            "Fasteners",
            "Plumbing",
            "Electrical",
            "Tools & Equipment",
            "Equipment Rental",
            "Permits & Fees",
            "Subcontractors",
        ]
        .iter()
        .map(|name| AccountRef {
            id: sl_core::AccountId::new(),
            name: (*name).to_string(),
        })
        .collect();
        let mut dispatcher = AgentDispatcher::new(
            Arc::clone(&gateway),
            hub.clone(),
            Duration::from_secs(config.cooldown_secs),
        );
        dispatcher.register(Arc::new(ReceiptAgent::new(
            Arc::clone(&intake),
            accounts.clone(),
        )));
        dispatcher.register(Arc::new(AuthorizationAgent::new(Arc::clone(&autoauth))));
        dispatcher.register(Arc::new(ChatAgent::new(store.clone())));

        Arc::new(AppState {
            config,
            gate,
            tokens,
            store,
            intake,
            categorization,
            autoauth,
            reconciler,
            hub,
            dispatcher: Arc::new(dispatcher),
            jobs,
            metrics,
            bot,
            accounts,
            role_provider,
            vendor_resolver,
        })
    }
}
