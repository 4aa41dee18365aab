// SPDX-License-Identifier: MIT OR Apache-2.0
//! The categorization escalation engine.
//!
//! Per row, in order: cache → affinity → ML → small model → large model,
//! stopping at the first success. Rows sharing a fingerprint within one
//! call are processed once and replayed. Power-tool descriptions are pinned
//! to confidence zero before any tier runs.

use crate::affinity::AffinityIndex;
use crate::cache::CategorizationCache;
use crate::classifier::Classifier;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sl_config::SiteLedgerConfig;
use sl_core::{AccountId, CategorizationSource, ProjectId, VendorId, fingerprint};
use sl_llm::LlmGateway;
use sl_telemetry::{CategorizationMetrics, MetricsCollector};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Confidence the ML tier must reach to answer without LLM help.
const ML_ACCEPT_CONFIDENCE: u8 = 90;

/// Maximum recent corrections included in an LLM prompt.
const MAX_CORRECTIONS: usize = 5;

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// An account the engine may assign, by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRef {
    /// The account id.
    pub id: AccountId,
    /// Display name shown to models and users.
    pub name: String,
}

/// One row to categorize.
#[derive(Debug, Clone)]
pub struct CategorizeRow {
    /// Caller's index, echoed back on the result.
    pub row_index: usize,
    /// Free-text description.
    pub description: String,
    /// Construction stage token.
    pub stage: String,
    /// Vendor, when known.
    pub vendor: Option<VendorId>,
    /// Project, when known.
    pub project: Option<ProjectId>,
}

/// A recent human correction fed to the LLM tiers as context.
#[derive(Debug, Clone)]
pub struct Correction {
    /// The corrected description.
    pub description: String,
    /// The account name the human chose.
    pub account_name: String,
}

/// Warnings attached to a row result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowWarning {
    /// The description matched the power-tool lexicon; the row must not
    /// auto-post as a consumable.
    PowerTool,
    /// Every tier failed.
    Exhausted,
}

/// The engine's answer for one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowResult {
    /// Caller's row index.
    pub row_index: usize,
    /// Assigned account, when any tier succeeded.
    pub account: Option<AccountId>,
    /// Display name of the assigned account.
    pub account_name: Option<String>,
    /// Confidence 0–100.
    pub confidence: u8,
    /// Which tier answered.
    pub source: Option<CategorizationSource>,
    /// Reasoning text for the audit trail.
    pub reasoning: String,
    /// Warning, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<RowWarning>,
}

impl RowResult {
    fn replay_at(&self, row_index: usize) -> Self {
        Self {
            row_index,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The escalation engine. Share behind an `Arc`.
pub struct CategorizationEngine {
    config: SiteLedgerConfig,
    cache: Arc<CategorizationCache>,
    affinity: Arc<AffinityIndex>,
    classifier: Arc<Classifier>,
    gateway: Arc<dyn LlmGateway>,
    collector: MetricsCollector,
}

impl CategorizationEngine {
    /// Assemble the engine from its tiers.
    #[must_use]
    pub fn new(
        config: SiteLedgerConfig,
        cache: Arc<CategorizationCache>,
        affinity: Arc<AffinityIndex>,
        classifier: Arc<Classifier>,
        gateway: Arc<dyn LlmGateway>,
        collector: MetricsCollector,
    ) -> Self {
        Self {
            config,
            cache,
            affinity,
            classifier,
            gateway,
            collector,
        }
    }

    /// The cache tier, for sweeps and invalidation jobs.
    #[must_use]
    pub fn cache(&self) -> &Arc<CategorizationCache> {
        &self.cache
    }

    /// The affinity tier, for recompute jobs.
    #[must_use]
    pub fn affinity(&self) -> &Arc<AffinityIndex> {
        &self.affinity
    }

    /// The classifier tier, for retrain jobs.
    #[must_use]
    pub fn classifier(&self) -> &Arc<Classifier> {
        &self.classifier
    }

    /// Categorize an ordered list of rows.
    ///
    /// `accounts` is the ordered account catalog; `corrections` are recent
    /// human corrections for the rows' (project, stage) context.
    pub async fn categorize(
        &self,
        rows: &[CategorizeRow],
        accounts: &[AccountRef],
        corrections: &[Correction],
    ) -> (Vec<RowResult>, CategorizationMetrics) {
        let started = Instant::now();
        let mut metrics = CategorizationMetrics::default();
        let mut by_fingerprint: HashMap<String, RowResult> = HashMap::new();
        let mut results = Vec::with_capacity(rows.len());

        for row in rows {
            let fp = fingerprint(&row.description, &row.stage);
            // Same fingerprint already processed in this call: replay.
            let done = by_fingerprint.get(&fp).cloned();
            let result = match done {
                Some(done) => done.replay_at(row.row_index),
                None => {
                    let fresh = self
                        .categorize_one(row, &fp, accounts, corrections, &mut metrics)
                        .await;
                    by_fingerprint.insert(fp, fresh.clone());
                    fresh
                }
            };
            metrics.record_confidence(result.confidence);
            results.push(result);
        }

        metrics.elapsed_ms = started.elapsed().as_millis() as u64;
        self.collector.record_categorization(metrics.clone());
        (results, metrics)
    }

    async fn categorize_one(
        &self,
        row: &CategorizeRow,
        fp: &str,
        accounts: &[AccountRef],
        corrections: &[Correction],
        metrics: &mut CategorizationMetrics,
    ) -> RowResult {
        // Power-tool guard runs before any tier.
        if self.is_power_tool(&row.description) {
            return RowResult {
                row_index: row.row_index,
                account: None,
                account_name: None,
                confidence: 0,
                source: None,
                reasoning: "matched the power-tool lexicon; held for manual booking".into(),
                warning: Some(RowWarning::PowerTool),
            };
        }

        // 1. Cache.
        if let Some(entry) = self.cache.lookup(fp) {
            metrics.cache_hits += 1;
            self.cache.touch(fp);
            return RowResult {
                row_index: row.row_index,
                account: Some(entry.account),
                account_name: Some(entry.account_name),
                confidence: entry.confidence,
                source: Some(CategorizationSource::Cache),
                reasoning: entry.reasoning,
                warning: None,
            };
        }
        metrics.cache_misses += 1;

        // 2. Affinity. Already the source of truth, so no cache write.
        if let Some(vendor) = row.vendor
            && let Some(dominant) = self.affinity.dominant_account(vendor)
        {
            let confidence = (dominant.ratio * 100.0).round() as u8;
            return RowResult {
                row_index: row.row_index,
                account: Some(dominant.account),
                account_name: account_name(accounts, dominant.account),
                confidence,
                source: Some(CategorizationSource::Affinity),
                reasoning: format!(
                    "vendor books to this account in {} of {} assignments",
                    dominant.count, dominant.vendor_total
                ),
                warning: None,
            };
        }

        // 3. ML.
        let (predicted, ml_confidence) = self.classifier.predict(&row.description, &row.stage);
        if let Some(account) = predicted
            && ml_confidence >= ML_ACCEPT_CONFIDENCE
        {
            let name = account_name(accounts, account);
            let reasoning = format!(
                "classifier v{} matched verified history",
                self.classifier.version()
            );
            self.cache.insert(
                fp,
                &row.stage,
                account,
                name.as_deref().unwrap_or(""),
                ml_confidence,
                &reasoning,
                row.vendor,
            );
            return RowResult {
                row_index: row.row_index,
                account: Some(account),
                account_name: name,
                confidence: ml_confidence,
                source: Some(CategorizationSource::Ml),
                reasoning,
                warning: None,
            };
        }

        // 4. Small model.
        let prompt = build_prompt(row, accounts, corrections);
        let schema = reply_schema();
        match self.gateway.classify_small(&prompt, &schema).await {
            Ok(reply) => {
                metrics.llm_tokens_used += reply.usage.total();
                if let Some((account, confidence, reasoning)) = parse_reply(&reply.value, accounts)
                    && confidence >= self.config.min_confidence
                {
                    let name = account_name(accounts, account);
                    self.cache.insert(
                        fp,
                        &row.stage,
                        account,
                        name.as_deref().unwrap_or(""),
                        confidence,
                        &reasoning,
                        row.vendor,
                    );
                    return RowResult {
                        row_index: row.row_index,
                        account: Some(account),
                        account_name: name,
                        confidence,
                        source: Some(CategorizationSource::LlmSmall),
                        reasoning,
                        warning: None,
                    };
                }
                debug!(row = row.row_index, "small tier below threshold; escalating");
            }
            Err(err) => {
                warn!(row = row.row_index, error = %err, "small tier failed; escalating");
            }
        }

        // 5. Large model. Accepted at any confidence — downstream gates on it.
        match self.gateway.analyze_large(&prompt, &[], &schema).await {
            Ok(reply) => {
                metrics.llm_tokens_used += reply.usage.total();
                if let Some((account, confidence, reasoning)) = parse_reply(&reply.value, accounts)
                {
                    let name = account_name(accounts, account);
                    self.cache.insert(
                        fp,
                        &row.stage,
                        account,
                        name.as_deref().unwrap_or(""),
                        confidence,
                        &reasoning,
                        row.vendor,
                    );
                    return RowResult {
                        row_index: row.row_index,
                        account: Some(account),
                        account_name: name,
                        confidence,
                        source: Some(CategorizationSource::LlmLarge),
                        reasoning,
                        warning: None,
                    };
                }
                warn!(row = row.row_index, "large tier returned unusable account");
            }
            Err(err) => {
                warn!(row = row.row_index, error = %err, "large tier failed");
            }
        }

        RowResult {
            row_index: row.row_index,
            account: None,
            account_name: None,
            confidence: 0,
            source: None,
            reasoning: "every categorization tier failed".into(),
            warning: Some(RowWarning::Exhausted),
        }
    }

    /// Whether the power-tool guard applies to a description.
    #[must_use]
    pub fn is_power_tool(&self, description: &str) -> bool {
        self.config.matches_power_tool(description)
    }
}

// ---------------------------------------------------------------------------
// Prompt and reply plumbing
// ---------------------------------------------------------------------------

fn account_name(accounts: &[AccountRef], id: AccountId) -> Option<String> {
    accounts
        .iter()
        .find(|a| a.id == id)
        .map(|a| a.name.clone())
}

fn reply_schema() -> Value {
    json!({
        "type": "object",
        "required": ["account", "confidence"],
        "properties": {
            "account": { "type": "string" },
            "confidence": { "type": "integer", "minimum": 0, "maximum": 100 },
            "reasoning": { "type": "string" }
        }
    })
}

fn build_prompt(row: &CategorizeRow, accounts: &[AccountRef], corrections: &[Correction]) -> String {
    let mut prompt = String::new();
    prompt.push_str("Assign one ledger account to a construction expense line.\n");
    prompt.push_str(&format!("Construction stage: {}\n", row.stage));
    prompt.push_str("Accounts (answer with the id):\n");
    for account in accounts {
        prompt.push_str(&format!("  {}: {}\n", account.id, account.name));
    }
    if !corrections.is_empty() {
        prompt.push_str("Recent corrections by the team:\n");
        for correction in corrections.iter().take(MAX_CORRECTIONS) {
            prompt.push_str(&format!(
                "  \"{}\" -> {}\n",
                correction.description, correction.account_name
            ));
        }
    }
    prompt.push_str(&format!("Line description: {}\n", row.description));
    prompt.push_str(
        "Respond with JSON: {\"account\": \"<id>\", \"confidence\": 0-100, \"reasoning\": \"...\"}",
    );
    prompt
}

fn parse_reply(value: &Value, accounts: &[AccountRef]) -> Option<(AccountId, u8, String)> {
    let account: AccountId = value.get("account")?.as_str()?.parse().ok()?;
    // The model must pick from the catalog it was shown.
    if !accounts.iter().any(|a| a.id == account) {
        return None;
    }
    let confidence = value
        .get("confidence")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        .min(100) as u8;
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or("model categorization")
        .to_string();
    Some((account, confidence, reasoning))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::TrainingExample;
    use sl_llm::{LlmError, MockGateway};

    struct Fixture {
        engine: CategorizationEngine,
        gateway: Arc<MockGateway>,
        accounts: Vec<AccountRef>,
    }

    fn fixture() -> Fixture {
        let gateway = Arc::new(MockGateway::new());
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
        let engine = CategorizationEngine::new(
            SiteLedgerConfig::default(),
            Arc::new(CategorizationCache::new(30)),
            Arc::new(AffinityIndex::new()),
            Arc::new(Classifier::new()),
            Arc::clone(&gateway) as Arc<dyn LlmGateway>,
            MetricsCollector::new(),
        );
        Fixture {
            engine,
            gateway,
            accounts,
        }
    }

    fn row(index: usize, description: &str) -> CategorizeRow {
        CategorizeRow {
            row_index: index,
            description: description.to_string(),
            stage: "framing".into(),
            vendor: None,
            project: None,
        }
    }

    fn llm_reply(account: AccountId, confidence: u8) -> Value {
        json!({
            "account": account.to_string(),
            "confidence": confidence,
            "reasoning": "looks like materials"
        })
    }

    #[tokio::test]
    async fn power_tool_guard_pins_confidence_zero() {
        let f = fixture();
        let (results, _) = f
            .engine
            .categorize(&[row(0, "DeWalt 20V drill")], &f.accounts, &[])
            .await;
        assert_eq!(results[0].confidence, 0);
        assert_eq!(results[0].warning, Some(RowWarning::PowerTool));
        assert!(results[0].account.is_none());
        // No tier ran, LLM included.
        assert_eq!(f.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn qualifier_exempts_from_guard() {
        let f = fixture();
        let lumber = f.accounts[0].id;
        f.gateway.push_reply(llm_reply(lumber, 85));
        let (results, _) = f
            .engine
            .categorize(&[row(0, "drill bit set")], &f.accounts, &[])
            .await;
        assert_ne!(results[0].warning, Some(RowWarning::PowerTool));
        assert_eq!(results[0].source, Some(CategorizationSource::LlmSmall));
    }

    #[tokio::test]
    async fn multiword_lexicon_terms_match() {
        let f = fixture();
        assert!(f.engine.is_power_tool("Makita circular saw 7-1/4"));
        assert!(f.engine.is_power_tool("impact driver kit"));
        assert!(!f.engine.is_power_tool("circular saw blade 24T"));
    }

    #[tokio::test]
    async fn cache_hit_short_circuits() {
        let f = fixture();
        let lumber = f.accounts[0].id;
        let fp = fingerprint("2x4 lumber", "framing");
        f.engine
            .cache()
            .insert(&fp, "framing", lumber, "Lumber & Materials", 95, "seeded", None);

        let (results, metrics) = f
            .engine
            .categorize(&[row(0, "2x4 lumber")], &f.accounts, &[])
            .await;
        assert_eq!(results[0].source, Some(CategorizationSource::Cache));
        assert_eq!(results[0].account, Some(lumber));
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 0);
        assert_eq!(f.gateway.call_count(), 0);
        // Last-used was touched.
        assert_eq!(f.engine.cache().lookup(&fp).unwrap().hit_count, 1);
    }

    #[tokio::test]
    async fn affinity_answers_with_ratio_confidence() {
        let f = fixture();
        let vendor = VendorId::new();
        let lumber = f.accounts[0].id;
        let other = f.accounts[1].id;
        // 19 of 20 = 95 %.
        let assignments: Vec<AccountId> = std::iter::repeat_n(lumber, 19)
            .chain(std::iter::once(other))
            .collect();
        f.engine.affinity().recompute(vendor, assignments);

        let mut input = row(0, "misc materials");
        input.vendor = Some(vendor);
        let (results, _) = f.engine.categorize(&[input], &f.accounts, &[]).await;
        assert_eq!(results[0].source, Some(CategorizationSource::Affinity));
        assert_eq!(results[0].account, Some(lumber));
        assert_eq!(results[0].confidence, 95);
        // Affinity never writes the cache.
        assert!(f
            .engine
            .cache()
            .lookup(&fingerprint("misc materials", "framing"))
            .is_none());
    }

    #[tokio::test]
    async fn ml_tier_answers_and_caches() {
        let f = fixture();
        let lumber = f.accounts[0].id;
        f.engine.classifier().train(&[TrainingExample {
            description: "2x4 lumber".into(),
            stage: "framing".into(),
            account: lumber,
        }]);

        let (results, _) = f
            .engine
            .categorize(&[row(0, "2x4 lumber")], &f.accounts, &[])
            .await;
        assert_eq!(results[0].source, Some(CategorizationSource::Ml));
        assert_eq!(results[0].account, Some(lumber));
        assert!(results[0].confidence >= 90);
        assert_eq!(f.gateway.call_count(), 0);
        // The decision was written back to the cache.
        assert!(f
            .engine
            .cache()
            .lookup(&fingerprint("2x4 lumber", "framing"))
            .is_some());
    }

    #[tokio::test]
    async fn small_model_accepted_at_threshold() {
        let f = fixture();
        let fasteners = f.accounts[1].id;
        f.gateway.push_reply(llm_reply(fasteners, 70));
        let (results, metrics) = f
            .engine
            .categorize(&[row(0, "wood screws")], &f.accounts, &[])
            .await;
        assert_eq!(results[0].source, Some(CategorizationSource::LlmSmall));
        assert_eq!(results[0].confidence, 70);
        assert!(metrics.llm_tokens_used > 0);
    }

    #[tokio::test]
    async fn low_small_confidence_escalates_to_large() {
        let f = fixture();
        let lumber = f.accounts[0].id;
        f.gateway.push_reply(llm_reply(lumber, 40)); // small: below 70
        f.gateway.push_reply(llm_reply(lumber, 55)); // large: accepted anyway
        let (results, _) = f
            .engine
            .categorize(&[row(0, "assorted items")], &f.accounts, &[])
            .await;
        assert_eq!(results[0].source, Some(CategorizationSource::LlmLarge));
        assert_eq!(results[0].confidence, 55);
        assert_eq!(f.gateway.call_count(), 2);
        // Cached even at low confidence.
        assert!(f
            .engine
            .cache()
            .lookup(&fingerprint("assorted items", "framing"))
            .is_some());
    }

    #[tokio::test]
    async fn unknown_account_in_reply_escalates() {
        let f = fixture();
        let stranger = AccountId::new();
        let lumber = f.accounts[0].id;
        f.gateway.push_reply(llm_reply(stranger, 99));
        f.gateway.push_reply(llm_reply(lumber, 80));
        let (results, _) = f
            .engine
            .categorize(&[row(0, "mystery line")], &f.accounts, &[])
            .await;
        assert_eq!(results[0].source, Some(CategorizationSource::LlmLarge));
        assert_eq!(results[0].account, Some(lumber));
    }

    #[tokio::test]
    async fn exhausted_when_all_tiers_fail() {
        let f = fixture();
        f.gateway.push_error(LlmError::Timeout);
        f.gateway.push_error(LlmError::Upstream("down".into()));
        let (results, _) = f
            .engine
            .categorize(&[row(0, "anything")], &f.accounts, &[])
            .await;
        assert_eq!(results[0].warning, Some(RowWarning::Exhausted));
        assert_eq!(results[0].confidence, 0);
        assert!(results[0].account.is_none());
        assert!(results[0].source.is_none());
    }

    #[tokio::test]
    async fn duplicate_fingerprints_processed_once() {
        let f = fixture();
        let lumber = f.accounts[0].id;
        f.gateway.push_reply(llm_reply(lumber, 90));
        let rows = vec![
            row(0, "2x4 Lumber"),
            row(1, "  2x4   LUMBER. "), // same fingerprint
            row(2, "2x4 lumber"),
        ];
        let (results, _) = f.engine.categorize(&rows, &f.accounts, &[]).await;
        assert_eq!(f.gateway.call_count(), 1);
        for (index, result) in results.iter().enumerate() {
            assert_eq!(result.row_index, index);
            assert_eq!(result.account, Some(lumber));
            assert_eq!(result.source, Some(CategorizationSource::LlmSmall));
        }
    }

    #[tokio::test]
    async fn below_confidence_buckets_counted() {
        let f = fixture();
        let lumber = f.accounts[0].id;
        f.gateway.push_reply(llm_reply(lumber, 40));
        f.gateway.push_reply(llm_reply(lumber, 55)); // large accepts at 55
        let (_, metrics) = f
            .engine
            .categorize(&[row(0, "assorted")], &f.accounts, &[])
            .await;
        assert_eq!(metrics.below_70_count, 1);
        assert_eq!(metrics.below_60_count, 1);
        assert_eq!(metrics.below_50_count, 0);
    }

    #[tokio::test]
    async fn corrections_reach_the_prompt() {
        let f = fixture();
        let lumber = f.accounts[0].id;
        f.gateway.push_reply(llm_reply(lumber, 90));
        let corrections = vec![Correction {
            description: "deck boards".into(),
            account_name: "Lumber & Materials".into(),
        }];
        f.engine
            .categorize(&[row(0, "composite decking")], &f.accounts, &corrections)
            .await;
        let calls = f.gateway.calls();
        assert!(calls[0].prompt.contains("deck boards"));
        assert!(calls[0].prompt.contains("Recent corrections"));
    }
}
