// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-config
#![deny(unsafe_code)]
#![warn(missing_docs)]

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sl_core::Money;
use std::str::FromStr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed into its target type.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// The environment variable name.
        key: String,
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// No LLM credentials configured; the gateway falls back to the mock.
    NoLlmCredentials,
    /// No database URL configured; stores run in-memory only.
    NoDatabaseUrl,
    /// The auth token secret is the development default.
    DefaultTokenSecret,
    /// A tunable is set unusually high.
    LargeValue {
        /// The environment variable name.
        key: String,
        /// The configured value rendered as a string.
        value: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::NoLlmCredentials => {
                write!(f, "no LLM credentials configured — using the mock gateway")
            }
            ConfigWarning::NoDatabaseUrl => {
                write!(f, "no database URL configured — stores are in-memory")
            }
            ConfigWarning::DefaultTokenSecret => {
                write!(f, "auth token secret is the development default")
            }
            ConfigWarning::LargeValue { key, value } => {
                write!(f, "{key} is unusually large ({value})")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Per-call wall-clock timeout for database queries.
pub const DB_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-call wall-clock timeout for small-model LLM calls.
pub const LLM_SMALL_TIMEOUT: Duration = Duration::from_secs(20);
/// Per-call wall-clock timeout for large-model LLM calls.
pub const LLM_LARGE_TIMEOUT: Duration = Duration::from_secs(90);
/// Per-call wall-clock timeout for blob reads and writes.
pub const BLOB_TIMEOUT: Duration = Duration::from_secs(60);

/// Development default for the token-signing secret.
pub const DEV_TOKEN_SECRET: &str = "dev-secret-change-me";

const ENV_PREFIX: &str = "SITELEDGER_";

/// Power-tool descriptions that must never auto-post as consumables.
const DEFAULT_POWER_TOOL_LEXICON: &[&str] = &[
    "drill",
    "saw",
    "grinder",
    "sander",
    "router",
    "nailer",
    "impact driver",
    "circular saw",
    "welder",
    "compressor",
];

/// Qualifier words that exempt a description from the power-tool guard
/// (accessories and consumables, not the tool itself).
const DEFAULT_POWER_TOOL_QUALIFIERS: &[&str] =
    &["bit", "blade", "disc", "battery", "charger", "case"];

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Top-level runtime configuration, read from the environment at boot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteLedgerConfig {
    /// Database connection URL; `None` runs the in-memory stores.
    pub database_url: Option<String>,
    /// Blob storage URL; `None` runs the in-memory blob store.
    pub blob_url: Option<String>,
    /// API key for the LLM provider; `None` selects the mock gateway.
    pub llm_api_key: Option<String>,
    /// Base URL of the LLM provider.
    pub llm_base_url: Option<String>,
    /// Model id for the small tier.
    pub small_model_id: String,
    /// Model id for the large / vision tier.
    pub large_model_id: String,
    /// Requests per minute admitted to the small tier.
    pub small_tier_rpm: u32,
    /// Requests per minute admitted to the large tier.
    pub large_tier_rpm: u32,
    /// Per-process token budget for the large tier.
    pub large_tier_token_budget: u64,
    /// Minimum LLM confidence to accept a small-model categorization.
    pub min_confidence: u8,
    /// Absolute amount tolerance for fuzzy matching.
    pub tolerance_abs: Money,
    /// Relative amount tolerance (fraction; 0.005 is 0.5 %).
    pub tolerance_rel: Decimal,
    /// Vendor-name similarity threshold, 0–100.
    pub fuzzy_threshold: u8,
    /// Per-(user, channel, agent) dispatcher cooldown in seconds.
    pub cooldown_secs: u64,
    /// Hours between digest flushes.
    pub digest_interval_hours: u64,
    /// Days a cache entry survives after its last use.
    pub cache_ttl_days: i64,
    /// Hours between classifier retrains.
    pub retrain_interval_hours: u64,
    /// Days an expense may sit in pending before R6 escalates it.
    pub pending_escalation_age_days: i64,
    /// Whether R2 may authorize on a bill match alone.
    pub allow_bill_authorization: bool,
    /// Amount above which R5 escalates regardless of other signals.
    pub escalation_amount: Money,
    /// Power-tool lexicon for the categorization guard.
    pub power_tool_lexicon: Vec<String>,
    /// Qualifier words that exempt a description from the guard.
    pub power_tool_qualifiers: Vec<String>,
    /// Maximum accepted upload size in bytes.
    pub max_upload_bytes: usize,
    /// Maximum pages rasterized per document.
    pub max_raster_pages: usize,
    /// Maximum rasterization DPI.
    pub max_raster_dpi: u32,
    /// Confidence below which OCR output routes to human review.
    pub hitl_confidence: u8,
    /// Whether high-confidence reconciliation suggestions may auto-apply.
    pub reconcile_auto_apply: bool,
    /// Minimum re-read confidence for auto-apply eligibility.
    pub reconcile_auto_apply_min_confidence: u8,
    /// Secret used to sign bearer tokens.
    pub token_secret: String,
}

impl Default for SiteLedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            blob_url: None,
            llm_api_key: None,
            llm_base_url: None,
            small_model_id: "small-1".into(),
            large_model_id: "large-vision-1".into(),
            small_tier_rpm: 60,
            large_tier_rpm: 12,
            large_tier_token_budget: 2_000_000,
            min_confidence: 70,
            tolerance_abs: Money::from_cents(5),
            tolerance_rel: Decimal::new(5, 3), // 0.005
            fuzzy_threshold: 85,
            cooldown_secs: 5,
            digest_interval_hours: 4,
            cache_ttl_days: 30,
            retrain_interval_hours: 6,
            pending_escalation_age_days: 14,
            allow_bill_authorization: true,
            escalation_amount: Money::from_cents(500_000), // $5,000.00
            power_tool_lexicon: DEFAULT_POWER_TOOL_LEXICON
                .iter()
                .map(|s| s.to_string())
                .collect(),
            power_tool_qualifiers: DEFAULT_POWER_TOOL_QUALIFIERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_upload_bytes: 20 * 1024 * 1024,
            max_raster_pages: 8,
            max_raster_dpi: 200,
            hitl_confidence: 60,
            reconcile_auto_apply: false,
            reconcile_auto_apply_min_confidence: 90,
            token_secret: DEV_TOKEN_SECRET.into(),
        }
    }
}

impl SiteLedgerConfig {
    /// Load configuration from `SITELEDGER_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database_url = env_string("DATABASE_URL");
        config.blob_url = env_string("BLOB_URL");
        config.llm_api_key = env_string("LLM_API_KEY");
        config.llm_base_url = env_string("LLM_BASE_URL");
        if let Some(v) = env_string("SMALL_MODEL_ID") {
            config.small_model_id = v;
        }
        if let Some(v) = env_string("LARGE_MODEL_ID") {
            config.large_model_id = v;
        }
        if let Some(v) = env_parse("SMALL_TIER_RPM")? {
            config.small_tier_rpm = v;
        }
        if let Some(v) = env_parse("LARGE_TIER_RPM")? {
            config.large_tier_rpm = v;
        }
        if let Some(v) = env_parse("LARGE_TIER_TOKEN_BUDGET")? {
            config.large_tier_token_budget = v;
        }
        if let Some(v) = env_parse("MIN_CONFIDENCE")? {
            config.min_confidence = v;
        }
        if let Some(raw) = env_string("TOLERANCE_ABS") {
            config.tolerance_abs = Money::parse(&raw).map_err(|e| ConfigError::InvalidValue {
                key: key("TOLERANCE_ABS"),
                reason: e.to_string(),
            })?;
        }
        if let Some(raw) = env_string("TOLERANCE_REL") {
            config.tolerance_rel =
                Decimal::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                    key: key("TOLERANCE_REL"),
                    reason: e.to_string(),
                })?;
        }
        if let Some(v) = env_parse("FUZZY_THRESHOLD")? {
            config.fuzzy_threshold = v;
        }
        if let Some(v) = env_parse("COOLDOWN_SECS")? {
            config.cooldown_secs = v;
        }
        if let Some(v) = env_parse("DIGEST_INTERVAL_HOURS")? {
            config.digest_interval_hours = v;
        }
        if let Some(v) = env_parse("CACHE_TTL_DAYS")? {
            config.cache_ttl_days = v;
        }
        if let Some(v) = env_parse("RETRAIN_INTERVAL_HOURS")? {
            config.retrain_interval_hours = v;
        }
        if let Some(v) = env_parse("PENDING_ESCALATION_AGE_DAYS")? {
            config.pending_escalation_age_days = v;
        }
        if let Some(v) = env_parse("ALLOW_BILL_AUTHORIZATION")? {
            config.allow_bill_authorization = v;
        }
        if let Some(raw) = env_string("ESCALATION_AMOUNT") {
            config.escalation_amount = Money::parse(&raw).map_err(|e| ConfigError::InvalidValue {
                key: key("ESCALATION_AMOUNT"),
                reason: e.to_string(),
            })?;
        }
        if let Some(raw) = env_string("POWER_TOOL_LEXICON") {
            config.power_tool_lexicon = split_csv(&raw);
        }
        if let Some(raw) = env_string("POWER_TOOL_QUALIFIERS") {
            config.power_tool_qualifiers = split_csv(&raw);
        }
        if let Some(v) = env_parse("MAX_UPLOAD_BYTES")? {
            config.max_upload_bytes = v;
        }
        if let Some(v) = env_parse("MAX_RASTER_PAGES")? {
            config.max_raster_pages = v;
        }
        if let Some(v) = env_parse("MAX_RASTER_DPI")? {
            config.max_raster_dpi = v;
        }
        if let Some(v) = env_parse("HITL_CONFIDENCE")? {
            config.hitl_confidence = v;
        }
        if let Some(v) = env_parse("RECONCILE_AUTO_APPLY")? {
            config.reconcile_auto_apply = v;
        }
        if let Some(v) = env_parse("RECONCILE_AUTO_APPLY_MIN_CONFIDENCE")? {
            config.reconcile_auto_apply_min_confidence = v;
        }
        if let Some(v) = env_string("TOKEN_SECRET") {
            config.token_secret = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Semantic validation. Returns all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();
        if self.min_confidence > 100 {
            reasons.push("min_confidence must be 0-100".to_string());
        }
        if self.fuzzy_threshold > 100 {
            reasons.push("fuzzy_threshold must be 0-100".to_string());
        }
        if self.hitl_confidence > 100 {
            reasons.push("hitl_confidence must be 0-100".to_string());
        }
        if self.max_upload_bytes == 0 {
            reasons.push("max_upload_bytes must be positive".to_string());
        }
        if self.max_raster_pages == 0 {
            reasons.push("max_raster_pages must be positive".to_string());
        }
        if self.cache_ttl_days <= 0 {
            reasons.push("cache_ttl_days must be positive".to_string());
        }
        if self.tolerance_abs.is_negative() {
            reasons.push("tolerance_abs must not be negative".to_string());
        }
        if self.tolerance_rel.is_sign_negative() {
            reasons.push("tolerance_rel must not be negative".to_string());
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }

    /// Whether a description names a power tool without an exempting
    /// qualifier such as "bit" or "blade".
    ///
    /// Power-tool lines must never auto-post as consumables; the
    /// categorization guard and the escalation rule both consult this.
    #[must_use]
    pub fn matches_power_tool(&self, description: &str) -> bool {
        let normalized = sl_core::normalize_description(description);
        let padded = format!(" {normalized} ");
        let has_tool = self
            .power_tool_lexicon
            .iter()
            .any(|term| padded.contains(&format!(" {term} ")));
        if !has_tool {
            return false;
        }
        let exempt = self
            .power_tool_qualifiers
            .iter()
            .any(|qualifier| padded.contains(&format!(" {qualifier} ")));
        !exempt
    }

    /// Advisory warnings for the operator log.
    #[must_use]
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if self.llm_api_key.is_none() {
            warnings.push(ConfigWarning::NoLlmCredentials);
        }
        if self.database_url.is_none() {
            warnings.push(ConfigWarning::NoDatabaseUrl);
        }
        if self.token_secret == DEV_TOKEN_SECRET {
            warnings.push(ConfigWarning::DefaultTokenSecret);
        }
        if self.cooldown_secs > 300 {
            warnings.push(ConfigWarning::LargeValue {
                key: key("COOLDOWN_SECS"),
                value: self.cooldown_secs.to_string(),
            });
        }
        if self.max_upload_bytes > 100 * 1024 * 1024 {
            warnings.push(ConfigWarning::LargeValue {
                key: key("MAX_UPLOAD_BYTES"),
                value: self.max_upload_bytes.to_string(),
            });
        }
        warnings
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn key(suffix: &str) -> String {
    format!("{ENV_PREFIX}{suffix}")
}

fn env_string(suffix: &str) -> Option<String> {
    std::env::var(key(suffix)).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(suffix: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_string(suffix) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
            ConfigError::InvalidValue {
                key: key(suffix),
                reason: e.to_string(),
            }
        }),
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_are_valid() {
        let config = SiteLedgerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_confidence, 70);
        assert_eq!(config.fuzzy_threshold, 85);
        assert_eq!(config.cooldown_secs, 5);
        assert_eq!(config.digest_interval_hours, 4);
        assert_eq!(config.cache_ttl_days, 30);
        assert_eq!(config.retrain_interval_hours, 6);
        assert_eq!(config.tolerance_abs, Money::from_cents(5));
        assert_eq!(config.tolerance_rel, dec!(0.005));
    }

    #[test]
    fn default_lexicon_is_seeded() {
        let config = SiteLedgerConfig::default();
        assert!(config.power_tool_lexicon.contains(&"drill".to_string()));
        assert!(config.power_tool_qualifiers.contains(&"blade".to_string()));
    }

    #[test]
    fn default_warnings_flag_missing_credentials() {
        let warnings = SiteLedgerConfig::default().warnings();
        assert!(warnings.contains(&ConfigWarning::NoLlmCredentials));
        assert!(warnings.contains(&ConfigWarning::NoDatabaseUrl));
        assert!(warnings.contains(&ConfigWarning::DefaultTokenSecret));
    }

    #[test]
    fn validation_rejects_out_of_range_confidence() {
        let config = SiteLedgerConfig {
            min_confidence: 101,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("min_confidence")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn validation_collects_all_problems() {
        let config = SiteLedgerConfig {
            min_confidence: 200,
            fuzzy_threshold: 200,
            max_upload_bytes: 0,
            ..Default::default()
        };
        match config.validate().unwrap_err() {
            ConfigError::ValidationError { reasons } => assert_eq!(reasons.len(), 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn power_tool_guard_matches_and_exempts() {
        let config = SiteLedgerConfig::default();
        assert!(config.matches_power_tool("DeWalt 20V drill"));
        assert!(config.matches_power_tool("Makita circular saw"));
        assert!(!config.matches_power_tool("drill bit set"));
        assert!(!config.matches_power_tool("circular saw blade 24T"));
        assert!(!config.matches_power_tool("2x4 lumber"));
    }

    #[test]
    fn split_csv_normalizes() {
        assert_eq!(
            split_csv("Drill, SAW ,, grinder "),
            vec!["drill", "saw", "grinder"]
        );
    }

    #[test]
    fn large_cooldown_warns() {
        let config = SiteLedgerConfig {
            cooldown_secs: 3_600,
            ..Default::default()
        };
        assert!(config
            .warnings()
            .iter()
            .any(|w| matches!(w, ConfigWarning::LargeValue { key, .. } if key.contains("COOLDOWN"))));
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = SiteLedgerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: SiteLedgerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
