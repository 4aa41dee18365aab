// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-telemetry
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use sl_core::{ProjectId, TotalMatchType};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Once};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// OCR call metrics
// ---------------------------------------------------------------------------

/// Extraction method used for one OCR call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrMethod {
    /// Fast path: native text extraction plus vendor parsers.
    Text,
    /// Heavy path: rasterization plus the vision model.
    Vision,
}

/// Metrics captured for a single OCR call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OcrCallMetrics {
    /// Agent or caller identifier.
    pub agent: String,
    /// Extraction method.
    pub method: OcrMethod,
    /// Model tier used, when the vision model was involved.
    pub model_tier: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub wall_ms: u64,
    /// Characters of text processed.
    pub char_count: usize,
    /// Line items extracted.
    pub item_count: usize,
    /// Whether a tax amount was detected.
    pub tax_detected: bool,
    /// Outcome of the totals cross-check.
    pub total_match_type: Option<TotalMatchType>,
    /// Whether the call produced a usable record.
    pub success: bool,
    /// Project the receipt belongs to.
    pub project: ProjectId,
}

// ---------------------------------------------------------------------------
// Categorization metrics
// ---------------------------------------------------------------------------

/// Aggregate metrics for one categorization engine call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CategorizationMetrics {
    /// Rows answered from the cache.
    pub cache_hits: u64,
    /// Rows that missed the cache.
    pub cache_misses: u64,
    /// LLM tokens consumed across both tiers.
    pub llm_tokens_used: u64,
    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u64,
    /// Rows with confidence below 70.
    pub below_70_count: u64,
    /// Rows with confidence below 60.
    pub below_60_count: u64,
    /// Rows with confidence below 50.
    pub below_50_count: u64,
}

impl CategorizationMetrics {
    /// Record one row's final confidence into the low-confidence counters.
    pub fn record_confidence(&mut self, confidence: u8) {
        if confidence < 70 {
            self.below_70_count += 1;
        }
        if confidence < 60 {
            self.below_60_count += 1;
        }
        if confidence < 50 {
            self.below_50_count += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Aggregated statistics across recorded OCR calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OcrSummary {
    /// Number of calls recorded.
    pub count: usize,
    /// Mean wall time in milliseconds.
    pub mean_wall_ms: f64,
    /// Median (p50) wall time in milliseconds.
    pub p50_wall_ms: f64,
    /// 99th-percentile wall time in milliseconds.
    pub p99_wall_ms: f64,
    /// Success rate (successes / total calls).
    pub success_rate: f64,
    /// Per-method call counts (deterministic ordering).
    pub method_counts: BTreeMap<String, usize>,
}

/// Compute a percentile value from a **sorted** slice.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Thread-safe collector for pipeline metrics.
///
/// Clone freely; the inner storage is shared behind a `Mutex`.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    ocr: Arc<Mutex<Vec<OcrCallMetrics>>>,
    categorization: Arc<Mutex<Vec<CategorizationMetrics>>>,
}

impl MetricsCollector {
    /// Create a new, empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one OCR call.
    pub fn record_ocr(&self, metrics: OcrCallMetrics) {
        self.ocr.lock().expect("metrics lock poisoned").push(metrics);
    }

    /// Record one categorization run.
    pub fn record_categorization(&self, metrics: CategorizationMetrics) {
        self.categorization
            .lock()
            .expect("metrics lock poisoned")
            .push(metrics);
    }

    /// All recorded OCR rows.
    #[must_use]
    pub fn ocr_calls(&self) -> Vec<OcrCallMetrics> {
        self.ocr.lock().expect("metrics lock poisoned").clone()
    }

    /// All recorded categorization rows.
    #[must_use]
    pub fn categorization_runs(&self) -> Vec<CategorizationMetrics> {
        self.categorization
            .lock()
            .expect("metrics lock poisoned")
            .clone()
    }

    /// Aggregated summary of all recorded OCR calls.
    #[must_use]
    pub fn ocr_summary(&self) -> OcrSummary {
        let data = self.ocr.lock().expect("metrics lock poisoned");
        if data.is_empty() {
            return OcrSummary::default();
        }

        let count = data.len();
        let mut walls: Vec<u64> = data.iter().map(|r| r.wall_ms).collect();
        walls.sort_unstable();

        let successes = data.iter().filter(|r| r.success).count();
        let mut method_counts: BTreeMap<String, usize> = BTreeMap::new();
        for row in data.iter() {
            let method = match row.method {
                OcrMethod::Text => "text",
                OcrMethod::Vision => "vision",
            };
            *method_counts.entry(method.to_string()).or_insert(0) += 1;
        }

        OcrSummary {
            count,
            mean_wall_ms: walls.iter().sum::<u64>() as f64 / count as f64,
            p50_wall_ms: percentile(&walls, 50.0),
            p99_wall_ms: percentile(&walls, 99.0),
            success_rate: successes as f64 / count as f64,
            method_counts,
        }
    }

    /// Clear all recorded metrics.
    pub fn clear(&self) {
        self.ocr.lock().expect("metrics lock poisoned").clear();
        self.categorization
            .lock()
            .expect("metrics lock poisoned")
            .clear();
    }
}

// ---------------------------------------------------------------------------
// Tracing init
// ---------------------------------------------------------------------------

static TRACING_INIT: Once = Once::new();

/// Initialise the global tracing subscriber with the given filter directive.
///
/// Safe to call more than once; only the first call installs a subscriber,
/// so tests can call it freely.
pub fn init_tracing(filter: &str) {
    let directive = filter.to_string();
    TRACING_INIT.call_once(move || {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ocr_row(wall_ms: u64, success: bool, method: OcrMethod) -> OcrCallMetrics {
        OcrCallMetrics {
            agent: "receipt-agent".into(),
            method,
            model_tier: matches!(method, OcrMethod::Vision).then(|| "large-vision-1".into()),
            wall_ms,
            char_count: 512,
            item_count: 3,
            tax_detected: true,
            total_match_type: Some(TotalMatchType::Total),
            success,
            project: ProjectId::nil(),
        }
    }

    #[test]
    fn empty_summary() {
        let c = MetricsCollector::new();
        let s = c.ocr_summary();
        assert_eq!(s.count, 0);
        assert_eq!(s.success_rate, 0.0);
        assert!(s.method_counts.is_empty());
    }

    #[test]
    fn summary_counts_and_methods() {
        let c = MetricsCollector::new();
        c.record_ocr(ocr_row(100, true, OcrMethod::Text));
        c.record_ocr(ocr_row(300, true, OcrMethod::Vision));
        c.record_ocr(ocr_row(200, false, OcrMethod::Vision));
        let s = c.ocr_summary();
        assert_eq!(s.count, 3);
        assert_eq!(s.method_counts["text"], 1);
        assert_eq!(s.method_counts["vision"], 2);
        assert!((s.mean_wall_ms - 200.0).abs() < f64::EPSILON);
        assert!((s.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn summary_p50() {
        let c = MetricsCollector::new();
        for wall in [10, 20, 30, 40, 50] {
            c.record_ocr(ocr_row(wall, true, OcrMethod::Text));
        }
        let s = c.ocr_summary();
        assert!((s.p50_wall_ms - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn confidence_buckets() {
        let mut m = CategorizationMetrics::default();
        m.record_confidence(95);
        m.record_confidence(65);
        m.record_confidence(55);
        m.record_confidence(45);
        assert_eq!(m.below_70_count, 3);
        assert_eq!(m.below_60_count, 2);
        assert_eq!(m.below_50_count, 1);
    }

    #[test]
    fn categorization_rows_accumulate() {
        let c = MetricsCollector::new();
        c.record_categorization(CategorizationMetrics {
            cache_hits: 2,
            cache_misses: 1,
            ..Default::default()
        });
        assert_eq!(c.categorization_runs().len(), 1);
        c.clear();
        assert!(c.categorization_runs().is_empty());
    }

    #[test]
    fn concurrent_recording() {
        let c = MetricsCollector::new();
        let mut handles = vec![];
        for i in 0..8 {
            let cc = c.clone();
            handles.push(std::thread::spawn(move || {
                cc.record_ocr(ocr_row(i * 10, true, OcrMethod::Text));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.ocr_calls().len(), 8);
    }

    #[test]
    fn metrics_serde_roundtrip() {
        let row = ocr_row(42, true, OcrMethod::Vision);
        let json = serde_json::to_string(&row).unwrap();
        let back: OcrCallMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn percentile_edge_cases() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[42], 99.0), 42.0);
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing("info");
        init_tracing("debug");
    }
}
