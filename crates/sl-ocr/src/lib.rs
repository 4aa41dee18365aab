// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-ocr
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Totals cross-checking.
pub mod checks;
/// Vendor detection and text parsers.
pub mod parsers;
/// The rasterization seam.
pub mod raster;

pub use raster::{FixedPageRasterizer, PassthroughRasterizer, Rasterizer};

use chrono::NaiveDate;
use serde_json::{Value, json};
use sl_config::SiteLedgerConfig;
use sl_core::{LineItem, Money, ParsedReceipt, ProjectId, ReceiptConfidence, TotalMatchType};
use sl_error::{CoreError, CoreResult};
use sl_llm::{LlmGateway, PageImage};
use sl_telemetry::{MetricsCollector, OcrCallMetrics, OcrMethod};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// One file to extract.
pub struct OcrRequest {
    /// The uploaded bytes. Consumed by the call; no buffer outlives it.
    pub blob: Vec<u8>,
    /// Declared MIME type.
    pub mime_type: String,
    /// Requesting project.
    pub project: ProjectId,
    /// Construction stage of the project.
    pub stage: String,
    /// Text already attached by an upstream OCR pass, when the upload's
    /// metadata declares one.
    pub declared_text: Option<String>,
    /// Caller identifier for metrics.
    pub agent: String,
}

/// The pipeline's answer.
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    /// The structured receipt.
    pub receipt: ParsedReceipt,
    /// Raw text, when the fast path extracted any.
    pub extracted_text: Option<String>,
    /// Which method produced the record.
    pub method: OcrMethod,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The OCR pipeline. Share behind an `Arc`.
pub struct OcrPipeline {
    config: SiteLedgerConfig,
    gateway: Arc<dyn LlmGateway>,
    rasterizer: Arc<dyn Rasterizer>,
    collector: MetricsCollector,
}

impl OcrPipeline {
    /// Assemble the pipeline.
    #[must_use]
    pub fn new(
        config: SiteLedgerConfig,
        gateway: Arc<dyn LlmGateway>,
        rasterizer: Arc<dyn Rasterizer>,
        collector: MetricsCollector,
    ) -> Self {
        Self {
            config,
            gateway,
            rasterizer,
            collector,
        }
    }

    /// Extract a structured receipt from an uploaded file.
    ///
    /// Text-bearing uploads take the fast path and fall through to vision
    /// when the parse is incomplete. The blob and any rasterized pages are
    /// dropped before this function returns.
    pub async fn process(&self, request: OcrRequest) -> CoreResult<OcrOutcome> {
        let started = Instant::now();
        let OcrRequest {
            blob,
            mime_type,
            project,
            stage: _,
            declared_text,
            agent,
        } = request;

        // Fast path: native text or upstream-declared OCR text.
        let text = extract_text(&blob, &mime_type, declared_text);
        if let Some(text) = &text {
            if let Some(mut receipt) = parsers::parse_text(text)
                && parsers::parse_is_sufficient(&receipt)
            {
                drop(blob);
                receipt.total_match_type = checks::total_match(
                    &receipt,
                    self.config.tolerance_abs,
                    self.config.tolerance_rel,
                );
                let outcome = OcrOutcome {
                    extracted_text: Some(text.clone()),
                    method: OcrMethod::Text,
                    receipt,
                };
                self.record(&agent, &outcome, started, project, text.len(), true);
                return Ok(outcome);
            }
            debug!("text parse incomplete; falling through to vision");
        }

        // Heavy path: rasterize and ask the vision tier.
        let pages = self.rasterizer.rasterize(
            &blob,
            &mime_type,
            self.config.max_raster_pages,
            self.config.max_raster_dpi,
        )?;
        // The original buffer is not needed past rasterization.
        drop(blob);

        let reply = self
            .gateway
            .extract_vision(&pages, &vision_prompt(), &receipt_schema())
            .await;
        // Image buffers must not outlive the call.
        drop(pages);

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                self.record_failure(&agent, started, project);
                return Err(err.into());
            }
        };

        let mut receipt = receipt_from_value(&reply.value)?;
        receipt.total_match_type = checks::total_match(
            &receipt,
            self.config.tolerance_abs,
            self.config.tolerance_rel,
        );
        let outcome = OcrOutcome {
            extracted_text: text,
            method: OcrMethod::Vision,
            receipt,
        };
        self.record(&agent, &outcome, started, project, 0, true);
        info!(
            items = outcome.receipt.line_items.len(),
            match_type = ?outcome.receipt.total_match_type,
            "vision extraction completed"
        );
        Ok(outcome)
    }

    fn record(
        &self,
        agent: &str,
        outcome: &OcrOutcome,
        started: Instant,
        project: ProjectId,
        char_count: usize,
        success: bool,
    ) {
        self.collector.record_ocr(OcrCallMetrics {
            agent: agent.to_string(),
            method: outcome.method,
            model_tier: matches!(outcome.method, OcrMethod::Vision)
                .then(|| self.config.large_model_id.clone()),
            wall_ms: started.elapsed().as_millis() as u64,
            char_count,
            item_count: outcome.receipt.line_items.len(),
            tax_detected: outcome.receipt.tax_detected(),
            total_match_type: Some(outcome.receipt.total_match_type),
            success,
            project,
        });
    }

    fn record_failure(&self, agent: &str, started: Instant, project: ProjectId) {
        self.collector.record_ocr(OcrCallMetrics {
            agent: agent.to_string(),
            method: OcrMethod::Vision,
            model_tier: Some(self.config.large_model_id.clone()),
            wall_ms: started.elapsed().as_millis() as u64,
            char_count: 0,
            item_count: 0,
            tax_detected: false,
            total_match_type: None,
            success: false,
            project,
        });
    }
}

// ---------------------------------------------------------------------------
// Vision wire shape
// ---------------------------------------------------------------------------

fn vision_prompt() -> String {
    "Extract this receipt or invoice. Report every purchase line with its \
     printed amount, plus vendor, date, subtotal, tax, and total. Amounts \
     are decimal strings with two fraction digits. Give each scalar a \
     confidence from 0 to 100."
        .to_string()
}

/// The explicit schema the vision tier must satisfy.
#[must_use]
pub fn receipt_schema() -> Value {
    json!({
        "type": "object",
        "required": ["line_items", "confidence"],
        "properties": {
            "vendor": { "type": ["string", "null"] },
            "date": { "type": ["string", "null"] },
            "total": { "type": ["string", "null"] },
            "subtotal": { "type": ["string", "null"] },
            "tax": { "type": ["string", "null"] },
            "line_items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["description"],
                    "properties": {
                        "description": { "type": "string" },
                        "quantity": { "type": ["string", "null"] },
                        "unit_price": { "type": ["string", "null"] },
                        "line_total": { "type": ["string", "null"] },
                        "confidence": { "type": "integer" }
                    }
                }
            },
            "confidence": {
                "type": "object",
                "properties": {
                    "vendor": { "type": "integer" },
                    "date": { "type": "integer" },
                    "total": { "type": "integer" },
                    "subtotal": { "type": "integer" },
                    "tax": { "type": "integer" }
                }
            }
        }
    })
}

/// Map a vision-tier reply onto a [`ParsedReceipt`].
///
/// Amount fields accept decimal strings (and numbers, via their decimal
/// rendering) — binary floats never enter the money path.
pub fn receipt_from_value(value: &Value) -> CoreResult<ParsedReceipt> {
    let line_items = value
        .get("line_items")
        .and_then(Value::as_array)
        .ok_or_else(|| CoreError::new(
            sl_error::ErrorKind::UpstreamInvalid,
            "vision reply missing line_items",
        ))?
        .iter()
        .map(|item| LineItem {
            description: item
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            quantity: opt_string(item.get("quantity"))
                .and_then(|q| q.parse::<rust_decimal::Decimal>().ok()),
            unit_price: opt_money(item.get("unit_price")),
            line_total: opt_money(item.get("line_total")),
            confidence: opt_confidence(item.get("confidence")),
        })
        .collect();

    let confidence_value = value.get("confidence");
    Ok(ParsedReceipt {
        vendor: opt_string(value.get("vendor")),
        date: opt_string(value.get("date")).and_then(|d| d.parse::<NaiveDate>().ok()),
        total: opt_money(value.get("total")),
        subtotal: opt_money(value.get("subtotal")),
        tax: opt_money(value.get("tax")),
        line_items,
        confidence: ReceiptConfidence {
            vendor: scalar_confidence(confidence_value, "vendor"),
            date: scalar_confidence(confidence_value, "date"),
            total: scalar_confidence(confidence_value, "total"),
            subtotal: scalar_confidence(confidence_value, "subtotal"),
            tax: scalar_confidence(confidence_value, "tax"),
        },
        total_match_type: TotalMatchType::Mismatch,
    })
}

fn opt_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn opt_money(value: Option<&Value>) -> Option<Money> {
    opt_string(value).and_then(|raw| Money::parse(&raw).ok())
}

fn opt_confidence(value: Option<&Value>) -> u8 {
    value
        .and_then(Value::as_u64)
        .map(|c| c.min(100) as u8)
        .unwrap_or(0)
}

fn scalar_confidence(confidence: Option<&Value>, field: &str) -> u8 {
    opt_confidence(confidence.and_then(|c| c.get(field)))
}

fn extract_text(blob: &[u8], mime_type: &str, declared: Option<String>) -> Option<String> {
    if let Some(text) = declared
        && !text.trim().is_empty()
    {
        return Some(text);
    }
    if mime_type.starts_with("text/") {
        let text = String::from_utf8_lossy(blob).into_owned();
        if !text.trim().is_empty() {
            return Some(text);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sl_llm::{LlmError, MockGateway};

    const TEXT_RECEIPT: &str = "\
THE HOME DEPOT #4512
2026-03-10
2x4 stud 8ft x2      12.00
wood screws 1lb       4.50
SUBTOTAL             16.50
TOTAL                16.50
";

    fn pipeline(gateway: Arc<MockGateway>) -> OcrPipeline {
        OcrPipeline::new(
            SiteLedgerConfig::default(),
            gateway,
            Arc::new(PassthroughRasterizer),
            MetricsCollector::new(),
        )
    }

    fn text_request(text: &str) -> OcrRequest {
        OcrRequest {
            blob: text.as_bytes().to_vec(),
            mime_type: "text/plain".into(),
            project: ProjectId::nil(),
            stage: "framing".into(),
            declared_text: None,
            agent: "test".into(),
        }
    }

    fn vision_reply() -> Value {
        json!({
            "vendor": "Harbor Freight",
            "date": "2026-03-11",
            "total": "199.00",
            "subtotal": "199.00",
            "tax": null,
            "line_items": [
                {
                    "description": "DeWalt 20V drill",
                    "quantity": "1",
                    "unit_price": "199.00",
                    "line_total": "199.00",
                    "confidence": 97
                }
            ],
            "confidence": { "vendor": 95, "date": 90, "total": 98, "subtotal": 98, "tax": 0 }
        })
    }

    #[tokio::test]
    async fn fast_path_skips_vision() {
        let gateway = Arc::new(MockGateway::new());
        let pipeline = pipeline(Arc::clone(&gateway));
        let outcome = pipeline.process(text_request(TEXT_RECEIPT)).await.unwrap();
        assert_eq!(outcome.method, OcrMethod::Text);
        assert_eq!(outcome.receipt.vendor.as_deref(), Some("Home Depot"));
        assert_eq!(outcome.receipt.line_items.len(), 2);
        assert_eq!(outcome.receipt.total_match_type, TotalMatchType::Total);
        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn incomplete_text_falls_through_to_vision() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_reply(vision_reply());
        let pipeline = OcrPipeline::new(
            SiteLedgerConfig::default(),
            Arc::clone(&gateway) as Arc<dyn LlmGateway>,
            Arc::new(FixedPageRasterizer { pages: 1 }),
            MetricsCollector::new(),
        );
        // Unknown vendor: parser result is insufficient.
        let outcome = pipeline
            .process(text_request("corner store\nwidget  5.00\nTOTAL  5.00\n"))
            .await
            .unwrap();
        assert_eq!(outcome.method, OcrMethod::Vision);
        assert_eq!(outcome.receipt.vendor.as_deref(), Some("Harbor Freight"));
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn image_upload_goes_to_vision() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_reply(vision_reply());
        let pipeline = pipeline(Arc::clone(&gateway));
        let request = OcrRequest {
            blob: vec![0xFF, 0xD8, 0xFF],
            mime_type: "image/jpeg".into(),
            project: ProjectId::nil(),
            stage: "framing".into(),
            declared_text: None,
            agent: "test".into(),
        };
        let outcome = pipeline.process(request).await.unwrap();
        assert_eq!(outcome.method, OcrMethod::Vision);
        assert_eq!(
            outcome.receipt.total,
            Some(Money::parse("199.00").unwrap())
        );
        let calls = gateway.calls();
        assert_eq!(calls[0].image_count, 1);
    }

    #[tokio::test]
    async fn declared_text_uses_fast_path() {
        let gateway = Arc::new(MockGateway::new());
        let pipeline = pipeline(Arc::clone(&gateway));
        let request = OcrRequest {
            blob: vec![0u8; 4],
            mime_type: "image/png".into(),
            project: ProjectId::nil(),
            stage: "framing".into(),
            declared_text: Some(TEXT_RECEIPT.to_string()),
            agent: "test".into(),
        };
        let outcome = pipeline.process(request).await.unwrap();
        assert_eq!(outcome.method, OcrMethod::Text);
        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn vision_failure_surfaces_and_records() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_error(LlmError::Timeout);
        let collector = MetricsCollector::new();
        let pipeline = OcrPipeline::new(
            SiteLedgerConfig::default(),
            Arc::clone(&gateway) as Arc<dyn LlmGateway>,
            Arc::new(PassthroughRasterizer),
            collector.clone(),
        );
        let request = OcrRequest {
            blob: vec![0u8; 4],
            mime_type: "image/png".into(),
            project: ProjectId::nil(),
            stage: "framing".into(),
            declared_text: None,
            agent: "test".into(),
        };
        let err = pipeline.process(request).await.unwrap_err();
        assert_eq!(err.kind, sl_error::ErrorKind::UpstreamTimeout);
        let calls = collector.ocr_calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].success);
    }

    #[tokio::test]
    async fn metrics_row_written_per_call() {
        let gateway = Arc::new(MockGateway::new());
        let collector = MetricsCollector::new();
        let pipeline = OcrPipeline::new(
            SiteLedgerConfig::default(),
            gateway,
            Arc::new(PassthroughRasterizer),
            collector.clone(),
        );
        pipeline.process(text_request(TEXT_RECEIPT)).await.unwrap();
        let calls = collector.ocr_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, OcrMethod::Text);
        assert_eq!(calls[0].item_count, 2);
        assert!(calls[0].success);
        assert_eq!(calls[0].total_match_type, Some(TotalMatchType::Total));
    }

    #[test]
    fn mismatched_receipt_is_flagged() {
        let mut receipt = receipt_from_value(&vision_reply()).unwrap();
        receipt.total = Some(Money::parse("1048.05").unwrap());
        let match_type = checks::total_match(
            &receipt,
            Money::from_cents(5),
            rust_decimal_macros::dec!(0.005),
        );
        assert_eq!(match_type, TotalMatchType::Mismatch);
    }

    #[test]
    fn vision_value_mapping() {
        let receipt = receipt_from_value(&vision_reply()).unwrap();
        assert_eq!(receipt.vendor.as_deref(), Some("Harbor Freight"));
        assert_eq!(receipt.date, NaiveDate::from_ymd_opt(2026, 3, 11));
        assert_eq!(receipt.tax, None);
        assert_eq!(receipt.confidence.vendor, 95);
        assert_eq!(receipt.line_items[0].confidence, 97);
        assert_eq!(
            receipt.line_items[0].quantity,
            Some(rust_decimal::Decimal::from(1))
        );
    }
}
