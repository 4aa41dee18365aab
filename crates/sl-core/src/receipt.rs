// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structured receipt records produced by the OCR pipeline.

use crate::money::Money;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TotalMatchType
// ---------------------------------------------------------------------------

/// Outcome of cross-checking line totals against the receipt's own totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalMatchType {
    /// Line totals agree with the grand total.
    Total,
    /// Line totals agree with the subtotal but not the total.
    Subtotal,
    /// Line totals agree with neither.
    Mismatch,
}

// ---------------------------------------------------------------------------
// LineItem
// ---------------------------------------------------------------------------

/// One extracted purchase line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    /// Item description as printed.
    pub description: String,
    /// Quantity, when printed.
    #[serde(default)]
    pub quantity: Option<Decimal>,
    /// Unit price, when printed.
    #[serde(default)]
    pub unit_price: Option<Money>,
    /// Line total, when printed or derivable.
    #[serde(default)]
    pub line_total: Option<Money>,
    /// Extraction confidence 0–100 for this line.
    pub confidence: u8,
}

// ---------------------------------------------------------------------------
// ParsedReceipt
// ---------------------------------------------------------------------------

/// Per-scalar extraction confidences, 0–100 each.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReceiptConfidence {
    /// Confidence in the detected vendor string.
    pub vendor: u8,
    /// Confidence in the detected date.
    pub date: u8,
    /// Confidence in the grand total.
    pub total: u8,
    /// Confidence in the subtotal.
    pub subtotal: u8,
    /// Confidence in the tax amount.
    pub tax: u8,
}

impl ReceiptConfidence {
    /// Lowest confidence across the scalars actually present on the
    /// receipt; absent scalars do not drag the minimum down.
    #[must_use]
    pub fn min_present(&self, receipt: &ParsedReceipt) -> u8 {
        let mut min = 100u8;
        if receipt.vendor.is_some() {
            min = min.min(self.vendor);
        }
        if receipt.date.is_some() {
            min = min.min(self.date);
        }
        if receipt.total.is_some() {
            min = min.min(self.total);
        }
        min
    }
}

/// The normalized record extracted from one uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedReceipt {
    /// Vendor name as detected.
    pub vendor: Option<String>,
    /// Receipt date.
    pub date: Option<NaiveDate>,
    /// Grand total.
    pub total: Option<Money>,
    /// Subtotal before tax.
    pub subtotal: Option<Money>,
    /// Tax amount.
    pub tax: Option<Money>,
    /// Extracted purchase lines.
    pub line_items: Vec<LineItem>,
    /// Per-scalar confidences.
    pub confidence: ReceiptConfidence,
    /// Result of the totals cross-check.
    pub total_match_type: TotalMatchType,
}

impl ParsedReceipt {
    /// Sum of line totals for lines that carry one.
    #[must_use]
    pub fn line_total_sum(&self) -> Money {
        self.line_items
            .iter()
            .filter_map(|item| item.line_total)
            .sum()
    }

    /// Whether a tax amount was detected.
    #[must_use]
    pub fn tax_detected(&self) -> bool {
        self.tax.is_some_and(|t| !t.is_zero())
    }
}
