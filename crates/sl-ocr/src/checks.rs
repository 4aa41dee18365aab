// SPDX-License-Identifier: MIT OR Apache-2.0
//! Post-extraction totals cross-check.

use rust_decimal::Decimal;
use sl_core::{Money, ParsedReceipt, TotalMatchType};

/// Classify how a receipt's line totals agree with its own totals.
///
/// Tolerance is the greater of `abs` and `rel` (a fraction) of the larger
/// amount.
#[must_use]
pub fn total_match(receipt: &ParsedReceipt, abs: Money, rel: Decimal) -> TotalMatchType {
    if receipt.line_items.is_empty() {
        return TotalMatchType::Mismatch;
    }
    let line_sum = receipt.line_total_sum();
    if let Some(total) = receipt.total
        && line_sum.within_tolerance(total, abs, rel)
    {
        return TotalMatchType::Total;
    }
    if let Some(subtotal) = receipt.subtotal
        && line_sum.within_tolerance(subtotal, abs, rel)
    {
        return TotalMatchType::Subtotal;
    }
    TotalMatchType::Mismatch
}
