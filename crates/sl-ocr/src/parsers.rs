// SPDX-License-Identifier: MIT OR Apache-2.0
//! Vendor detection and text-mode receipt parsers.
//!
//! Parsers are regex-driven and keyed by the detected vendor string. The
//! generic parser handles the common "description … amount" line shape;
//! vendor entries add the banner patterns that identify them and can bias
//! the total keywords.

use chrono::NaiveDate;
use regex::Regex;
use sl_core::{LineItem, Money, ParsedReceipt, ReceiptConfidence, TotalMatchType};
use std::sync::LazyLock;

/// Confidence assigned to scalars the text parser extracted directly.
const TEXT_CONFIDENCE: u8 = 92;

static TOTAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*total\b[^0-9\-]*(-?\d[\d,]*\.\d{2})\s*$").expect("total regex")
});
static SUBTOTAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*sub\s*-?total\b[^0-9\-]*(-?\d[\d,]*\.\d{2})\s*$").expect("subtotal regex")
});
static TAX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:sales\s+)?tax\b[^0-9\-]*(-?\d[\d,]*\.\d{2})\s*$").expect("tax regex")
});
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})-(\d{2})-(\d{2})|(\d{1,2})/(\d{1,2})/(\d{4})").expect("date regex")
});
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    // "2x4 stud 8ft   12.00" or "wood screws x2 @ 2.25  $4.50"
    Regex::new(r"(?m)^\s*(?P<desc>[A-Za-z0-9][^$\n]{2,60}?)\s+\$?(?P<amount>\d[\d,]*\.\d{2})\s*$")
        .expect("line regex")
});
static QTY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:x\s*(?P<qty_a>\d{1,3})|(?P<qty_b>\d{1,3})\s*@)\b").expect("qty regex")
});

/// The known-vendor registry: (canonical name, banner pattern).
static VENDOR_BANNERS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        ("Home Depot", Regex::new(r"(?i)\bhome\s+depot\b").expect("banner")),
        ("Lowe's", Regex::new(r"(?i)\blowe'?s\b").expect("banner")),
        (
            "Harbor Freight",
            Regex::new(r"(?i)\bharbor\s+freight\b").expect("banner"),
        ),
        (
            "Ace Hardware",
            Regex::new(r"(?i)\bace\s+hardware\b").expect("banner"),
        ),
        (
            "Ferguson",
            Regex::new(r"(?i)\bferguson\b").expect("banner"),
        ),
        (
            "White Cap",
            Regex::new(r"(?i)\bwhite\s*cap\b").expect("banner"),
        ),
    ]
});

/// Identify the vendor from receipt text.
#[must_use]
pub fn detect_vendor(text: &str) -> Option<&'static str> {
    VENDOR_BANNERS
        .iter()
        .find(|(_, banner)| banner.is_match(text))
        .map(|(name, _)| *name)
}

/// Parse extracted receipt text into a structured record.
///
/// Returns `None` when the text yields neither a total nor any line items —
/// the caller falls through to the vision tier.
#[must_use]
pub fn parse_text(text: &str) -> Option<ParsedReceipt> {
    let vendor = detect_vendor(text);
    let total = first_amount(&TOTAL_RE, text);
    let subtotal = first_amount(&SUBTOTAL_RE, text);
    let tax = first_amount(&TAX_RE, text);
    let date = first_date(text);

    let mut line_items = Vec::new();
    for captures in LINE_RE.captures_iter(text) {
        let description = captures["desc"].trim().to_string();
        if is_summary_line(&description) {
            continue;
        }
        let amount = parse_amount(&captures["amount"]);
        let quantity = QTY_RE.captures(&description).and_then(|qty| {
            qty.name("qty_a")
                .or_else(|| qty.name("qty_b"))
                .and_then(|m| m.as_str().parse::<i64>().ok())
                .map(rust_decimal::Decimal::from)
        });
        line_items.push(LineItem {
            description,
            quantity,
            unit_price: None,
            line_total: amount,
            confidence: TEXT_CONFIDENCE,
        });
    }

    if total.is_none() && line_items.is_empty() {
        return None;
    }

    Some(ParsedReceipt {
        vendor: vendor.map(String::from),
        date,
        total,
        subtotal,
        tax,
        line_items,
        confidence: ReceiptConfidence {
            vendor: if vendor.is_some() { TEXT_CONFIDENCE } else { 0 },
            date: if date.is_some() { TEXT_CONFIDENCE } else { 0 },
            total: if total.is_some() { TEXT_CONFIDENCE } else { 0 },
            subtotal: if subtotal.is_some() { TEXT_CONFIDENCE } else { 0 },
            tax: if tax.is_some() { TEXT_CONFIDENCE } else { 0 },
        },
        // The pipeline recomputes this against tolerances.
        total_match_type: TotalMatchType::Mismatch,
    })
}

/// Whether a text parse is complete enough to skip the vision tier:
/// a known vendor, a total, and at least one line item.
#[must_use]
pub fn parse_is_sufficient(receipt: &ParsedReceipt) -> bool {
    receipt.vendor.is_some() && receipt.total.is_some() && !receipt.line_items.is_empty()
}

fn is_summary_line(description: &str) -> bool {
    let lowered = description.to_lowercase();
    ["total", "subtotal", "sub-total", "tax", "change", "cash", "card", "visa", "balance"]
        .iter()
        .any(|kw| lowered.starts_with(kw))
}

fn first_amount(re: &Regex, text: &str) -> Option<Money> {
    re.captures(text)
        .and_then(|c| parse_amount(c.get(1)?.as_str()))
}

fn parse_amount(raw: &str) -> Option<Money> {
    Money::parse(&raw.replace(',', "")).ok()
}

fn first_date(text: &str) -> Option<NaiveDate> {
    let captures = DATE_RE.captures(text)?;
    if let (Some(y), Some(m), Some(d)) = (captures.get(1), captures.get(2), captures.get(3)) {
        return NaiveDate::from_ymd_opt(
            y.as_str().parse().ok()?,
            m.as_str().parse().ok()?,
            d.as_str().parse().ok()?,
        );
    }
    if let (Some(m), Some(d), Some(y)) = (captures.get(4), captures.get(5), captures.get(6)) {
        return NaiveDate::from_ymd_opt(
            y.as_str().parse().ok()?,
            m.as_str().parse().ok()?,
            d.as_str().parse().ok()?,
        );
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECEIPT: &str = "\
THE HOME DEPOT #4512
2026-03-10
2x4 stud 8ft x2      12.00
wood screws 1lb       4.50
SUBTOTAL             16.50
TAX                   1.32
TOTAL                17.82
";

    #[test]
    fn detects_known_vendor() {
        assert_eq!(detect_vendor(RECEIPT), Some("Home Depot"));
        assert_eq!(detect_vendor("corner store receipt"), None);
    }

    #[test]
    fn parses_totals_and_tax() {
        let receipt = parse_text(RECEIPT).unwrap();
        assert_eq!(receipt.total, Some(Money::parse("17.82").unwrap()));
        assert_eq!(receipt.subtotal, Some(Money::parse("16.50").unwrap()));
        assert_eq!(receipt.tax, Some(Money::parse("1.32").unwrap()));
        assert_eq!(receipt.date, NaiveDate::from_ymd_opt(2026, 3, 10));
    }

    #[test]
    fn parses_line_items_without_summary_rows() {
        let receipt = parse_text(RECEIPT).unwrap();
        assert_eq!(receipt.line_items.len(), 2);
        assert_eq!(receipt.line_items[0].description, "2x4 stud 8ft x2");
        assert_eq!(
            receipt.line_items[0].line_total,
            Some(Money::parse("12.00").unwrap())
        );
        assert_eq!(
            receipt.line_items[0].quantity,
            Some(rust_decimal::Decimal::from(2))
        );
        assert_eq!(receipt.line_items[1].description, "wood screws 1lb");
    }

    #[test]
    fn sufficient_parse_detected() {
        let receipt = parse_text(RECEIPT).unwrap();
        assert!(parse_is_sufficient(&receipt));
    }

    #[test]
    fn unknown_vendor_is_insufficient() {
        let text = "corner store\nwidget  5.00\nTOTAL  5.00\n";
        let receipt = parse_text(text).unwrap();
        assert!(!parse_is_sufficient(&receipt));
    }

    #[test]
    fn missing_total_is_insufficient() {
        let text = "THE HOME DEPOT\nwidget  5.00\n";
        let receipt = parse_text(text).unwrap();
        assert!(receipt.total.is_none());
        assert!(!parse_is_sufficient(&receipt));
    }

    #[test]
    fn empty_text_yields_none() {
        assert!(parse_text("").is_none());
        assert!(parse_text("no numbers here at all").is_none());
    }

    #[test]
    fn us_date_format() {
        let text = "LOWE'S\n03/10/2026\nlumber 9.99\nTOTAL 9.99\n";
        let receipt = parse_text(text).unwrap();
        assert_eq!(receipt.date, NaiveDate::from_ymd_opt(2026, 3, 10));
    }

    #[test]
    fn thousands_separators_are_handled() {
        let text = "FERGUSON\ncopper pipe bundle  1,048.05\nTOTAL  1,048.05\n";
        let receipt = parse_text(text).unwrap();
        assert_eq!(receipt.total, Some(Money::parse("1048.05").unwrap()));
    }
}
