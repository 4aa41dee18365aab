// SPDX-License-Identifier: MIT OR Apache-2.0
//! Description normalization and content-addressed fingerprints.
//!
//! Fingerprints key the categorization cache and back duplicate detection.
//! Normalization must be stable: two descriptions that differ only in case,
//! internal whitespace, or edge punctuation produce the same fingerprint.

use sha2::{Digest, Sha256};

/// Normalize a free-text description: lowercase, collapse runs of
/// whitespace to single spaces, and strip leading/trailing punctuation.
#[must_use]
pub fn normalize_description(description: &str) -> String {
    let lowered = description.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c: char| c.is_ascii_punctuation())
        .trim()
        .to_string()
}

/// Fingerprint of a (description, stage) pair: the hex SHA-256 of the
/// normalized description joined with the lowercased stage token.
#[must_use]
pub fn fingerprint(description: &str, stage: &str) -> String {
    let normalized = normalize_description(description);
    let stage_token = stage.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(stage_token.as_bytes());
    hex_digest(hasher)
}

/// Fingerprint of a description alone, used by duplicate detection where
/// the construction stage is irrelevant.
#[must_use]
pub fn description_fingerprint(description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_description(description).as_bytes());
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalize_lowercases_and_collapses() {
        assert_eq!(normalize_description("  2x4   LUMBER  "), "2x4 lumber");
        assert_eq!(normalize_description("Wood\t\nScrews"), "wood screws");
    }

    #[test]
    fn normalize_strips_edge_punctuation() {
        assert_eq!(normalize_description("**drill bits!!"), "drill bits");
        assert_eq!(normalize_description("(paint)"), "paint");
    }

    #[test]
    fn normalize_keeps_interior_punctuation() {
        assert_eq!(normalize_description("1/2-inch pipe"), "1/2-inch pipe");
    }

    #[test]
    fn fingerprint_is_stable_across_formatting() {
        assert_eq!(
            fingerprint("2x4 Lumber", "Framing"),
            fingerprint("  2X4   LUMBER.", "framing")
        );
    }

    #[test]
    fn fingerprint_distinguishes_stage() {
        assert_ne!(
            fingerprint("2x4 lumber", "framing"),
            fingerprint("2x4 lumber", "roofing")
        );
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint("anything", "stage");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn description_fingerprint_ignores_stage_entirely() {
        assert_eq!(
            description_fingerprint("Wood Screws"),
            description_fingerprint("wood   screws!")
        );
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(s in ".{0,64}") {
            let once = normalize_description(&s);
            prop_assert_eq!(normalize_description(&once), once);
        }

        #[test]
        fn equal_normalization_iff_equal_fingerprint(a in ".{0,32}", b in ".{0,32}") {
            let same_norm = normalize_description(&a) == normalize_description(&b);
            let same_fp = fingerprint(&a, "s") == fingerprint(&b, "s");
            prop_assert_eq!(same_norm, same_fp);
        }
    }
}
