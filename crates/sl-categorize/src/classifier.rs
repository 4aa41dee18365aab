// SPDX-License-Identifier: MIT OR Apache-2.0
//! The ML classifier tier.
//!
//! A centroid model over word n-grams of the normalized description plus a
//! stage token, trained only on human-verified assignments. Confidence is
//! the class margin — the gap between the best and second-best cosine
//! score — never the raw distance.

use chrono::{DateTime, Duration, Utc};
use sl_core::{AccountId, normalize_description};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// One training row: a verified (description, stage) → account assignment.
#[derive(Debug, Clone)]
pub struct TrainingExample {
    /// Free-text description.
    pub description: String,
    /// Construction stage token.
    pub stage: String,
    /// The verified account.
    pub account: AccountId,
}

#[derive(Debug, Default)]
struct Model {
    /// Per-account L2-normalized feature centroid.
    centroids: HashMap<AccountId, HashMap<String, f64>>,
    trained_at: Option<DateTime<Utc>>,
}

/// The classifier. Share behind an `Arc`.
#[derive(Debug, Default)]
pub struct Classifier {
    model: Mutex<Model>,
    version: AtomicU64,
}

impl Classifier {
    /// Create an untrained classifier (version 0, all predictions at
    /// confidence 0).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Train from scratch on the given examples and bump the version.
    pub fn train(&self, examples: &[TrainingExample]) {
        let mut sums: HashMap<AccountId, HashMap<String, f64>> = HashMap::new();
        for example in examples {
            let features = features(&example.description, &example.stage);
            if features.is_empty() {
                continue;
            }
            let entry = sums.entry(example.account).or_default();
            for (feature, weight) in features {
                *entry.entry(feature).or_insert(0.0) += weight;
            }
        }
        let centroids = sums
            .into_iter()
            .filter_map(|(account, vector)| {
                let normalized = l2_normalize(vector)?;
                Some((account, normalized))
            })
            .collect();

        let mut model = self.model.lock().expect("classifier lock poisoned");
        model.centroids = centroids;
        model.trained_at = Some(Utc::now());
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Predict an account for a description in a stage.
    ///
    /// Returns `(None, 0)` when untrained, when the description maps to an
    /// empty feature vector, or when no centroid overlaps it.
    #[must_use]
    pub fn predict(&self, description: &str, stage: &str) -> (Option<AccountId>, u8) {
        let query = match l2_normalize(features(description, stage)) {
            Some(q) => q,
            None => return (None, 0),
        };
        let model = self.model.lock().expect("classifier lock poisoned");
        if model.centroids.is_empty() {
            return (None, 0);
        }

        let mut best: Option<(AccountId, f64)> = None;
        let mut second = 0.0f64;
        for (account, centroid) in &model.centroids {
            let score = cosine(&query, centroid);
            match best {
                Some((_, best_score)) if score > best_score => {
                    second = best_score;
                    best = Some((*account, score));
                }
                Some(_) => {
                    if score > second {
                        second = score;
                    }
                }
                None => best = Some((*account, score)),
            }
        }

        match best {
            Some((account, score)) if score > 0.0 => {
                let margin = (score - second).clamp(0.0, 1.0);
                (Some(account), (margin * 100.0).round() as u8)
            }
            _ => (None, 0),
        }
    }

    /// Monotonic model version; increments on every retrain.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Whether the retrain cadence has elapsed since the last training run.
    #[must_use]
    pub fn needs_retrain(&self, interval_hours: u64) -> bool {
        let model = self.model.lock().expect("classifier lock poisoned");
        match model.trained_at {
            None => true,
            Some(at) => Utc::now() - at >= Duration::hours(interval_hours as i64),
        }
    }
}

/// Unigrams and bigrams over the normalized description, plus the stage
/// token as its own feature.
fn features(description: &str, stage: &str) -> HashMap<String, f64> {
    let normalized = normalize_description(description);
    let words: Vec<&str> = normalized.split(' ').filter(|w| !w.is_empty()).collect();
    let mut features: HashMap<String, f64> = HashMap::new();
    for word in &words {
        *features.entry((*word).to_string()).or_insert(0.0) += 1.0;
    }
    for pair in words.windows(2) {
        *features
            .entry(format!("{} {}", pair[0], pair[1]))
            .or_insert(0.0) += 1.0;
    }
    let stage_token = stage.trim().to_lowercase();
    if !stage_token.is_empty() {
        *features.entry(format!("stage:{stage_token}")).or_insert(0.0) += 1.0;
    }
    features
}

fn l2_normalize(vector: HashMap<String, f64>) -> Option<HashMap<String, f64>> {
    let norm = vector.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm == 0.0 || vector.is_empty() {
        return None;
    }
    Some(vector.into_iter().map(|(k, v)| (k, v / norm)).collect())
}

fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    // Both sides are L2-normalized, so the dot product is the cosine.
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(k, v)| large.get(k).map(|w| v * w))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(description: &str, stage: &str, account: AccountId) -> TrainingExample {
        TrainingExample {
            description: description.to_string(),
            stage: stage.to_string(),
            account,
        }
    }

    #[test]
    fn untrained_returns_zero() {
        let classifier = Classifier::new();
        assert_eq!(classifier.predict("2x4 lumber", "framing"), (None, 0));
        assert_eq!(classifier.version(), 0);
    }

    #[test]
    fn empty_description_returns_zero() {
        let classifier = Classifier::new();
        classifier.train(&[example("2x4 lumber", "framing", AccountId::new())]);
        assert_eq!(classifier.predict("   ", ""), (None, 0));
    }

    #[test]
    fn exact_match_single_class_is_high_confidence() {
        let classifier = Classifier::new();
        let lumber = AccountId::new();
        classifier.train(&[example("2x4 lumber", "framing", lumber)]);
        let (account, confidence) = classifier.predict("2x4 lumber", "framing");
        assert_eq!(account, Some(lumber));
        assert!(confidence >= 99, "confidence was {confidence}");
    }

    #[test]
    fn related_descriptions_share_a_class() {
        let classifier = Classifier::new();
        let lumber = AccountId::new();
        classifier.train(&[
            example("2x4 lumber", "framing", lumber),
            example("2x6 lumber", "framing", lumber),
        ]);
        let (account, confidence) = classifier.predict("2x4 lumber", "framing");
        assert_eq!(account, Some(lumber));
        assert!(confidence >= 70, "confidence was {confidence}");
    }

    #[test]
    fn confidence_comes_from_margin_not_score() {
        let classifier = Classifier::new();
        let a = AccountId::new();
        let b = AccountId::new();
        // Two classes sharing most features: the margin collapses even
        // though the raw score stays high.
        classifier.train(&[
            example("galvanized deck screws box", "framing", a),
            example("galvanized deck screws bulk", "framing", b),
        ]);
        let (_, confidence) = classifier.predict("galvanized deck screws box", "framing");
        assert!(confidence < 50, "confidence was {confidence}");
    }

    #[test]
    fn disjoint_query_returns_zero() {
        let classifier = Classifier::new();
        classifier.train(&[example("2x4 lumber", "framing", AccountId::new())]);
        assert_eq!(classifier.predict("office coffee", "framing").1, 0);
    }

    #[test]
    fn stage_token_separates_classes() {
        let classifier = Classifier::new();
        let framing = AccountId::new();
        let roofing = AccountId::new();
        classifier.train(&[
            example("nails", "framing", framing),
            example("nails", "roofing", roofing),
        ]);
        let (account, _) = classifier.predict("nails", "framing");
        assert_eq!(account, Some(framing));
        let (account, _) = classifier.predict("nails", "roofing");
        assert_eq!(account, Some(roofing));
    }

    #[test]
    fn retrain_bumps_version() {
        let classifier = Classifier::new();
        classifier.train(&[example("paint", "finish", AccountId::new())]);
        assert_eq!(classifier.version(), 1);
        classifier.train(&[example("paint", "finish", AccountId::new())]);
        assert_eq!(classifier.version(), 2);
    }

    #[test]
    fn retrain_cadence() {
        let classifier = Classifier::new();
        assert!(classifier.needs_retrain(6));
        classifier.train(&[example("paint", "finish", AccountId::new())]);
        assert!(!classifier.needs_retrain(6));
    }

    #[test]
    fn empty_training_set_stays_untrained_behavior() {
        let classifier = Classifier::new();
        classifier.train(&[]);
        assert_eq!(classifier.predict("2x4 lumber", "framing"), (None, 0));
    }
}
