//! # Span-Level Evaluation
//!
//! Micro-averaged precision/recall/F1 over typed entity spans (exact
//! boundary and type match), plus token accuracy. This is the CoNLL
//! evaluation convention: a partially overlapping or mistyped prediction
//! counts as both a false positive and a false negative.

use anyhow::Result;
use fuda_core::labels::spans_from_bio;
use fuda_core::tagger::SequenceTagger;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::batch::EncodedExample;

/// Metrics of one evaluation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl EvaluationResult {
    fn zero() -> Self {
        Self {
            precision: 0.0,
            recall: 0.0,
            f1: 0.0,
            accuracy: 0.0,
            true_positives: 0,
            false_positives: 0,
            false_negatives: 0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    tp: usize,
    fp: usize,
    fn_: usize,
    correct_tokens: usize,
    total_tokens: usize,
}

impl Counts {
    fn update(&mut self, predicted: &[String], gold: &[String]) {
        let predicted_spans: HashSet<_> = spans_from_bio(predicted).into_iter().collect();
        let gold_spans: HashSet<_> = spans_from_bio(gold).into_iter().collect();

        self.tp += predicted_spans.intersection(&gold_spans).count();
        self.fp += predicted_spans.difference(&gold_spans).count();
        self.fn_ += gold_spans.difference(&predicted_spans).count();

        self.total_tokens += gold.len();
        self.correct_tokens += predicted
            .iter()
            .zip(gold)
            .filter(|(p, g)| p == g)
            .count();
    }

    fn finish(self) -> EvaluationResult {
        let ratio = |num: usize, den: usize| {
            if den == 0 { 0.0 } else { num as f64 / den as f64 }
        };
        let precision = ratio(self.tp, self.tp + self.fp);
        let recall = ratio(self.tp, self.tp + self.fn_);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };

        EvaluationResult {
            precision,
            recall,
            f1,
            accuracy: ratio(self.correct_tokens, self.total_tokens),
            true_positives: self.tp,
            false_positives: self.fp,
            false_negatives: self.fn_,
        }
    }
}

/// Predict over `examples` in mini-batches and score against the gold tags.
pub fn evaluate(
    tagger: &SequenceTagger,
    examples: &[EncodedExample],
    batch_size: usize,
) -> Result<EvaluationResult> {
    if examples.is_empty() {
        return Ok(EvaluationResult::zero());
    }

    let mut counts = Counts::default();
    for chunk in examples.chunks(batch_size.max(1)) {
        let batch: Vec<_> = chunk.iter().map(|e| &e.encoded).collect();
        let predictions = tagger.predict(&batch)?;
        for (predicted, example) in predictions.iter().zip(chunk) {
            counts.update(predicted, &example.gold);
        }
    }

    Ok(counts.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn perfect_prediction_scores_one() {
        let mut counts = Counts::default();
        let gold = tags(&["B-PER", "I-PER", "O", "B-LOC"]);
        counts.update(&gold, &gold);
        let result = counts.finish();
        assert_eq!(result.f1, 1.0);
        assert_eq!(result.precision, 1.0);
        assert_eq!(result.recall, 1.0);
        assert_eq!(result.accuracy, 1.0);
        assert_eq!(result.true_positives, 2);
    }

    #[test]
    fn boundary_error_counts_both_ways() {
        let mut counts = Counts::default();
        counts.update(
            &tags(&["B-PER", "O", "O"]),
            &tags(&["B-PER", "I-PER", "O"]),
        );
        let result = counts.finish();
        // The truncated span is a false positive and the gold span is
        // a false negative.
        assert_eq!(result.true_positives, 0);
        assert_eq!(result.false_positives, 1);
        assert_eq!(result.false_negatives, 1);
        assert_eq!(result.f1, 0.0);
    }

    #[test]
    fn type_error_counts_both_ways() {
        let mut counts = Counts::default();
        counts.update(&tags(&["B-LOC"]), &tags(&["B-PER"]));
        let result = counts.finish();
        assert_eq!(result.true_positives, 0);
        assert_eq!(result.false_positives, 1);
        assert_eq!(result.false_negatives, 1);
    }

    #[test]
    fn all_outside_gives_zero_not_nan() {
        let mut counts = Counts::default();
        counts.update(&tags(&["O", "O"]), &tags(&["O", "O"]));
        let result = counts.finish();
        assert_eq!(result.f1, 0.0);
        assert!(result.f1.is_finite());
        assert_eq!(result.accuracy, 1.0);
    }

    #[test]
    fn micro_averaging_across_sentences() {
        let mut counts = Counts::default();
        counts.update(&tags(&["B-PER"]), &tags(&["B-PER"]));
        counts.update(&tags(&["B-LOC"]), &tags(&["O"]));
        let result = counts.finish();
        assert_eq!(result.true_positives, 1);
        assert_eq!(result.false_positives, 1);
        assert_eq!(result.false_negatives, 0);
        assert!((result.precision - 0.5).abs() < 1e-9);
        assert_eq!(result.recall, 1.0);
    }
}
