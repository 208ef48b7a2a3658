//! # Viterbi Decoding
//!
//! Finds the most likely tag sequence given emission scores and transition
//! scores, with hard BIO constraints: transitions the labeling scheme
//! forbids are skipped regardless of their learned score.

use crate::error::{FudaError, Result};
use crate::labels::{self, LabelDictionary};

/// Viterbi decoder with a pre-computed BIO constraint mask.
#[derive(Debug, Clone)]
pub struct ViterbiDecoder {
    num_tags: usize,
    valid: Vec<Vec<bool>>,
}

impl ViterbiDecoder {
    /// Build a decoder for a label dictionary; the `[from][to]` constraint
    /// mask is derived from the BIO scheme of the labels.
    pub fn new(dict: &LabelDictionary) -> Self {
        Self {
            num_tags: dict.len(),
            valid: labels::transition_mask(dict),
        }
    }

    /// Decode the optimal tag sequence.
    ///
    /// `emissions` is `[seq_len][num_tags]`, `transitions` is
    /// `[num_tags][num_tags]` indexed `[from][to]`. An empty input decodes
    /// to an empty path.
    pub fn decode(
        &self,
        emissions: &[Vec<f32>],
        transitions: &[Vec<f32>],
    ) -> Result<Vec<usize>> {
        let seq_len = emissions.len();
        if seq_len == 0 {
            return Ok(Vec::new());
        }

        if emissions[0].len() != self.num_tags {
            return Err(FudaError::InvalidConfig(format!(
                "emission width {} does not match {} labels",
                emissions[0].len(),
                self.num_tags
            )));
        }

        let mut dp = vec![vec![f32::NEG_INFINITY; self.num_tags]; seq_len];
        let mut backptr = vec![vec![0usize; self.num_tags]; seq_len];

        dp[0][..self.num_tags].copy_from_slice(&emissions[0][..self.num_tags]);

        for pos in 1..seq_len {
            for curr in 0..self.num_tags {
                let mut best_score = f32::NEG_INFINITY;
                let mut best_prev = 0usize;

                for prev in 0..self.num_tags {
                    if !self.valid[prev][curr] {
                        continue;
                    }
                    let score =
                        dp[pos - 1][prev] + transitions[prev][curr] + emissions[pos][curr];
                    if score > best_score {
                        best_score = score;
                        best_prev = prev;
                    }
                }

                dp[pos][curr] = best_score;
                backptr[pos][curr] = best_prev;
            }
        }

        // Best final tag, then walk the backpointers.
        let mut curr = 0usize;
        let mut best_final = f32::NEG_INFINITY;
        for (tag, &score) in dp[seq_len - 1].iter().enumerate() {
            if score > best_final {
                best_final = score;
                curr = tag;
            }
        }

        let mut path = vec![curr];
        for pos in (1..seq_len).rev() {
            curr = backptr[pos][curr];
            path.push(curr);
        }
        path.reverse();
        Ok(path)
    }
}
