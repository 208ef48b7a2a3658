//! # Batching and Pre-Encoding
//!
//! Sub-token encoding of whole corpus splits (parallelized across worker
//! threads), document context windows, and seeded shuffling for the epoch
//! loop.

use anyhow::{Context, Result};
use fuda_core::corpus::Sentence;
use fuda_core::embeddings::{CONTEXT_WINDOW, EncodedSentence, TransformerWordEmbeddings};
use fuda_core::labels::LabelDictionary;
use tracing::warn;

/// A sentence ready for training: encoded sub-tokens, gold label indices,
/// and the raw gold tag strings for span-level evaluation.
#[derive(Debug, Clone)]
pub struct EncodedExample {
    pub encoded: EncodedSentence,
    pub tags: Vec<u32>,
    pub gold: Vec<String>,
}

/// Collect up to [`CONTEXT_WINDOW`] tokens of document context on each side
/// of `split[index]`, never crossing a document boundary.
fn context_window<'a>(split: &'a [Sentence], index: usize) -> (Vec<&'a str>, Vec<&'a str>) {
    let mut left: Vec<&str> = Vec::new();
    let mut i = index;
    while left.len() < CONTEXT_WINDOW && i > 0 && !split[i].document_start {
        i -= 1;
        // Prepend the neighbor, keeping document order.
        let words = split[i].words();
        for word in words.into_iter().rev() {
            left.insert(0, word);
        }
    }
    let overflow = left.len().saturating_sub(CONTEXT_WINDOW);
    left.drain(..overflow);

    let mut right: Vec<&str> = Vec::new();
    let mut j = index + 1;
    while right.len() < CONTEXT_WINDOW && j < split.len() && !split[j].document_start {
        right.extend(split[j].words());
        j += 1;
    }
    right.truncate(CONTEXT_WINDOW);

    (left, right)
}

/// Encode one sentence of a split, with its document context.
fn encode_one(
    embeddings: &TransformerWordEmbeddings,
    split: &[Sentence],
    index: usize,
    dict: &LabelDictionary,
    tag_type: &str,
) -> Result<EncodedExample> {
    let sentence = &split[index];
    let words = sentence.words();
    let (left, right) = context_window(split, index);

    let encoded = embeddings
        .encode(&words, &left, &right)
        .with_context(|| format!("encoding sentence {index}"))?;

    let gold: Vec<String> = sentence
        .tag_sequence(tag_type)
        .into_iter()
        .map(str::to_string)
        .collect();

    let tags: Vec<u32> = gold
        .iter()
        .map(|tag| match dict.index_of(tag) {
            Some(idx) => idx as u32,
            None => {
                // Labels outside the training vocabulary cannot be learned;
                // train them as "no entity".
                warn!(tag, "label not in dictionary, training as O");
                0
            }
        })
        .collect();

    Ok(EncodedExample {
        encoded,
        tags,
        gold,
    })
}

/// Pre-encode a whole split across `num_workers` threads.
///
/// Order is preserved: output index `i` is the encoding of `split[i]`.
pub fn encode_split(
    embeddings: &TransformerWordEmbeddings,
    split: &[Sentence],
    dict: &LabelDictionary,
    tag_type: &str,
    num_workers: usize,
) -> Result<Vec<EncodedExample>> {
    if split.is_empty() {
        return Ok(Vec::new());
    }

    let workers = num_workers.max(1).min(split.len());
    let chunk_size = split.len().div_ceil(workers);

    let chunks: Vec<Vec<EncodedExample>> = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for chunk_start in (0..split.len()).step_by(chunk_size) {
            let chunk_end = (chunk_start + chunk_size).min(split.len());
            handles.push(scope.spawn(move || {
                (chunk_start..chunk_end)
                    .map(|i| encode_one(embeddings, split, i, dict, tag_type))
                    .collect::<Result<Vec<_>>>()
            }));
        }
        handles
            .into_iter()
            .map(|h| h.join().expect("encoder worker panicked"))
            .collect::<Result<Vec<_>>>()
    })?;

    Ok(chunks.into_iter().flatten().collect())
}

/// Seeded in-place Fisher-Yates shuffle; identical seed, identical order.
pub fn shuffle<T>(items: &mut [T], seed: u64) {
    let mut rng = oorandom::Rand64::new(seed as u128);
    for i in (1..items.len()).rev() {
        let j = rng.rand_range(0..(i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sentence(words: &[&str], document_start: bool) -> Sentence {
        Sentence {
            tokens: words
                .iter()
                .map(|w| fuda_core::corpus::Token {
                    text: w.to_string(),
                    tags: HashMap::new(),
                })
                .collect(),
            document_start,
        }
    }

    #[test]
    fn context_stays_inside_document() {
        let split = vec![
            sentence(&["first"], true),
            sentence(&["second"], false),
            sentence(&["third"], true),
            sentence(&["fourth"], false),
        ];

        // Sentence 1 sees sentence 0 on the left, nothing on the right
        // (sentence 2 starts a new document).
        let (left, right) = context_window(&split, 1);
        assert_eq!(left, vec!["first"]);
        assert!(right.is_empty());

        // Sentence 2 starts a document: no left context.
        let (left, right) = context_window(&split, 2);
        assert!(left.is_empty());
        assert_eq!(right, vec!["fourth"]);
    }

    #[test]
    fn context_is_capped_at_the_window() {
        let long: Vec<String> = (0..50).map(|i| format!("w{i}")).collect();
        let long_refs: Vec<&str> = long.iter().map(String::as_str).collect();
        let split = vec![
            sentence(&long_refs, true),
            sentence(&long_refs, false),
            sentence(&["center"], false),
        ];

        let (left, _right) = context_window(&split, 2);
        assert_eq!(left.len(), CONTEXT_WINDOW);
        // The window keeps the nearest tokens.
        assert_eq!(*left.last().unwrap(), "w49");
    }

    #[test]
    fn shuffle_is_deterministic_per_seed() {
        let mut a: Vec<usize> = (0..100).collect();
        let mut b: Vec<usize> = (0..100).collect();
        shuffle(&mut a, 7);
        shuffle(&mut b, 7);
        assert_eq!(a, b);

        let mut c: Vec<usize> = (0..100).collect();
        shuffle(&mut c, 8);
        assert_ne!(a, c);
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut items: Vec<usize> = (0..64).collect();
        shuffle(&mut items, 3);
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..64).collect::<Vec<_>>());
    }
}
