//! # Labeled Corpora
//!
//! A [`Corpus`] is an immutable collection of labeled token sequences
//! partitioned into train/dev/test splits. Label dictionaries are derived
//! from the train split only, in deterministic first-seen order.

pub mod conll;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FudaError, Result};
use crate::labels::{self, LabelDictionary, OUTSIDE};

pub use conll::{ColumnFormat, read_file};

/// A single token with one tag value per annotation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Surface form.
    pub text: String,
    /// Layer name ("ner", "pos", ...) to tag value ("B-PER", "NNP", ...).
    pub tags: HashMap<String, String>,
}

impl Token {
    /// Tag value for a layer, if annotated.
    pub fn tag(&self, layer: &str) -> Option<&str> {
        self.tags.get(layer).map(String::as_str)
    }
}

/// A sentence: an ordered token sequence plus its document position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentence {
    pub tokens: Vec<Token>,
    /// True for the first sentence of a document. Context windows never
    /// cross a document boundary.
    pub document_start: bool,
}

impl Sentence {
    /// Token surface forms in order.
    pub fn words(&self) -> Vec<&str> {
        self.tokens.iter().map(|t| t.text.as_str()).collect()
    }

    /// Tag sequence for a layer; `"O"` for unannotated tokens.
    pub fn tag_sequence(&self, layer: &str) -> Vec<&str> {
        self.tokens
            .iter()
            .map(|t| t.tag(layer).unwrap_or(OUTSIDE))
            .collect()
    }
}

/// A labeled dataset partitioned into train/dev/test splits.
#[derive(Debug, Clone)]
pub struct Corpus {
    pub name: String,
    pub train: Vec<Sentence>,
    pub dev: Vec<Sentence>,
    pub test: Vec<Sentence>,
}

impl Corpus {
    pub fn new(
        name: impl Into<String>,
        train: Vec<Sentence>,
        dev: Vec<Sentence>,
        test: Vec<Sentence>,
    ) -> Self {
        Self {
            name: name.into(),
            train,
            dev,
            test,
        }
    }

    /// Build the closed label vocabulary for one annotation layer.
    ///
    /// Scans the train split in order, so repeated runs over the same corpus
    /// yield an identical ordered label set. Index 0 is the reserved `"O"`
    /// label. Fails with [`FudaError::UnknownLabelType`] when no token
    /// carries the layer, rather than returning an empty dictionary.
    pub fn make_label_dictionary(&self, label_type: &str) -> Result<LabelDictionary> {
        let mut dict = LabelDictionary::new();
        let mut seen_layer = false;

        for sentence in &self.train {
            for token in &sentence.tokens {
                if let Some(tag) = token.tag(label_type) {
                    seen_layer = true;
                    dict.add(tag);
                }
            }
        }

        if !seen_layer {
            return Err(FudaError::UnknownLabelType {
                label_type: label_type.to_string(),
            });
        }

        Ok(dict)
    }

    /// Normalize a layer from IOB1 to IOB2 (BIO) in every split.
    ///
    /// CoNLL-03 native annotation is IOB1, where `I-X` opens a span unless
    /// the previous token already belongs to an `X` span; `B-X` appears only
    /// between adjacent same-type spans. Taggers here are trained on IOB2,
    /// where every span opens with `B-X`.
    pub fn normalize_to_iob2(&mut self, layer: &str) {
        for split in [&mut self.train, &mut self.dev, &mut self.test] {
            for sentence in split.iter_mut() {
                let mut prev_ty: Option<String> = None;
                for token in sentence.tokens.iter_mut() {
                    let Some(tag) = token.tags.get(layer).cloned() else {
                        prev_ty = None;
                        continue;
                    };
                    let (prefix, ty) = labels::split_tag(&tag);
                    let fixed = match prefix {
                        Some('I') if prev_ty.as_deref() != Some(ty) => {
                            format!("B-{ty}")
                        }
                        _ => tag.clone(),
                    };
                    prev_ty = if fixed == OUTSIDE {
                        None
                    } else {
                        Some(ty.to_string())
                    };
                    token.tags.insert(layer.to_string(), fixed);
                }
            }
        }
    }

    /// Total sentence count across all splits.
    pub fn len(&self) -> usize {
        self.train.len() + self.dev.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Corpus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Corpus {:?}: {} train + {} dev + {} test sentences",
            self.name,
            self.train.len(),
            self.dev.len(),
            self.test.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(text: &str, ner: &str) -> Token {
        let mut tags = HashMap::new();
        tags.insert("ner".to_string(), ner.to_string());
        Token {
            text: text.to_string(),
            tags,
        }
    }

    fn sentence(pairs: &[(&str, &str)]) -> Sentence {
        Sentence {
            tokens: pairs.iter().map(|(t, n)| token(t, n)).collect(),
            document_start: false,
        }
    }

    fn sample_corpus() -> Corpus {
        Corpus::new(
            "sample",
            vec![
                sentence(&[("EU", "B-ORG"), ("rejects", "O"), ("German", "B-MISC")]),
                sentence(&[("Peter", "B-PER"), ("Blackburn", "I-PER")]),
            ],
            vec![sentence(&[("BRUSSELS", "B-LOC")])],
            vec![sentence(&[("Japan", "B-LOC")])],
        )
    }

    #[test]
    fn label_dictionary_contains_outside_and_is_nonempty() {
        let dict = sample_corpus().make_label_dictionary("ner").unwrap();
        assert!(!dict.is_empty());
        assert_eq!(dict.index_of("O"), Some(0));
        assert_eq!(
            dict.labels(),
            &["O", "B-ORG", "B-MISC", "B-PER", "I-PER"]
        );
    }

    #[test]
    fn label_dictionary_is_deterministic() {
        let corpus = sample_corpus();
        let a = corpus.make_label_dictionary("ner").unwrap();
        let b = corpus.make_label_dictionary("ner").unwrap();
        assert_eq!(a.labels(), b.labels());
    }

    #[test]
    fn unknown_label_type_fails() {
        let err = sample_corpus().make_label_dictionary("frame").unwrap_err();
        assert!(matches!(err, FudaError::UnknownLabelType { .. }));
    }

    #[test]
    fn dev_only_labels_do_not_enter_dictionary() {
        // The dictionary is built from the train split alone.
        let dict = sample_corpus().make_label_dictionary("ner").unwrap();
        assert_eq!(dict.index_of("B-LOC"), None);
    }

    #[test]
    fn iob1_normalization() {
        let mut corpus = Corpus::new(
            "iob1",
            vec![sentence(&[
                ("EU", "I-ORG"),
                ("rejects", "O"),
                ("German", "I-MISC"),
                ("call", "O"),
            ])],
            vec![],
            vec![],
        );
        corpus.normalize_to_iob2("ner");
        let tags = corpus.train[0].tag_sequence("ner");
        assert_eq!(tags, vec!["B-ORG", "O", "B-MISC", "O"]);
    }

    #[test]
    fn iob2_input_unchanged_by_normalization() {
        let mut corpus = Corpus::new(
            "iob2",
            vec![sentence(&[("Peter", "B-PER"), ("Blackburn", "I-PER")])],
            vec![],
            vec![],
        );
        corpus.normalize_to_iob2("ner");
        let tags = corpus.train[0].tag_sequence("ner");
        assert_eq!(tags, vec!["B-PER", "I-PER"]);
    }

    #[test]
    fn adjacent_spans_keep_begin_marker() {
        let mut corpus = Corpus::new(
            "adj",
            vec![sentence(&[("A", "I-PER"), ("B", "B-PER"), ("C", "I-PER")])],
            vec![],
            vec![],
        );
        corpus.normalize_to_iob2("ner");
        let tags = corpus.train[0].tag_sequence("ner");
        assert_eq!(tags, vec!["B-PER", "B-PER", "I-PER"]);
    }

    #[test]
    fn display_summarizes_splits() {
        let text = sample_corpus().to_string();
        assert!(text.contains("2 train"));
        assert!(text.contains("1 dev"));
        assert!(text.contains("1 test"));
    }
}
