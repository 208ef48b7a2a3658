//! # Label Dictionary and BIO Tag Utilities
//!
//! An ordered, deduplicated label vocabulary plus helpers for working with
//! BIO-scheme tag strings ("B-PER", "I-LOC", "O") and extracting typed spans
//! from predicted tag sequences.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The reserved "no entity" label.
pub const OUTSIDE: &str = "O";

/// An ordered, deduplicated mapping from label string to integer index.
///
/// Built once from the training split and frozen before training: there is
/// no removal API, and indices never shift once assigned. Index 0 is always
/// the reserved [`OUTSIDE`] label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct LabelDictionary {
    items: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelDictionary {
    /// Create a dictionary containing only the reserved [`OUTSIDE`] label.
    pub fn new() -> Self {
        let mut dict = Self {
            items: Vec::new(),
            index: HashMap::new(),
        };
        dict.add(OUTSIDE);
        dict
    }

    /// Insert a label, returning its index. Re-inserting an existing label
    /// returns the original index.
    pub fn add(&mut self, label: &str) -> usize {
        if let Some(&idx) = self.index.get(label) {
            return idx;
        }
        let idx = self.items.len();
        self.items.push(label.to_string());
        self.index.insert(label.to_string(), idx);
        idx
    }

    /// Look up the index of a label.
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    /// Look up the label at an index.
    pub fn label_of(&self, idx: usize) -> Option<&str> {
        self.items.get(idx).map(String::as_str)
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True only for a dictionary stripped of even the reserved label.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All labels in insertion order.
    pub fn labels(&self) -> &[String] {
        &self.items
    }
}

impl Default for LabelDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<String>> for LabelDictionary {
    fn from(items: Vec<String>) -> Self {
        let mut dict = Self {
            items: Vec::new(),
            index: HashMap::new(),
        };
        for item in items {
            dict.add(&item);
        }
        dict
    }
}

impl From<LabelDictionary> for Vec<String> {
    fn from(dict: LabelDictionary) -> Self {
        dict.items
    }
}

impl fmt::Display for LabelDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dictionary with {} labels: ", self.items.len())?;
        for (i, label) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{label}")?;
        }
        Ok(())
    }
}

/// Split a BIO tag into its scheme prefix and entity type.
///
/// `"B-PER"` becomes `(Some('B'), "PER")`, `"O"` becomes `(None, "O")`.
/// Tags without a recognized prefix are treated as bare entity types.
pub fn split_tag(tag: &str) -> (Option<char>, &str) {
    match tag.split_once('-') {
        Some((prefix, ty)) if prefix == "B" || prefix == "I" => {
            (prefix.chars().next(), ty)
        }
        _ => (None, tag),
    }
}

/// A typed entity span over token indices. `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub label: String,
    pub start: usize,
    pub end: usize,
}

/// Extract typed spans from a BIO tag sequence.
///
/// `B-X` opens a span; `I-X` continues a span of the same type, or opens a
/// new one when nothing compatible precedes it (tolerant of IOB1 input and
/// of small decoding inconsistencies).
pub fn spans_from_bio<S: AsRef<str>>(tags: &[S]) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut open: Option<(String, usize)> = None;

    for (i, tag) in tags.iter().enumerate() {
        let tag = tag.as_ref();
        let (prefix, ty) = split_tag(tag);

        let continues = matches!(
            (&open, prefix),
            (Some((open_ty, _)), Some('I')) if open_ty == ty
        );

        if continues {
            continue;
        }

        if let Some((label, start)) = open.take() {
            spans.push(Span {
                label,
                start,
                end: i,
            });
        }

        if tag != OUTSIDE {
            open = Some((ty.to_string(), i));
        }
    }

    if let Some((label, start)) = open {
        spans.push(Span {
            label,
            start,
            end: tags.len(),
        });
    }

    spans
}

/// Whether `from -> to` is a legal BIO transition.
///
/// `I-X` may only follow `B-X` or `I-X`; everything else is allowed.
pub fn is_valid_transition(from: &str, to: &str) -> bool {
    let (to_prefix, to_ty) = split_tag(to);
    if to_prefix != Some('I') {
        return true;
    }
    let (from_prefix, from_ty) = split_tag(from);
    matches!(from_prefix, Some('B') | Some('I')) && from_ty == to_ty
}

/// Build the `[from][to]` boolean constraint mask for a label dictionary.
pub fn transition_mask(dict: &LabelDictionary) -> Vec<Vec<bool>> {
    let n = dict.len();
    let mut mask = vec![vec![true; n]; n];
    for (i, from) in dict.labels().iter().enumerate() {
        for (j, to) in dict.labels().iter().enumerate() {
            mask[i][j] = is_valid_transition(from, to);
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_reserves_outside_at_zero() {
        let dict = LabelDictionary::new();
        assert_eq!(dict.index_of(OUTSIDE), Some(0));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn dictionary_deduplicates() {
        let mut dict = LabelDictionary::new();
        let a = dict.add("B-PER");
        let b = dict.add("B-PER");
        assert_eq!(a, b);
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn dictionary_preserves_insertion_order() {
        let mut dict = LabelDictionary::new();
        dict.add("B-PER");
        dict.add("I-PER");
        dict.add("B-LOC");
        assert_eq!(dict.labels(), &["O", "B-PER", "I-PER", "B-LOC"]);
        assert_eq!(dict.label_of(3), Some("B-LOC"));
    }

    #[test]
    fn dictionary_serde_roundtrip() {
        let mut dict = LabelDictionary::new();
        dict.add("B-ORG");
        dict.add("I-ORG");

        let json = serde_json::to_string(&dict).unwrap();
        assert_eq!(json, r#"["O","B-ORG","I-ORG"]"#);

        let back: LabelDictionary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.labels(), dict.labels());
        assert_eq!(back.index_of("I-ORG"), Some(2));
    }

    #[test]
    fn split_tag_variants() {
        assert_eq!(split_tag("B-PER"), (Some('B'), "PER"));
        assert_eq!(split_tag("I-MISC"), (Some('I'), "MISC"));
        assert_eq!(split_tag("O"), (None, "O"));
        assert_eq!(split_tag("X-FOO"), (None, "X-FOO"));
    }

    #[test]
    fn spans_basic() {
        let tags = ["B-PER", "I-PER", "O", "B-LOC"];
        let spans = spans_from_bio(&tags);
        assert_eq!(
            spans,
            vec![
                Span {
                    label: "PER".into(),
                    start: 0,
                    end: 2
                },
                Span {
                    label: "LOC".into(),
                    start: 3,
                    end: 4
                },
            ]
        );
    }

    #[test]
    fn spans_orphan_inside_opens_new_span() {
        // IOB1-style input: I-X after O still denotes an entity.
        let spans = spans_from_bio(&["O", "I-ORG", "I-ORG", "O"]);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].label, "ORG");
        assert_eq!((spans[0].start, spans[0].end), (1, 3));
    }

    #[test]
    fn spans_adjacent_entities_split_on_begin() {
        let spans = spans_from_bio(&["B-PER", "B-PER"]);
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn transition_rules() {
        assert!(is_valid_transition("B-PER", "I-PER"));
        assert!(is_valid_transition("I-PER", "I-PER"));
        assert!(is_valid_transition("O", "B-PER"));
        assert!(is_valid_transition("B-PER", "O"));
        assert!(!is_valid_transition("O", "I-PER"));
        assert!(!is_valid_transition("B-LOC", "I-PER"));
        assert!(!is_valid_transition("I-LOC", "I-PER"));
    }

    #[test]
    fn mask_matches_rules() {
        let mut dict = LabelDictionary::new();
        dict.add("B-PER");
        dict.add("I-PER");
        let mask = transition_mask(&dict);
        // O -> I-PER forbidden
        assert!(!mask[0][2]);
        // B-PER -> I-PER allowed
        assert!(mask[1][2]);
    }
}
