//! # CoNLL Column-Format Reader
//!
//! Parses whitespace-separated column files (one token per line, blank line
//! between sentences) into [`Sentence`]s. `-DOCSTART-` lines mark document
//! boundaries and are not emitted as tokens.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::corpus::{Sentence, Token};
use crate::error::{FudaError, Result};

/// Maps column indices to annotation layer names.
///
/// Column 0 is always the token text; the map covers the remaining columns,
/// e.g. CoNLL-03 is `{1: "pos", 2: "chunk", 3: "ner"}`.
#[derive(Debug, Clone)]
pub struct ColumnFormat {
    layers: Vec<(usize, String)>,
    separator: Option<char>,
}

impl ColumnFormat {
    /// Create a format from `(column, layer)` pairs, splitting lines on
    /// arbitrary whitespace.
    pub fn new<I, S>(layers: I) -> Self
    where
        I: IntoIterator<Item = (usize, S)>,
        S: Into<String>,
    {
        Self {
            layers: layers
                .into_iter()
                .map(|(col, name)| (col, name.into()))
                .collect(),
            separator: None,
        }
    }

    /// Use a fixed separator instead of whitespace splitting (WNUT files are
    /// tab-separated and may contain spaces inside tokens).
    pub fn with_separator(mut self, sep: char) -> Self {
        self.separator = Some(sep);
        self
    }

    /// Layer names covered by this format.
    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(_, name)| name.as_str())
    }

    fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match self.separator {
            Some(sep) => line.split(sep).collect(),
            None => line.split_whitespace().collect(),
        }
    }
}

/// Read one split file into sentences.
pub fn read_file(path: &Path, format: &ColumnFormat) -> Result<Vec<Sentence>> {
    let file = File::open(path).map_err(|e| {
        FudaError::Corpus(format!("cannot open {}: {e}", path.display()))
    })?;
    let reader = BufReader::new(file);

    let mut sentences = Vec::new();
    let mut current: Vec<Token> = Vec::new();
    // The very first sentence of a file starts a document even without an
    // explicit marker.
    let mut next_starts_document = true;

    let mut flush = |current: &mut Vec<Token>, doc_start: &mut bool, out: &mut Vec<Sentence>| {
        if !current.is_empty() {
            out.push(Sentence {
                tokens: std::mem::take(current),
                document_start: *doc_start,
            });
            *doc_start = false;
        }
    };

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim_end();

        if trimmed.trim().is_empty() {
            flush(&mut current, &mut next_starts_document, &mut sentences);
            continue;
        }

        if trimmed.starts_with('#') {
            continue;
        }

        if trimmed.starts_with("-DOCSTART-") {
            flush(&mut current, &mut next_starts_document, &mut sentences);
            next_starts_document = true;
            continue;
        }

        let fields = format.split(trimmed);
        let text = fields.first().copied().unwrap_or_default();
        if text.is_empty() {
            continue;
        }

        let mut tags = HashMap::new();
        for (col, layer) in &format.layers {
            match fields.get(*col) {
                Some(value) if !value.is_empty() => {
                    tags.insert(layer.clone(), (*value).to_string());
                }
                _ => {
                    return Err(FudaError::Corpus(format!(
                        "{}:{}: missing column {col} for layer {layer:?}",
                        path.display(),
                        line_no + 1
                    )));
                }
            }
        }

        current.push(Token {
            text: text.to_string(),
            tags,
        });
    }

    flush(&mut current, &mut next_starts_document, &mut sentences);
    Ok(sentences)
}
