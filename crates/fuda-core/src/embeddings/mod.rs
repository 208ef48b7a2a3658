//! # Transformer Word Embeddings
//!
//! Per-word vector representations from a pretrained transformer encoder,
//! with configurable sub-token pooling, document-level context windows and
//! a fine-tuning toggle. One vector per corpus word comes back regardless
//! of how many word pieces the sub-word tokenizer produced.

pub mod encoder;

use std::path::Path;

use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::{FudaError, Result};

pub use encoder::{Encoder, EncoderSpec};

/// Tokens of document context carried on each side of a sentence when
/// `use_context` is enabled (the FLERT window).
pub const CONTEXT_WINDOW: usize = 64;

/// How sub-word piece vectors are pooled back into one vector per word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubtokenPooling {
    /// Use the first piece's vector (the common choice for NER).
    #[default]
    First,
    /// Average over all piece vectors.
    Mean,
}

/// Configuration for [`TransformerWordEmbeddings`]. A value object:
/// consumed once at construction, no independent lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerEmbeddingsConfig {
    /// HF model id or path to a local model directory.
    pub model: String,
    /// Encoder layer selection, e.g. `"-1"`, `"-1,-2"` or `"all"`.
    pub layers: String,
    /// Sub-token pooling mode.
    pub subtoken_pooling: SubtokenPooling,
    /// Whether encoder parameters receive gradient updates.
    pub fine_tune: bool,
    /// Whether to extend sentences with document context (FLERT).
    pub use_context: bool,
}

impl Default for TransformerEmbeddingsConfig {
    fn default() -> Self {
        Self {
            model: "xlm-roberta-large".to_string(),
            layers: "-1".to_string(),
            subtoken_pooling: SubtokenPooling::First,
            fine_tune: true,
            use_context: true,
        }
    }
}

/// A sentence encoded to sub-token ids, ready for the encoder.
///
/// `word_spans` locates each original word inside `ids` as
/// `(first_piece_index, piece_count)`; context and special tokens carry no
/// span and produce no word vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSentence {
    pub ids: Vec<u32>,
    pub word_spans: Vec<(usize, usize)>,
}

impl EncodedSentence {
    pub fn n_words(&self) -> usize {
        self.word_spans.len()
    }
}

/// Wraps a pretrained transformer to produce per-word vectors.
pub struct TransformerWordEmbeddings {
    encoder: Encoder,
    tokenizer: Option<Tokenizer>,
    config: TransformerEmbeddingsConfig,
    device: Device,
    bos_id: u32,
    eos_id: u32,
    unk_id: Option<u32>,
}

impl TransformerWordEmbeddings {
    /// Load encoder and tokenizer from a model directory holding
    /// `config.json`, `tokenizer.json` and `model.safetensors`.
    ///
    /// With `config.fine_tune` the encoder parameters are registered in
    /// `varmap` and become part of the training run; otherwise they are
    /// memory-mapped and frozen.
    pub fn load(
        dir: &Path,
        config: TransformerEmbeddingsConfig,
        varmap: Option<&VarMap>,
        device: &Device,
    ) -> Result<Self> {
        let encoder = Encoder::from_dir(dir, config.fine_tune, varmap, device)?;

        let selection =
            parse_layer_selection(&config.layers, encoder.spec().num_hidden_layers)?;
        ensure_materializable(&selection)?;

        let tokenizer_path = dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            FudaError::ModelLoad(format!(
                "cannot load tokenizer from {}: {e}",
                tokenizer_path.display()
            ))
        })?;

        let (bos_id, eos_id) = special_token_ids(&tokenizer)?;
        let unk_id = ["<unk>", "[UNK]"]
            .iter()
            .find_map(|t| tokenizer.token_to_id(t));

        Ok(Self {
            encoder,
            tokenizer: Some(tokenizer),
            config,
            device: device.clone(),
            bos_id,
            eos_id,
            unk_id,
        })
    }

    /// Width of the produced word vectors.
    pub fn embedding_dim(&self) -> usize {
        self.encoder.spec().hidden_size
    }

    pub fn config(&self) -> &TransformerEmbeddingsConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Encode one sentence (plus optional document context on each side,
    /// in document order) to sub-token ids.
    ///
    /// Context is only attached when `use_context` is set, and is trimmed
    /// first when the encoder's position budget is exceeded.
    pub fn encode(
        &self,
        words: &[&str],
        left_context: &[&str],
        right_context: &[&str],
    ) -> Result<EncodedSentence> {
        let center = self.word_pieces(words)?;
        let (left, right) = if self.config.use_context {
            (
                self.word_pieces(left_context)?,
                self.word_pieces(right_context)?,
            )
        } else {
            (Vec::new(), Vec::new())
        };

        // Room for the two special tokens.
        let budget = self.encoder.spec().usable_positions().saturating_sub(2);

        assemble(center, left, right, budget, self.bos_id, self.eos_id)
    }

    /// Run the encoder over a mini-batch and pool back to word vectors.
    ///
    /// Returns one `[n_words, dim]` tensor per sentence. The tensors carry
    /// the autograd graph, so a loss computed from them backpropagates into
    /// the encoder when fine-tuning is enabled.
    pub fn embed(&self, batch: &[&EncodedSentence]) -> Result<Vec<Tensor>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let pad_id = self.encoder.spec().pad_token_id;
        let max_len = batch.iter().map(|s| s.ids.len()).max().unwrap_or(0);

        let mut id_rows = Vec::with_capacity(batch.len());
        let mut mask_rows = Vec::with_capacity(batch.len());
        for sentence in batch {
            let mut ids = sentence.ids.clone();
            let mut mask = vec![1u32; ids.len()];
            ids.resize(max_len, pad_id);
            mask.resize(max_len, 0);
            id_rows.push(Tensor::new(ids, &self.device)?);
            mask_rows.push(Tensor::new(mask, &self.device)?);
        }

        let input_ids = Tensor::stack(&id_rows, 0)?;
        let attention_mask = Tensor::stack(&mask_rows, 0)?;

        // [batch, seq, hidden]
        let hidden = self.encoder.forward(&input_ids, &attention_mask)?;

        let mut out = Vec::with_capacity(batch.len());
        for (bi, sentence) in batch.iter().enumerate() {
            let mut word_vectors = Vec::with_capacity(sentence.n_words());
            for &(start, len) in &sentence.word_spans {
                let vector = match self.config.subtoken_pooling {
                    SubtokenPooling::First => hidden.i((bi, start))?,
                    SubtokenPooling::Mean => {
                        hidden.i(bi)?.narrow(0, start, len)?.mean(0)?
                    }
                };
                word_vectors.push(vector);
            }
            out.push(Tensor::stack(&word_vectors, 0)?);
        }

        Ok(out)
    }

    fn word_pieces(&self, words: &[&str]) -> Result<Vec<Vec<u32>>> {
        let tokenizer = self.tokenizer.as_ref().ok_or_else(|| {
            FudaError::Tokenizer("no tokenizer loaded for this embedding".into())
        })?;

        let mut pieces = Vec::with_capacity(words.len());
        for word in words {
            let encoding = tokenizer
                .encode(*word, false)
                .map_err(|e| FudaError::Tokenizer(e.to_string()))?;
            let mut ids = encoding.get_ids().to_vec();
            if ids.is_empty() {
                // Exotic whitespace or control characters can tokenize to
                // nothing; map them to UNK so word alignment survives.
                match self.unk_id {
                    Some(unk) => ids.push(unk),
                    None => {
                        return Err(FudaError::Tokenizer(format!(
                            "word {word:?} produced no pieces and the tokenizer has no UNK"
                        )));
                    }
                }
            }
            pieces.push(ids);
        }
        Ok(pieces)
    }

    /// Construct from an already-loaded encoder, without a tokenizer.
    /// Intended for in-process tests with tiny random configurations;
    /// `encode` is unavailable on the result, `embed` works as usual.
    #[doc(hidden)]
    pub fn from_parts(
        encoder: Encoder,
        config: TransformerEmbeddingsConfig,
        device: &Device,
    ) -> Self {
        let pad = encoder.spec().pad_token_id;
        Self {
            encoder,
            tokenizer: None,
            config,
            device: device.clone(),
            bos_id: pad,
            eos_id: pad,
            unk_id: None,
        }
    }
}

/// Probe the tokenizer vocabulary for its sequence delimiter pair.
fn special_token_ids(tokenizer: &Tokenizer) -> Result<(u32, u32)> {
    for (bos, eos) in [("<s>", "</s>"), ("[CLS]", "[SEP]"), ("<cls>", "<sep>")] {
        if let (Some(b), Some(e)) = (tokenizer.token_to_id(bos), tokenizer.token_to_id(eos)) {
            return Ok((b, e));
        }
    }
    Err(FudaError::Tokenizer(
        "tokenizer vocabulary has no recognized sequence delimiter pair".into(),
    ))
}

/// Parse and validate an encoder layer selection string against the
/// encoder depth. `"-1"` is the final layer.
pub fn parse_layer_selection(layers: &str, depth: usize) -> Result<Vec<i32>> {
    if layers.trim().eq_ignore_ascii_case("all") {
        return Ok((1..=depth as i32).collect());
    }

    let mut selection = Vec::new();
    for part in layers.split(',') {
        let layer: i32 = part.trim().parse().map_err(|_| {
            FudaError::InvalidConfig(format!("invalid layer selection {layers:?}"))
        })?;
        if layer == 0 || layer.unsigned_abs() as usize > depth {
            return Err(FudaError::InvalidConfig(format!(
                "layer {layer} does not address a valid encoder layer (depth {depth})"
            )));
        }
        selection.push(layer);
    }

    if selection.is_empty() {
        return Err(FudaError::InvalidConfig(format!(
            "empty layer selection {layers:?}"
        )));
    }

    Ok(selection)
}

/// The candle encoder graphs expose the final hidden state only; reject
/// selections they cannot materialize instead of silently ignoring them.
fn ensure_materializable(selection: &[i32]) -> Result<()> {
    if selection == [-1] {
        Ok(())
    } else {
        Err(FudaError::InvalidConfig(format!(
            "layer selection {selection:?} is not materializable; only the final hidden layer (\"-1\") is exposed by this encoder"
        )))
    }
}

/// Fit center and context pieces into the position budget and lay out the
/// final id sequence: `[bos] left center right [eos]`.
///
/// Context is dropped from the far ends first. An over-long sentence falls
/// back to one piece per word before failing.
fn assemble(
    mut center: Vec<Vec<u32>>,
    left: Vec<Vec<u32>>,
    right: Vec<Vec<u32>>,
    budget: usize,
    bos: u32,
    eos: u32,
) -> Result<EncodedSentence> {
    let mut center_total: usize = center.iter().map(Vec::len).sum();
    if center_total > budget {
        for pieces in center.iter_mut() {
            pieces.truncate(1);
        }
        center_total = center.len();
        if center_total > budget {
            return Err(FudaError::SentenceTooLong {
                length: center_total,
                limit: budget,
            });
        }
    }

    let mut remaining = budget - center_total;

    // Nearest context words first: left from the end, right from the start.
    // Each side stops at the first word that does not fit, so the kept
    // context is always contiguous with the sentence.
    let mut left_kept: Vec<&Vec<u32>> = Vec::new();
    let mut right_kept: Vec<&Vec<u32>> = Vec::new();
    let mut left_iter = left.iter().rev();
    let mut right_iter = right.iter();
    let mut left_open = true;
    let mut right_open = true;
    while left_open || right_open {
        if left_open {
            match left_iter.next() {
                Some(pieces) if pieces.len() <= remaining => {
                    remaining -= pieces.len();
                    left_kept.push(pieces);
                }
                _ => left_open = false,
            }
        }
        if right_open {
            match right_iter.next() {
                Some(pieces) if pieces.len() <= remaining => {
                    remaining -= pieces.len();
                    right_kept.push(pieces);
                }
                _ => right_open = false,
            }
        }
    }
    left_kept.reverse();

    let mut ids = vec![bos];
    for pieces in left_kept {
        ids.extend_from_slice(pieces);
    }

    let mut word_spans = Vec::with_capacity(center.len());
    for pieces in &center {
        word_spans.push((ids.len(), pieces.len()));
        ids.extend_from_slice(pieces);
    }

    for pieces in right_kept {
        ids.extend_from_slice(pieces);
    }
    ids.push(eos);

    Ok(EncodedSentence { ids, word_spans })
}
