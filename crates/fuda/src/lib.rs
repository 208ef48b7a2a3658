//! # Fuda
//!
//! Sequence labeling with fine-tuned transformer word embeddings. This
//! crate re-exports the full public API: corpora and label dictionaries,
//! transformer embeddings with document context, the sequence tagger with
//! optional CRF decoding, and the fine-tuning trainer.
//!
//! For the individual pieces see [`fuda_core`] and [`fuda_trainer`].

pub use fuda_core::{
    ColumnFormat, Corpus, Crf, EncodedSentence, FudaError, LabelDictionary, OUTSIDE, Result,
    Sentence, SequenceTagger, SequenceTaggerConfig, Span, SubtokenPooling, Token,
    TransformerEmbeddingsConfig, TransformerWordEmbeddings, ViterbiDecoder, spans_from_bio,
};
pub use fuda_trainer::{Dataset, EncodedExample, EvaluationResult, FineTuneConfig, ModelTrainer};

/// Core building blocks: corpora, labels, embeddings, tagger.
pub use fuda_core as core;
/// Training: dataset fetching, batching, the fine-tuning loop, evaluation.
pub use fuda_trainer as trainer;
