//! # Fuda Core
//!
//! The heart of the Fuda sequence-labeling engine. Provides labeled corpora
//! with deterministic label dictionaries, transformer word embeddings with
//! sub-token pooling and document context, and a sequence tagger with
//! optional CRF decoding.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use candle_core::Device;
//! use candle_nn::VarMap;
//! use fuda_core::corpus::{ColumnFormat, Corpus, read_file};
//! use fuda_core::embeddings::{TransformerEmbeddingsConfig, TransformerWordEmbeddings};
//! use fuda_core::tagger::{SequenceTagger, SequenceTaggerConfig};
//!
//! let format = ColumnFormat::new([(1, "pos"), (2, "chunk"), (3, "ner")]);
//! let train = read_file(Path::new("eng.train"), &format).unwrap();
//! let corpus = Corpus::new("conll03", train, vec![], vec![]);
//! let label_dict = corpus.make_label_dictionary("ner").unwrap();
//!
//! let varmap = VarMap::new();
//! let embeddings = TransformerWordEmbeddings::load(
//!     Path::new("models/xlm-roberta-large"),
//!     TransformerEmbeddingsConfig::default(),
//!     Some(&varmap),
//!     &Device::Cpu,
//! ).unwrap();
//! let tagger = SequenceTagger::new(
//!     embeddings,
//!     label_dict,
//!     SequenceTaggerConfig::default(),
//!     &varmap,
//! ).unwrap();
//! ```
pub mod corpus;
pub mod embeddings;
pub mod error;
pub mod labels;
pub mod tagger;

// Re-export primary API
pub use corpus::{ColumnFormat, Corpus, Sentence, Token};
pub use embeddings::{
    EncodedSentence, SubtokenPooling, TransformerEmbeddingsConfig, TransformerWordEmbeddings,
};
pub use error::{FudaError, Result};
pub use labels::{LabelDictionary, OUTSIDE, Span, spans_from_bio};
pub use tagger::{Crf, SequenceTagger, SequenceTaggerConfig, ViterbiDecoder};
