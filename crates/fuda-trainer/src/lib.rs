//! # Fuda Trainer
//!
//! Everything around the model: fetching benchmark corpora and pretrained
//! encoders into a local cache, pre-encoding splits across worker threads,
//! the AdamW fine-tuning loop with linear warmup/decay, and span-level
//! evaluation. The `train` binary wires these together into the standard
//! FLERT recipe.

pub mod batch;
pub mod eval;
pub mod fetch;
pub mod trainer;

pub use batch::EncodedExample;
pub use eval::EvaluationResult;
pub use fetch::Dataset;
pub use trainer::{FineTuneConfig, ModelTrainer};
