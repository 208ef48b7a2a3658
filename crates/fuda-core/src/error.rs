use thiserror::Error;

/// Errors that can occur during Fuda core operations.
#[derive(Debug, Error)]
pub enum FudaError {
    /// A corpus file could not be read or parsed.
    #[error("corpus error: {0}")]
    Corpus(String),

    /// The requested label type is not annotated in the corpus.
    #[error("unknown label type {label_type:?}: no token in the corpus carries this layer")]
    UnknownLabelType {
        /// The label type that was requested.
        label_type: String,
    },

    /// An embedding configuration value is invalid for the loaded encoder.
    #[error("invalid embedding configuration: {0}")]
    InvalidConfig(String),

    /// The model directory is missing a required file.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Sub-word tokenization failed.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// A sentence exceeds the encoder's position limit even after trimming.
    #[error("sentence too long for encoder: {length} sub-tokens, limit {limit}")]
    SentenceTooLong {
        /// Sub-token count after trimming.
        length: usize,
        /// Maximum the encoder can address.
        limit: usize,
    },

    /// Candle ML framework error.
    #[error("ML error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Fuda operations.
pub type Result<T> = std::result::Result<T, FudaError>;
