//! # Report Decoder
//!
//! This library turns an image into a short natural-language report using an
//! encoder–decoder transformer and beam search, implemented on plain `Vec<f32>`
//! buffers.
//!
//! ## Scope
//! - Causal-masked transformer decoder with cross-attention
//! - Beam search with length normalization and early termination
//! - Word-level tokenizer with reserved PAD/UNK/SOS/EOS ids
//! - Minimal patch encoder, weight loading and an HTTP front end
//! - No training, no pretrained CNN backbone
//!
//! ## Architecture
//! - `config`: Model and generation parameters with validation
//! - `tokenizer`: Vocabulary and text <-> id mapping
//! - `nn`: Linear, LayerNorm, feed-forward and softmax primitives
//! - `attention`: Causal mask and multi-head attention
//! - `kv_cache`: Per-candidate key/value storage for incremental decoding
//! - `embedding`: Token + learned position embedding
//! - `decoder`: Decoder stack and vocabulary projection
//! - `encoder`: Encoder output type and patch feature encoder
//! - `candidate`: Beam hypothesis state
//! - `beam`: Beam search controller
//! - `weights`: Named parameter store (safetensors or seeded random)
//! - `preprocess`: Image decoding and normalization
//! - `engine`: Immutable inference context shared by all requests
//! - `server`: Axum HTTP service

// Error handling
use thiserror::Error;

/// Error types for report generation
#[derive(Debug, Error)]
pub enum ReportError {
    /// Invalid configuration provided
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Attention mask does not match the (query, key) lengths it is applied to
    #[error("Invalid attention mask: expected {expected:?}, got {got:?}")]
    InvalidMask {
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// Tensor or buffer of the wrong shape
    #[error("Shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Sequence longer than the position table
    #[error("Sequence length {len} exceeds maximum of {max}")]
    SequenceTooLong { len: usize, max: usize },

    /// Token id outside the vocabulary
    #[error("Token id {id} out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { id: u32, vocab_size: usize },

    /// Missing or malformed model parameters
    #[error("Weight error: {0}")]
    Weights(String),

    /// Numeric failure during a forward pass
    #[error("Model error: {0}")]
    Model(String),

    /// Client supplied a missing or malformed payload
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Image bytes could not be decoded
    #[error("Image error: {0}")]
    Image(String),

    /// Caller cancelled the generation
    #[error("Generation cancelled")]
    Cancelled,

    /// Generation ran past its deadline
    #[error("Generation deadline exceeded")]
    DeadlineExceeded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReportError {
    /// Whether the error was caused by the request rather than the model
    pub fn is_client_error(&self) -> bool {
        matches!(self, ReportError::InvalidInput(_) | ReportError::Image(_))
    }
}

impl From<image::ImageError> for ReportError {
    fn from(err: image::ImageError) -> Self {
        ReportError::Image(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for ReportError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        ReportError::Weights(err.to_string())
    }
}

/// Result type alias for report generation
pub type Result<T> = std::result::Result<T, ReportError>;

// Module declarations
pub mod attention;
pub mod beam;
pub mod candidate;
pub mod config;
pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod engine;
pub mod kv_cache;
pub mod nn;
pub mod preprocess;
pub mod server;
pub mod tokenizer;
pub mod weights;

// Re-exports
pub use attention::{CausalMask, MultiHeadAttention};
pub use beam::{greedy_decode, BeamOutput, BeamSearch, BeamState, CancelToken, GenerationControl, StepScorer};
pub use candidate::{Candidate, CandidateStatus};
pub use config::{GenerationConfig, ModelConfig};
pub use decoder::{Decoder, DecoderState, Recompute};
pub use encoder::{EncoderOutput, FeatureEncoder, PatchEncoder};
pub use engine::{InferenceContext, Report};
pub use kv_cache::{LayerKVCache, SequenceKVCache};
pub use preprocess::{ImageTensor, PreprocessConfig};
pub use tokenizer::Tokenizer;
pub use weights::Weights;
