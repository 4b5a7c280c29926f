//! Model and generation configuration
//!
//! This module defines the architecture parameters of the encoder–decoder
//! model and the knobs of the beam search that drives it.

use serde::{Deserialize, Serialize};

use crate::{ReportError, Result};

/// Configuration for the encoder–decoder architecture
///
/// # Example
///
/// ```
/// use report_decoder::ModelConfig;
///
/// let config = ModelConfig::xray_default(47);
/// assert_eq!(config.embed_dim, 512);
/// assert_eq!(config.head_dim(), 64);
/// assert_eq!(config.n_features(), 49);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Size of the vocabulary (including the four reserved tokens)
    pub vocab_size: usize,

    /// Number of decoder blocks
    pub n_layers: usize,

    /// Model dimension shared by encoder output and decoder
    pub embed_dim: usize,

    /// Number of attention heads
    pub n_heads: usize,

    /// Hidden dimension of the position-wise feed-forward layer
    pub ff_dim: usize,

    /// Size of the learned position table (longest sequence the decoder accepts)
    pub max_len: usize,

    /// Side of the square patch grid produced by the feature encoder
    pub feature_grid: usize,

    /// Epsilon for layer normalization
    pub layer_norm_eps: f32,
}

impl ModelConfig {
    /// Create a new ModelConfig with validation
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid:
    /// - All dimensions must be positive
    /// - embed_dim must be divisible by n_heads
    /// - vocab_size must hold the four reserved tokens
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vocab_size: usize,
        n_layers: usize,
        embed_dim: usize,
        n_heads: usize,
        ff_dim: usize,
        max_len: usize,
        feature_grid: usize,
        layer_norm_eps: f32,
    ) -> Result<Self> {
        let config = Self {
            vocab_size,
            n_layers,
            embed_dim,
            n_heads,
            ff_dim,
            max_len,
            feature_grid,
            layer_norm_eps,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("n_layers", self.n_layers),
            ("embed_dim", self.embed_dim),
            ("n_heads", self.n_heads),
            ("ff_dim", self.ff_dim),
            ("max_len", self.max_len),
            ("feature_grid", self.feature_grid),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ReportError::InvalidConfig(format!(
                    "{} must be positive",
                    name
                )));
            }
        }

        // PAD, UNK, SOS, EOS
        if self.vocab_size < 4 {
            return Err(ReportError::InvalidConfig(format!(
                "vocab_size ({}) must include the 4 reserved tokens",
                self.vocab_size
            )));
        }

        if self.embed_dim % self.n_heads != 0 {
            return Err(ReportError::InvalidConfig(format!(
                "embed_dim ({}) must be divisible by n_heads ({})",
                self.embed_dim, self.n_heads
            )));
        }

        if self.layer_norm_eps.is_nan() || self.layer_norm_eps <= 0.0 {
            return Err(ReportError::InvalidConfig(
                "layer_norm_eps must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Dimension of each attention head
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.n_heads
    }

    /// Number of feature vectors in the encoder output
    pub fn n_features(&self) -> usize {
        self.feature_grid * self.feature_grid
    }

    /// Chest X-ray report model: 4 blocks, 8 heads, 512-dim, 7x7 feature grid
    pub fn xray_default(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            n_layers: 4,
            embed_dim: 512,
            n_heads: 8,
            ff_dim: 512,
            max_len: 102,
            feature_grid: 7,
            layer_norm_eps: 1e-5,
        }
    }

    /// Small configuration for tests and smoke runs
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            n_layers: 2,
            embed_dim: 16,
            n_heads: 2,
            ff_dim: 32,
            max_len: 16,
            feature_grid: 2,
            layer_norm_eps: 1e-5,
        }
    }
}

/// Beam search parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Number of candidates kept between steps (K)
    pub beam_width: usize,

    /// Hard cap on decoding steps; a finished sequence has at most
    /// `max_steps + 1` tokens including SOS
    pub max_steps: usize,

    /// Exponent applied to sequence length when normalizing scores (0 disables)
    pub length_penalty: f32,

    /// Reuse per-candidate key/value projections across steps
    pub use_kv_cache: bool,

    /// Score the candidates of one step on the rayon pool
    pub parallel: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            beam_width: 3,
            max_steps: 100,
            length_penalty: 0.7,
            use_kv_cache: true,
            parallel: true,
        }
    }
}

impl GenerationConfig {
    /// Validate the generation parameters on their own
    pub fn validate(&self) -> Result<()> {
        if self.beam_width == 0 {
            return Err(ReportError::InvalidConfig(
                "beam_width must be positive".to_string(),
            ));
        }
        if self.max_steps == 0 {
            return Err(ReportError::InvalidConfig(
                "max_steps must be positive".to_string(),
            ));
        }
        if !self.length_penalty.is_finite() || self.length_penalty < 0.0 {
            return Err(ReportError::InvalidConfig(format!(
                "length_penalty ({}) must be finite and non-negative",
                self.length_penalty
            )));
        }
        Ok(())
    }

    /// Validate that every sequence the search can grow fits the position table
    pub fn validate_for_max_len(&self, max_len: usize) -> Result<()> {
        self.validate()?;
        if self.max_steps + 1 > max_len {
            return Err(ReportError::InvalidConfig(format!(
                "max_steps ({}) + SOS exceeds the decoder's max_len ({})",
                self.max_steps, max_len
            )));
        }
        Ok(())
    }
}
