//! Causal transformer decoder
//!
//! This module implements the decoder stack and the vocabulary projection
//! that together turn a token prefix and the encoder output into a
//! probability distribution over the next token.
//!
//! Two execution paths produce the same distribution:
//! - **Full recomputation**: embed the whole prefix, run every block with a
//!   `T x T` causal mask, read the last position.
//! - **Incremental**: keep each candidate's self-attention keys/values in a
//!   `SequenceKVCache` and only push the newest token through the stack.
//!   Cross-attention keys/values of the encoder output are projected once
//!   per request and shared.

use std::sync::Arc;

use tracing::trace;

use crate::attention::{CausalMask, MultiHeadAttention, Visibility};
use crate::beam::StepScorer;
use crate::config::ModelConfig;
use crate::embedding::PositionalEmbedding;
use crate::encoder::EncoderOutput;
use crate::kv_cache::{CrossAttentionCache, LayerKVCache, SequenceKVCache};
use crate::nn::{add_in_place, softmax_in_place, FeedForward, LayerNorm, Linear};
use crate::weights::{ParamSpec, Weights};
use crate::{ReportError, Result};

/// One post-norm decoder block
///
/// ```text
/// x = norm1(x + self_attn(x, causal))
/// x = norm2(x + cross_attn(q = x, kv = encoder))
/// x = norm3(x + ff(x))
/// ```
#[derive(Debug, Clone)]
pub struct DecoderBlock {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    ff: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
}

impl DecoderBlock {
    pub fn from_weights(weights: &Weights, prefix: &str, config: &ModelConfig) -> Result<Self> {
        let dim = config.embed_dim;
        let eps = config.layer_norm_eps;
        let attn = |name: &str| {
            MultiHeadAttention::from_weights(weights, &format!("{prefix}.{name}"), dim, config.n_heads)
        };
        let norm = |name: &str| LayerNorm::from_weights(weights, &format!("{prefix}.{name}"), dim, eps);

        Ok(Self {
            self_attn: attn("self_attn")?,
            cross_attn: attn("cross_attn")?,
            ff: FeedForward::from_weights(weights, &format!("{prefix}.ff"), dim, config.ff_dim)?,
            norm1: norm("norm1")?,
            norm2: norm("norm2")?,
            norm3: norm("norm3")?,
        })
    }

    pub fn param_specs(prefix: &str, config: &ModelConfig) -> Vec<ParamSpec> {
        let dim = config.embed_dim;
        let mut specs = MultiHeadAttention::param_specs(&format!("{prefix}.self_attn"), dim);
        specs.extend(MultiHeadAttention::param_specs(&format!("{prefix}.cross_attn"), dim));
        specs.extend(FeedForward::param_specs(&format!("{prefix}.ff"), dim, config.ff_dim));
        for norm in ["norm1", "norm2", "norm3"] {
            specs.extend(LayerNorm::param_specs(&format!("{prefix}.{norm}"), dim));
        }
        specs
    }

    /// Full-sequence forward pass under an explicit causal mask
    pub fn forward(
        &self,
        mut x: Vec<f32>,
        rows: usize,
        mask: &CausalMask,
        encoder_out: &EncoderOutput,
    ) -> Result<Vec<f32>> {
        let attn = self.self_attn.forward(&x, rows, &x, rows, Visibility::Masked(mask))?;
        add_in_place(&mut x, &attn);
        self.norm1.forward_in_place(&mut x);

        let cross = self.cross_attn.forward(
            &x,
            rows,
            encoder_out.as_slice(),
            encoder_out.n_features(),
            Visibility::Full,
        )?;
        self.finish(x, rows, &cross)
    }

    /// Forward pass for new positions only, reading and extending `self_kv`
    pub fn forward_cached(
        &self,
        mut x: Vec<f32>,
        rows: usize,
        self_kv: &mut LayerKVCache,
        cross_kv: &LayerKVCache,
    ) -> Result<Vec<f32>> {
        let attn = self.self_attn.forward_cached(&x, rows, self_kv)?;
        add_in_place(&mut x, &attn);
        self.norm1.forward_in_place(&mut x);

        let cross = self.cross_attn.forward_precomputed(&x, rows, cross_kv)?;
        self.finish(x, rows, &cross)
    }

    /// Cross-attention residual, then the feed-forward sub-layer
    fn finish(&self, mut x: Vec<f32>, rows: usize, cross: &[f32]) -> Result<Vec<f32>> {
        add_in_place(&mut x, cross);
        self.norm2.forward_in_place(&mut x);

        let ff = self.ff.forward(&x, rows)?;
        add_in_place(&mut x, &ff);
        self.norm3.forward_in_place(&mut x);
        Ok(x)
    }
}

/// Linear map from the last hidden state to a distribution over the vocabulary
#[derive(Debug, Clone)]
pub struct VocabProjection {
    proj: Linear,
}

impl VocabProjection {
    pub fn from_weights(weights: &Weights, config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            proj: Linear::from_weights(
                weights,
                "decoder.output_proj",
                config.embed_dim,
                config.vocab_size,
            )?,
        })
    }

    pub fn param_specs(config: &ModelConfig) -> Vec<ParamSpec> {
        Linear::param_specs("decoder.output_proj", config.embed_dim, config.vocab_size)
    }

    /// Softmax distribution for one hidden state
    ///
    /// # Errors
    ///
    /// Returns `Model` if the logits are not finite.
    pub fn probabilities(&self, hidden: &[f32]) -> Result<Vec<f32>> {
        let mut logits = self.proj.forward(hidden, 1)?;
        if logits.iter().any(|v| !v.is_finite()) {
            return Err(ReportError::Model("Non-finite logits".to_string()));
        }
        softmax_in_place(&mut logits);
        Ok(logits)
    }
}

/// Incremental decoding state of one candidate
#[derive(Debug, Clone)]
pub struct DecoderState {
    /// Encoder-side keys/values, shared by every candidate of a request
    pub cross: Arc<CrossAttentionCache>,

    /// Self-attention keys/values of the tokens this candidate has consumed
    pub self_kv: SequenceKVCache,
}

/// The decoder stack with embedding and vocabulary projection
///
/// # Example
///
/// ```
/// use report_decoder::{Decoder, EncoderOutput, ModelConfig, Weights};
///
/// let config = ModelConfig::tiny(7);
/// let weights = Weights::random(&config, 0).unwrap();
/// let decoder = Decoder::from_weights(&weights, &config).unwrap();
///
/// let encoder_out = EncoderOutput::new(vec![0.1; 4 * 16], 4, 16).unwrap();
/// let probs = decoder.next_token_probs(&[2, 5], &encoder_out).unwrap();
/// assert_eq!(probs.len(), 7);
/// ```
#[derive(Debug, Clone)]
pub struct Decoder {
    config: ModelConfig,
    embedding: PositionalEmbedding,
    blocks: Vec<DecoderBlock>,
    projection: VocabProjection,
}

impl Decoder {
    /// Build the decoder from named parameters
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or any parameter is
    /// missing or has the wrong shape.
    pub fn from_weights(weights: &Weights, config: &ModelConfig) -> Result<Self> {
        config.validate()?;

        let blocks = (0..config.n_layers)
            .map(|i| DecoderBlock::from_weights(weights, &format!("decoder.layers.{i}"), config))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config: config.clone(),
            embedding: PositionalEmbedding::from_weights(weights, config)?,
            blocks,
            projection: VocabProjection::from_weights(weights, config)?,
        })
    }

    pub fn param_specs(config: &ModelConfig) -> Vec<ParamSpec> {
        let mut specs = PositionalEmbedding::param_specs(config);
        for i in 0..config.n_layers {
            specs.extend(DecoderBlock::param_specs(&format!("decoder.layers.{i}"), config));
        }
        specs.extend(VocabProjection::param_specs(config));
        specs
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn check_encoder(&self, encoder_out: &EncoderOutput) -> Result<()> {
        if encoder_out.dim() != self.config.embed_dim {
            return Err(ReportError::ShapeMismatch {
                what: "encoder output".to_string(),
                expected: vec![encoder_out.n_features(), self.config.embed_dim],
                got: vec![encoder_out.n_features(), encoder_out.dim()],
            });
        }
        Ok(())
    }

    /// Hidden states `[T, embed_dim]` for the whole prefix
    pub fn forward(&self, tokens: &[u32], encoder_out: &EncoderOutput) -> Result<Vec<f32>> {
        let mask = CausalMask::new(tokens.len());
        self.forward_with_mask(tokens, encoder_out, &mask)
    }

    /// Like [`Decoder::forward`] with a caller-built mask
    ///
    /// # Errors
    ///
    /// Returns `InvalidMask` if the mask is not `T x T`.
    pub fn forward_with_mask(
        &self,
        tokens: &[u32],
        encoder_out: &EncoderOutput,
        mask: &CausalMask,
    ) -> Result<Vec<f32>> {
        self.check_encoder(encoder_out)?;
        let rows = tokens.len();
        mask.validate(rows, rows)?;

        let mut x = self.embedding.embed(tokens)?;
        for block in &self.blocks {
            x = block.forward(x, rows, mask, encoder_out)?;
        }
        Ok(x)
    }

    /// Next-token distribution by full recomputation of the prefix
    pub fn next_token_probs(&self, tokens: &[u32], encoder_out: &EncoderOutput) -> Result<Vec<f32>> {
        let hidden = self.forward(tokens, encoder_out)?;
        let dim = self.config.embed_dim;
        let last = &hidden[hidden.len() - dim..];
        self.projection.probabilities(last)
    }

    /// Project the encoder output into every block's cross-attention K/V
    pub fn precompute_cross(&self, encoder_out: &EncoderOutput) -> Result<CrossAttentionCache> {
        self.check_encoder(encoder_out)?;
        let layers = self
            .blocks
            .iter()
            .map(|block| {
                block
                    .cross_attn
                    .project_kv(encoder_out.as_slice(), encoder_out.n_features())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SequenceKVCache::from_layers(layers))
    }

    /// Fresh incremental state for one request
    pub fn new_state(&self, encoder_out: &EncoderOutput) -> Result<DecoderState> {
        Ok(DecoderState {
            cross: Arc::new(self.precompute_cross(encoder_out)?),
            self_kv: SequenceKVCache::new(self.blocks.len(), self.config.embed_dim),
        })
    }

    /// Push `new_ids` through the stack after the positions already cached
    ///
    /// # Returns
    ///
    /// The next-token distribution after the last of `new_ids`
    pub fn extend(&self, new_ids: &[u32], state: &mut DecoderState) -> Result<Vec<f32>> {
        if new_ids.is_empty() {
            return Err(ReportError::Model("No tokens to decode".to_string()));
        }

        let start = state.self_kv.current_length();
        let rows = new_ids.len();
        let mut x = self.embedding.embed_from(new_ids, start)?;
        for (i, block) in self.blocks.iter().enumerate() {
            let cross_kv = state.cross.layer(i)?;
            let self_kv = state.self_kv.layer_mut(i)?;
            x = block.forward_cached(x, rows, self_kv, cross_kv)?;
        }

        trace!(start, rows, "Decoded positions");
        let dim = self.config.embed_dim;
        self.projection.probabilities(&x[(rows - 1) * dim..])
    }

    /// Discard any cached positions and process the full prefix
    pub fn prefill(&self, tokens: &[u32], state: &mut DecoderState) -> Result<Vec<f32>> {
        state.self_kv.clear();
        self.extend(tokens, state)
    }

    /// Process a single new token on top of the cache
    pub fn decode_step(&self, token: u32, state: &mut DecoderState) -> Result<Vec<f32>> {
        self.extend(&[token], state)
    }
}

impl StepScorer for Decoder {
    type State = DecoderState;

    fn begin(&self, encoder_out: &EncoderOutput) -> Result<DecoderState> {
        self.new_state(encoder_out)
    }

    fn score(
        &self,
        tokens: &[u32],
        state: &mut DecoderState,
        _encoder_out: &EncoderOutput,
    ) -> Result<Vec<f32>> {
        let cached = state.self_kv.current_length();
        match tokens.last() {
            Some(&last) if cached > 0 && cached + 1 == tokens.len() => self.decode_step(last, state),
            _ => self.prefill(tokens, state),
        }
    }

    fn max_sequence_len(&self) -> Option<usize> {
        Some(self.config.max_len)
    }
}

/// Scores by full recomputation of every prefix, keeping no state
#[derive(Debug, Clone, Copy)]
pub struct Recompute<'a>(pub &'a Decoder);

impl StepScorer for Recompute<'_> {
    type State = ();

    fn begin(&self, _encoder_out: &EncoderOutput) -> Result<()> {
        Ok(())
    }

    fn score(&self, tokens: &[u32], _state: &mut (), encoder_out: &EncoderOutput) -> Result<Vec<f32>> {
        self.0.next_token_probs(tokens, encoder_out)
    }

    fn max_sequence_len(&self) -> Option<usize> {
        Some(self.0.config.max_len)
    }
}
