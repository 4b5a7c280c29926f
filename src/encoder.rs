//! Visual feature encoder
//!
//! The decoder only needs a `[n_features, embed_dim]` matrix to attend to.
//! [`FeatureEncoder`] is that boundary; [`PatchEncoder`] is a small
//! self-contained implementation: adaptive average pooling into a square
//! patch grid, a linear projection of simple per-patch statistics, and one
//! post-norm transformer encoder block.

use tracing::debug;

use crate::attention::{MultiHeadAttention, Visibility};
use crate::config::ModelConfig;
use crate::nn::{add_in_place, FeedForward, LayerNorm, Linear};
use crate::preprocess::ImageTensor;
use crate::weights::{ParamSpec, Weights};
use crate::{ReportError, Result};

/// Per-patch inputs: mean and std of each RGB channel, then row and column
pub const PATCH_FEATURES: usize = 8;

/// Encoder output: `n_features x dim` row-major matrix
///
/// Produced once per request and only ever read afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderOutput {
    data: Vec<f32>,
    n_features: usize,
    dim: usize,
}

impl EncoderOutput {
    /// # Errors
    ///
    /// Returns `ShapeMismatch` unless `data.len() == n_features * dim` with
    /// both dimensions positive.
    pub fn new(data: Vec<f32>, n_features: usize, dim: usize) -> Result<Self> {
        if n_features == 0 || dim == 0 || data.len() != n_features * dim {
            return Err(ReportError::ShapeMismatch {
                what: "encoder output".to_string(),
                expected: vec![n_features, dim],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            data,
            n_features,
            dim,
        })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

/// Turns a preprocessed image into encoder features
pub trait FeatureEncoder: Send + Sync {
    fn encode(&self, image: &ImageTensor) -> Result<EncoderOutput>;

    /// Number of feature vectors every output has
    fn n_features(&self) -> usize;

    /// Width of every feature vector
    fn dim(&self) -> usize;
}

/// Unmasked self-attention + feed-forward, each followed by residual and LayerNorm
#[derive(Debug, Clone)]
pub struct EncoderBlock {
    self_attn: MultiHeadAttention,
    ff: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    dim: usize,
}

impl EncoderBlock {
    pub fn from_weights(weights: &Weights, prefix: &str, config: &ModelConfig) -> Result<Self> {
        let dim = config.embed_dim;
        let eps = config.layer_norm_eps;
        Ok(Self {
            self_attn: MultiHeadAttention::from_weights(
                weights,
                &format!("{prefix}.self_attn"),
                dim,
                config.n_heads,
            )?,
            ff: FeedForward::from_weights(weights, &format!("{prefix}.ff"), dim, config.ff_dim)?,
            norm1: LayerNorm::from_weights(weights, &format!("{prefix}.norm1"), dim, eps)?,
            norm2: LayerNorm::from_weights(weights, &format!("{prefix}.norm2"), dim, eps)?,
            dim,
        })
    }

    pub fn param_specs(prefix: &str, config: &ModelConfig) -> Vec<ParamSpec> {
        let dim = config.embed_dim;
        let mut specs = MultiHeadAttention::param_specs(&format!("{prefix}.self_attn"), dim);
        specs.extend(FeedForward::param_specs(&format!("{prefix}.ff"), dim, config.ff_dim));
        specs.extend(LayerNorm::param_specs(&format!("{prefix}.norm1"), dim));
        specs.extend(LayerNorm::param_specs(&format!("{prefix}.norm2"), dim));
        specs
    }

    pub fn forward(&self, mut x: Vec<f32>) -> Result<Vec<f32>> {
        let rows = x.len() / self.dim;

        let attn = self.self_attn.forward(&x, rows, &x, rows, Visibility::Full)?;
        add_in_place(&mut x, &attn);
        self.norm1.forward_in_place(&mut x);

        let ff = self.ff.forward(&x, rows)?;
        add_in_place(&mut x, &ff);
        self.norm2.forward_in_place(&mut x);

        Ok(x)
    }
}

/// Patch-statistics encoder
///
/// # Example
///
/// ```
/// use report_decoder::{FeatureEncoder, ImageTensor, ModelConfig, PatchEncoder, Weights};
///
/// let config = ModelConfig::tiny(7);
/// let weights = Weights::random(&config, 0).unwrap();
/// let encoder = PatchEncoder::from_weights(&weights, &config).unwrap();
///
/// let image = ImageTensor::new(vec![0.0; 3 * 8 * 8], 3, 8, 8).unwrap();
/// let features = encoder.encode(&image).unwrap();
/// assert_eq!(features.n_features(), 4);
/// assert_eq!(features.dim(), 16);
/// ```
#[derive(Debug, Clone)]
pub struct PatchEncoder {
    grid: usize,
    patch_proj: Linear,
    block: EncoderBlock,
    dim: usize,
}

impl PatchEncoder {
    pub fn from_weights(weights: &Weights, config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            grid: config.feature_grid,
            patch_proj: Linear::from_weights(
                weights,
                "encoder.patch_proj",
                PATCH_FEATURES,
                config.embed_dim,
            )?,
            block: EncoderBlock::from_weights(weights, "encoder.block", config)?,
            dim: config.embed_dim,
        })
    }

    pub fn param_specs(config: &ModelConfig) -> Vec<ParamSpec> {
        let mut specs = Linear::param_specs("encoder.patch_proj", PATCH_FEATURES, config.embed_dim);
        specs.extend(EncoderBlock::param_specs("encoder.block", config));
        specs
    }

    /// Pool the image into `grid x grid` cells and describe each cell
    ///
    /// Cell `i` along an axis of length `n` covers `floor(i*n/g)..ceil((i+1)*n/g)`,
    /// so every cell is non-empty even when the image is smaller than the grid.
    pub fn patch_features(&self, image: &ImageTensor) -> Result<Vec<f32>> {
        if image.channels() != 3 {
            return Err(ReportError::InvalidInput(format!(
                "Expected an RGB image, got {} channels",
                image.channels()
            )));
        }

        let g = self.grid;
        let (h, w) = (image.height(), image.width());
        let bounds = |i: usize, n: usize| (i * n / g, ((i + 1) * n).div_ceil(g));

        let mut features = Vec::with_capacity(g * g * PATCH_FEATURES);
        for gi in 0..g {
            let (y0, y1) = bounds(gi, h);
            for gj in 0..g {
                let (x0, x1) = bounds(gj, w);
                let count = ((y1 - y0) * (x1 - x0)) as f32;

                for c in 0..3 {
                    let plane = image.channel(c);
                    let cell = || (y0..y1).flat_map(move |y| plane[y * w + x0..y * w + x1].iter());
                    let mean = cell().sum::<f32>() / count;
                    let var = cell().map(|v| (v - mean) * (v - mean)).sum::<f32>() / count;
                    features.push(mean);
                    features.push(var.sqrt());
                }

                features.push((gi as f32 + 0.5) / g as f32);
                features.push((gj as f32 + 0.5) / g as f32);
            }
        }
        Ok(features)
    }
}

impl FeatureEncoder for PatchEncoder {
    fn encode(&self, image: &ImageTensor) -> Result<EncoderOutput> {
        let n = self.grid * self.grid;
        let patches = self.patch_features(image)?;
        let projected = self.patch_proj.forward(&patches, n)?;
        let encoded = self.block.forward(projected)?;

        if encoded.iter().any(|v| !v.is_finite()) {
            return Err(ReportError::Model(
                "Encoder produced non-finite features".to_string(),
            ));
        }

        debug!(n_features = n, dim = self.dim, "Encoded image");
        EncoderOutput::new(encoded, n, self.dim)
    }

    fn n_features(&self) -> usize {
        self.grid * self.grid
    }

    fn dim(&self) -> usize {
        self.dim
    }
}
