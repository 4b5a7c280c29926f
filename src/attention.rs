//! Causal mask and multi-head scaled dot-product attention
//!
//! One `MultiHeadAttention` type serves the decoder's masked self-attention,
//! its cross-attention over the encoder output, and the encoder's unmasked
//! self-attention. Which keys a query row may see is described by
//! [`Visibility`].

use crate::kv_cache::LayerKVCache;
use crate::nn::{dot, softmax_in_place, Linear};
use crate::weights::{ParamSpec, Weights};
use crate::{ReportError, Result};

/// Strictly upper-triangular boolean mask; `true` means "may not attend"
///
/// # Example
///
/// ```
/// use report_decoder::CausalMask;
///
/// let mask = CausalMask::new(3);
/// assert!(!mask.is_masked(1, 1));
/// assert!(mask.is_masked(0, 2));
/// assert_eq!(CausalMask::new(1).as_slice(), &[false]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalMask {
    size: usize,
    data: Vec<bool>,
}

impl CausalMask {
    /// Build the `size x size` mask: entry (i, j) is `true` iff `j > i`
    pub fn new(size: usize) -> Self {
        let mut data = Vec::with_capacity(size * size);
        for i in 0..size {
            for j in 0..size {
                data.push(j > i);
            }
        }
        Self { size, data }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether query `row` is blocked from key `col`
    ///
    /// # Panics
    ///
    /// Panics if `row` or `col` is not below `size()`.
    pub fn is_masked(&self, row: usize, col: usize) -> bool {
        self.data[row * self.size + col]
    }

    /// Row-major view of the mask
    pub fn as_slice(&self) -> &[bool] {
        &self.data
    }

    /// Check the mask against the (query, key) lengths it is about to gate
    ///
    /// # Errors
    ///
    /// Returns `InvalidMask` if either length differs from the mask size.
    pub fn validate(&self, q_len: usize, k_len: usize) -> Result<()> {
        if self.size != q_len || self.size != k_len {
            return Err(ReportError::InvalidMask {
                expected: (q_len, k_len),
                got: (self.size, self.size),
            });
        }
        Ok(())
    }
}

/// Which key positions each query row may attend to
#[derive(Debug, Clone, Copy)]
pub enum Visibility<'a> {
    /// Every key (cross-attention, encoder self-attention)
    Full,
    /// Keys allowed by an explicit causal mask over the whole sequence
    Masked(&'a CausalMask),
    /// Query row `i` is absolute position `offset + i` and sees keys `0..=offset + i`
    Offset(usize),
}

/// Multi-head attention with separate Q/K/V/output projections
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    /// Assemble from four `dim x dim` projections
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `n_heads` does not divide the model dimension,
    /// or `ShapeMismatch` if the projections are not all square of that size.
    pub fn new(
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
        out_proj: Linear,
        n_heads: usize,
    ) -> Result<Self> {
        let dim = q_proj.in_dim();
        if n_heads == 0 || dim % n_heads != 0 {
            return Err(ReportError::InvalidConfig(format!(
                "attention dim ({}) must be divisible by n_heads ({})",
                dim, n_heads
            )));
        }
        for (name, proj) in [
            ("q_proj", &q_proj),
            ("k_proj", &k_proj),
            ("v_proj", &v_proj),
            ("out_proj", &out_proj),
        ] {
            if proj.in_dim() != dim || proj.out_dim() != dim {
                return Err(ReportError::ShapeMismatch {
                    what: format!("attention {}", name),
                    expected: vec![dim, dim],
                    got: vec![proj.out_dim(), proj.in_dim()],
                });
            }
        }

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            n_heads,
            head_dim: dim / n_heads,
        })
    }

    pub fn from_weights(weights: &Weights, prefix: &str, dim: usize, n_heads: usize) -> Result<Self> {
        let proj = |name: &str| Linear::from_weights(weights, &format!("{prefix}.{name}"), dim, dim);
        Self::new(
            proj("q_proj")?,
            proj("k_proj")?,
            proj("v_proj")?,
            proj("out_proj")?,
            n_heads,
        )
    }

    pub fn param_specs(prefix: &str, dim: usize) -> Vec<ParamSpec> {
        ["q_proj", "k_proj", "v_proj", "out_proj"]
            .iter()
            .flat_map(|name| Linear::param_specs(&format!("{prefix}.{name}"), dim, dim))
            .collect()
    }

    pub fn dim(&self) -> usize {
        self.n_heads * self.head_dim
    }

    /// Project a key/value source once so it can be attended to repeatedly
    pub fn project_kv(&self, source: &[f32], rows: usize) -> Result<LayerKVCache> {
        let k = self.k_proj.forward(source, rows)?;
        let v = self.v_proj.forward(source, rows)?;
        LayerKVCache::from_rows(k, v, self.dim())
    }

    /// Full attention: queries from `x`, keys and values from `source`
    ///
    /// # Arguments
    ///
    /// * `x` - Query input `[q_rows, dim]`
    /// * `source` - Key/value input `[kv_rows, dim]` (`x` itself for self-attention)
    /// * `visibility` - Which keys each query may attend to
    ///
    /// # Returns
    ///
    /// Attention output `[q_rows, dim]` after the output projection
    pub fn forward(
        &self,
        x: &[f32],
        q_rows: usize,
        source: &[f32],
        kv_rows: usize,
        visibility: Visibility<'_>,
    ) -> Result<Vec<f32>> {
        let q = self.q_proj.forward(x, q_rows)?;
        let kv = self.project_kv(source, kv_rows)?;
        self.attend(&q, q_rows, &kv.k, &kv.v, kv_rows, visibility)
    }

    /// Self-attention over new rows, appending their K/V to `cache` first
    ///
    /// The new rows occupy positions `cache.seq_len()..cache.seq_len() + rows`
    /// and see every cached position plus the new ones up to themselves.
    pub fn forward_cached(&self, x: &[f32], rows: usize, cache: &mut LayerKVCache) -> Result<Vec<f32>> {
        let offset = cache.seq_len();
        let q = self.q_proj.forward(x, rows)?;
        let k = self.k_proj.forward(x, rows)?;
        let v = self.v_proj.forward(x, rows)?;
        cache.append(k, v)?;

        self.attend(&q, rows, &cache.k, &cache.v, cache.seq_len(), Visibility::Offset(offset))
    }

    /// Attention against K/V that were already projected (cross-attention)
    pub fn forward_precomputed(&self, x: &[f32], rows: usize, kv: &LayerKVCache) -> Result<Vec<f32>> {
        let q = self.q_proj.forward(x, rows)?;
        self.attend(&q, rows, &kv.k, &kv.v, kv.seq_len(), Visibility::Full)
    }

    /// Scaled dot-product attention over projected Q/K/V, then output projection
    fn attend(
        &self,
        q: &[f32],
        q_rows: usize,
        k: &[f32],
        v: &[f32],
        kv_rows: usize,
        visibility: Visibility<'_>,
    ) -> Result<Vec<f32>> {
        match visibility {
            Visibility::Full => {}
            Visibility::Masked(mask) => mask.validate(q_rows, kv_rows)?,
            Visibility::Offset(offset) => {
                if offset + q_rows != kv_rows {
                    return Err(ReportError::InvalidMask {
                        expected: (q_rows, kv_rows),
                        got: (q_rows, offset + q_rows),
                    });
                }
            }
        }

        let dim = self.dim();
        let hd = self.head_dim;
        let scale = 1.0 / (hd as f32).sqrt();
        let mut context = vec![0.0f32; q_rows * dim];
        let mut scores = vec![0.0f32; kv_rows];

        for h in 0..self.n_heads {
            let cols = h * hd..(h + 1) * hd;
            for i in 0..q_rows {
                let q_row = &q[i * dim..][cols.clone()];

                // 1. Scores, with hidden keys at -inf
                for (j, score) in scores.iter_mut().enumerate() {
                    let visible = match visibility {
                        Visibility::Full => true,
                        Visibility::Masked(mask) => !mask.is_masked(i, j),
                        Visibility::Offset(offset) => j <= offset + i,
                    };
                    *score = if visible {
                        dot(q_row, &k[j * dim..][cols.clone()]) * scale
                    } else {
                        f32::NEG_INFINITY
                    };
                }

                // 2. Attention weights
                softmax_in_place(&mut scores);

                // 3. Weighted sum of values
                let out = &mut context[i * dim..][cols.clone()];
                for (j, &w) in scores.iter().enumerate() {
                    if w == 0.0 {
                        continue;
                    }
                    for (o, val) in out.iter_mut().zip(&v[j * dim..][cols.clone()]) {
                        *o += w * val;
                    }
                }
            }
        }

        self.out_proj.forward(&context, q_rows)
    }
}
