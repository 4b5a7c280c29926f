//! Dense layers over row-major `f32` buffers
//!
//! Every activation is a flattened `[rows, dim]` matrix. Weights use the
//! `[out_dim, in_dim]` layout, so `y = x W^T + b`.

use crate::weights::{ParamSpec, Weights};
use crate::{ReportError, Result};

/// Fully connected layer
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight matrix: [out_dim, in_dim]
    weight: Vec<f32>,
    /// Bias vector: [out_dim]
    bias: Vec<f32>,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    pub fn new(weight: Vec<f32>, bias: Vec<f32>, in_dim: usize, out_dim: usize) -> Result<Self> {
        if weight.len() != in_dim * out_dim {
            return Err(ReportError::ShapeMismatch {
                what: "linear weight".to_string(),
                expected: vec![out_dim, in_dim],
                got: vec![weight.len()],
            });
        }
        if bias.len() != out_dim {
            return Err(ReportError::ShapeMismatch {
                what: "linear bias".to_string(),
                expected: vec![out_dim],
                got: vec![bias.len()],
            });
        }
        Ok(Self {
            weight,
            bias,
            in_dim,
            out_dim,
        })
    }

    /// Load `{prefix}.weight` and `{prefix}.bias`
    pub fn from_weights(weights: &Weights, prefix: &str, in_dim: usize, out_dim: usize) -> Result<Self> {
        let weight = weights.get(&format!("{prefix}.weight"), &[out_dim, in_dim])?;
        let bias = weights.get(&format!("{prefix}.bias"), &[out_dim])?;
        Self::new(weight.to_vec(), bias.to_vec(), in_dim, out_dim)
    }

    pub fn param_specs(prefix: &str, in_dim: usize, out_dim: usize) -> Vec<ParamSpec> {
        let bound = 1.0 / (in_dim as f32).sqrt();
        vec![
            ParamSpec::uniform(format!("{prefix}.weight"), vec![out_dim, in_dim], bound),
            ParamSpec::uniform(format!("{prefix}.bias"), vec![out_dim], bound),
        ]
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Apply to `rows` input rows: `[rows, in_dim] -> [rows, out_dim]`
    pub fn forward(&self, x: &[f32], rows: usize) -> Result<Vec<f32>> {
        if x.len() != rows * self.in_dim {
            return Err(ReportError::ShapeMismatch {
                what: "linear input".to_string(),
                expected: vec![rows, self.in_dim],
                got: vec![x.len()],
            });
        }

        let mut out = Vec::with_capacity(rows * self.out_dim);
        for row in x.chunks_exact(self.in_dim) {
            for (w_row, b) in self.weight.chunks_exact(self.in_dim).zip(&self.bias) {
                out.push(dot(row, w_row) + b);
            }
        }
        Ok(out)
    }
}

/// Layer normalization over the last dimension
#[derive(Debug, Clone)]
pub struct LayerNorm {
    gamma: Vec<f32>,
    beta: Vec<f32>,
    eps: f32,
}

impl LayerNorm {
    pub fn new(gamma: Vec<f32>, beta: Vec<f32>, eps: f32) -> Result<Self> {
        if gamma.len() != beta.len() {
            return Err(ReportError::ShapeMismatch {
                what: "layer norm bias".to_string(),
                expected: vec![gamma.len()],
                got: vec![beta.len()],
            });
        }
        Ok(Self { gamma, beta, eps })
    }

    pub fn from_weights(weights: &Weights, prefix: &str, dim: usize, eps: f32) -> Result<Self> {
        let gamma = weights.get(&format!("{prefix}.weight"), &[dim])?;
        let beta = weights.get(&format!("{prefix}.bias"), &[dim])?;
        Self::new(gamma.to_vec(), beta.to_vec(), eps)
    }

    pub fn param_specs(prefix: &str, dim: usize) -> Vec<ParamSpec> {
        vec![
            ParamSpec::ones(format!("{prefix}.weight"), vec![dim]),
            ParamSpec::zeros(format!("{prefix}.bias"), vec![dim]),
        ]
    }

    /// Normalize every row of `x` in place
    ///
    /// LayerNorm: (x - mean) / sqrt(var + eps) * gamma + beta
    pub fn forward_in_place(&self, x: &mut [f32]) {
        let dim = self.gamma.len();
        for row in x.chunks_exact_mut(dim) {
            let mean = row.iter().sum::<f32>() / dim as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
            let inv_std = 1.0 / (var + self.eps).sqrt();
            for ((v, g), b) in row.iter_mut().zip(&self.gamma).zip(&self.beta) {
                *v = (*v - mean) * inv_std * g + b;
            }
        }
    }
}

/// Position-wise feed-forward: `linear2(relu(linear1(x)))`
#[derive(Debug, Clone)]
pub struct FeedForward {
    linear1: Linear,
    linear2: Linear,
}

impl FeedForward {
    pub fn from_weights(weights: &Weights, prefix: &str, dim: usize, ff_dim: usize) -> Result<Self> {
        Ok(Self {
            linear1: Linear::from_weights(weights, &format!("{prefix}.linear1"), dim, ff_dim)?,
            linear2: Linear::from_weights(weights, &format!("{prefix}.linear2"), ff_dim, dim)?,
        })
    }

    pub fn param_specs(prefix: &str, dim: usize, ff_dim: usize) -> Vec<ParamSpec> {
        let mut specs = Linear::param_specs(&format!("{prefix}.linear1"), dim, ff_dim);
        specs.extend(Linear::param_specs(&format!("{prefix}.linear2"), ff_dim, dim));
        specs
    }

    pub fn forward(&self, x: &[f32], rows: usize) -> Result<Vec<f32>> {
        let mut hidden = self.linear1.forward(x, rows)?;
        relu_in_place(&mut hidden);
        self.linear2.forward(&hidden, rows)
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn relu_in_place(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v = v.max(0.0);
    }
}

/// Residual connection: `dst += src`
pub fn add_in_place(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

/// Numerically stable softmax; entries equal to `-inf` get probability 0
pub fn softmax_in_place(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        // fully masked row
        x.fill(0.0);
        return;
    }
    let mut sum = 0.0;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_forward() {
        // [[1, 2], [3, 4], [5, 6]] maps 2 -> 3
        let linear = Linear::new(
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            vec![0.5, 0.0, -0.5],
            2,
            3,
        )
        .unwrap();

        let out = linear.forward(&[1.0, 1.0, 0.0, 2.0], 2).unwrap();
        assert_eq!(out, vec![3.5, 7.0, 10.5, 4.5, 8.0, 11.5]);
    }

    #[test]
    fn test_linear_shape_checks() {
        assert!(Linear::new(vec![0.0; 5], vec![0.0; 3], 2, 3).is_err());
        assert!(Linear::new(vec![0.0; 6], vec![0.0; 2], 2, 3).is_err());

        let linear = Linear::new(vec![0.0; 6], vec![0.0; 3], 2, 3).unwrap();
        assert!(linear.forward(&[1.0, 2.0, 3.0], 2).is_err());
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_variance() {
        let norm = LayerNorm::new(vec![1.0; 4], vec![0.0; 4], 1e-5).unwrap();
        let mut x = vec![1.0, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 10.0];
        norm.forward_in_place(&mut x);

        let first = &x[..4];
        let mean: f32 = first.iter().sum::<f32>() / 4.0;
        let var: f32 = first.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);

        // constant row collapses to beta
        assert!(x[4..].iter().all(|v| v.abs() < 1e-3));
    }

    #[test]
    fn test_softmax() {
        let mut x = vec![1.0, 2.0, 3.0];
        softmax_in_place(&mut x);
        let sum: f32 = x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(x[2] > x[1] && x[1] > x[0]);

        let mut masked = vec![0.0, f32::NEG_INFINITY];
        softmax_in_place(&mut masked);
        assert_eq!(masked, vec![1.0, 0.0]);

        let mut all_masked = vec![f32::NEG_INFINITY; 3];
        softmax_in_place(&mut all_masked);
        assert_eq!(all_masked, vec![0.0; 3]);
    }

    #[test]
    fn test_relu_and_residual() {
        let mut x = vec![-1.0, 0.5, -0.0, 2.0];
        relu_in_place(&mut x);
        assert_eq!(x, vec![0.0, 0.5, 0.0, 2.0]);

        add_in_place(&mut x, &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(x, vec![1.0, 1.5, 1.0, 3.0]);
    }
}
