//! KV cache data structures for per-candidate storage
//!
//! Each beam candidate owns a `SequenceKVCache` holding the projected
//! self-attention keys and values of every token it has consumed so far.
//! Cross-attention keys and values are shared by all candidates of one
//! request and are stored once in a cache of the same shape.
//!
//! The cache is organized as a vector of LayerKVCache (one per decoder layer),
//! where each layer stores K and V rows with shape [seq_len, width]. `width`
//! is the model dimension; head `h` occupies columns `h * head_dim..(h + 1) * head_dim`.

use crate::{ReportError, Result};

/// KV cache for a single decoder layer
///
/// # Shape
/// - K: `[seq_len, width]`
/// - V: `[seq_len, width]`
///
/// Rows are appended along the sequence dimension as tokens are decoded.
#[derive(Debug, Clone)]
pub struct LayerKVCache {
    /// Key rows: [seq_len, width]
    pub k: Vec<f32>,

    /// Value rows: [seq_len, width]
    pub v: Vec<f32>,

    seq_len: usize,
    width: usize,
}

impl LayerKVCache {
    /// Create a new empty layer cache for rows of `width` values
    pub fn new(width: usize) -> Self {
        Self {
            k: Vec::new(),
            v: Vec::new(),
            seq_len: 0,
            width,
        }
    }

    /// Build a filled cache from complete K and V buffers
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if either buffer is not `seq_len * width` long.
    pub fn from_rows(k: Vec<f32>, v: Vec<f32>, width: usize) -> Result<Self> {
        let mut cache = Self::new(width);
        cache.append(k, v)?;
        Ok(cache)
    }

    /// Append K and V rows for one or more new positions
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if K and V differ in length or are not a
    /// whole number of rows.
    pub fn append(&mut self, new_k: Vec<f32>, new_v: Vec<f32>) -> Result<()> {
        if self.width == 0 || new_k.len() % self.width != 0 || new_k.len() != new_v.len() {
            return Err(ReportError::ShapeMismatch {
                what: "kv cache append".to_string(),
                expected: vec![new_k.len() / self.width.max(1), self.width],
                got: vec![new_k.len(), new_v.len()],
            });
        }

        self.seq_len += new_k.len() / self.width;
        self.k.extend(new_k);
        self.v.extend(new_v);
        Ok(())
    }

    /// Drop all cached rows, keeping the allocation
    pub fn clear(&mut self) {
        self.k.clear();
        self.v.clear();
        self.seq_len = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.seq_len == 0
    }

    /// Number of positions stored in this cache
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

/// Per-candidate KV cache storing keys and values for all layers
///
/// Cloning a `SequenceKVCache` is how a child candidate inherits its parent's
/// history during beam expansion.
///
/// # Usage
///
/// ```
/// use report_decoder::SequenceKVCache;
///
/// // Cache for a 4-layer decoder with model dimension 512
/// let cache = SequenceKVCache::new(4, 512);
/// assert_eq!(cache.num_layers(), 4);
/// assert_eq!(cache.current_length(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct SequenceKVCache {
    /// Vector of layer caches (one per decoder layer)
    pub layers: Vec<LayerKVCache>,
}

impl SequenceKVCache {
    /// Create a new empty KV cache for `n_layers` layers of the given width
    pub fn new(n_layers: usize, width: usize) -> Self {
        Self {
            layers: vec![LayerKVCache::new(width); n_layers],
        }
    }

    /// Wrap already-filled layer caches
    pub fn from_layers(layers: Vec<LayerKVCache>) -> Self {
        Self { layers }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Get the cache for a specific layer
    ///
    /// # Errors
    ///
    /// Returns `Model` if `layer_idx` is out of bounds.
    pub fn layer(&self, layer_idx: usize) -> Result<&LayerKVCache> {
        let n_layers = self.layers.len();
        self.layers.get(layer_idx).ok_or_else(|| {
            ReportError::Model(format!(
                "Layer index {} out of bounds for {} cached layers",
                layer_idx, n_layers
            ))
        })
    }

    /// Get a mutable reference to the cache for a specific layer
    ///
    /// # Errors
    ///
    /// Returns `Model` if `layer_idx` is out of bounds.
    pub fn layer_mut(&mut self, layer_idx: usize) -> Result<&mut LayerKVCache> {
        let n_layers = self.layers.len();
        self.layers.get_mut(layer_idx).ok_or_else(|| {
            ReportError::Model(format!(
                "Layer index {} out of bounds for {} cached layers",
                layer_idx, n_layers
            ))
        })
    }

    /// Current sequence length stored in this cache
    ///
    /// Returns 0 if the cache is empty, otherwise the length of the first
    /// layer (all layers advance together).
    pub fn current_length(&self) -> usize {
        self.layers.first().map(LayerKVCache::seq_len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.current_length() == 0
    }

    /// Forget every cached position in every layer
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
    }
}

/// Cross-attention K/V of the encoder output for every decoder layer
///
/// Computed once per request and shared read-only by all candidates.
pub type CrossAttentionCache = SequenceKVCache;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_kv_cache_new() {
        let cache = LayerKVCache::new(8);
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
        assert_eq!(cache.width(), 8);
    }

    #[test]
    fn test_sequence_kv_cache_new() {
        let cache = SequenceKVCache::new(4, 16);
        assert_eq!(cache.num_layers(), 4);
        assert_eq!(cache.current_length(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_append_rows() {
        let mut cache = SequenceKVCache::new(2, 4);

        // Prefill three positions
        cache.layer_mut(0).unwrap().append(vec![1.0; 12], vec![2.0; 12]).unwrap();
        assert_eq!(cache.current_length(), 3);

        // One more decoded position
        cache.layer_mut(0).unwrap().append(vec![3.0; 4], vec![4.0; 4]).unwrap();
        assert_eq!(cache.current_length(), 4);

        let layer = cache.layer(0).unwrap();
        assert_eq!(&layer.k[12..], &[3.0; 4]);
        assert_eq!(&layer.v[..4], &[2.0; 4]);
    }

    #[test]
    fn test_append_shape_mismatch() {
        let mut cache = LayerKVCache::new(4);
        // not a whole row
        assert!(cache.append(vec![1.0; 6], vec![1.0; 6]).is_err());
        // K and V disagree
        assert!(cache.append(vec![1.0; 4], vec![1.0; 8]).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_from_rows() {
        let layer = LayerKVCache::from_rows(vec![0.5; 10], vec![0.25; 10], 5).unwrap();
        assert_eq!(layer.seq_len(), 2);
        assert!(LayerKVCache::from_rows(vec![0.5; 10], vec![0.25; 10], 3).is_err());

        let cache = SequenceKVCache::from_layers(vec![layer.clone(), layer]);
        assert_eq!(cache.num_layers(), 2);
        assert_eq!(cache.current_length(), 2);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut parent = SequenceKVCache::new(1, 2);
        parent.layer_mut(0).unwrap().append(vec![1.0, 1.0], vec![1.0, 1.0]).unwrap();

        let mut child = parent.clone();
        child.layer_mut(0).unwrap().append(vec![2.0, 2.0], vec![2.0, 2.0]).unwrap();

        assert_eq!(parent.current_length(), 1);
        assert_eq!(child.current_length(), 2);
    }

    #[test]
    fn test_clear() {
        let mut cache = SequenceKVCache::new(3, 2);
        for layer_idx in 0..3 {
            cache
                .layer_mut(layer_idx)
                .unwrap()
                .append(vec![layer_idx as f32; 4], vec![0.0; 4])
                .unwrap();
        }
        assert_eq!(cache.current_length(), 2);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.layers.iter().all(LayerKVCache::is_empty));
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mut cache = SequenceKVCache::new(4, 8);
        assert!(cache.layer(4).is_err());
        assert!(cache.layer_mut(7).is_err());
    }
}
