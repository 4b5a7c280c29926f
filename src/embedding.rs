//! Token + learned position embedding

use crate::config::ModelConfig;
use crate::weights::{ParamSpec, Weights};
use crate::{ReportError, Result};

/// Sum of a token-identity table and a learned position table
///
/// Position `i` of a sequence receives `token[ids[i]] + position[i]`.
#[derive(Debug, Clone)]
pub struct PositionalEmbedding {
    /// [vocab_size, embed_dim]
    token: Vec<f32>,
    /// [max_len, embed_dim]
    position: Vec<f32>,
    vocab_size: usize,
    max_len: usize,
    dim: usize,
}

impl PositionalEmbedding {
    pub fn from_weights(weights: &Weights, config: &ModelConfig) -> Result<Self> {
        let dim = config.embed_dim;
        let token = weights.get("decoder.embedding.token.weight", &[config.vocab_size, dim])?;
        let position = weights.get("decoder.embedding.position.weight", &[config.max_len, dim])?;
        Ok(Self {
            token: token.to_vec(),
            position: position.to_vec(),
            vocab_size: config.vocab_size,
            max_len: config.max_len,
            dim,
        })
    }

    pub fn param_specs(config: &ModelConfig) -> Vec<ParamSpec> {
        let dim = config.embed_dim;
        vec![
            ParamSpec::uniform(
                "decoder.embedding.token.weight".to_string(),
                vec![config.vocab_size, dim],
                1.0,
            ),
            ParamSpec::uniform(
                "decoder.embedding.position.weight".to_string(),
                vec![config.max_len, dim],
                1.0,
            ),
        ]
    }

    /// Embed a whole sequence starting at position 0
    ///
    /// # Errors
    ///
    /// - `Model` for an empty sequence
    /// - `SequenceTooLong` if `ids.len() > max_len`
    /// - `TokenOutOfRange` for an id outside the vocabulary
    pub fn embed(&self, ids: &[u32]) -> Result<Vec<f32>> {
        if ids.is_empty() {
            return Err(ReportError::Model("Cannot embed an empty sequence".to_string()));
        }
        self.embed_from(ids, 0)
    }

    /// Embed `ids` as positions `start..start + ids.len()`
    pub fn embed_from(&self, ids: &[u32], start: usize) -> Result<Vec<f32>> {
        let end = start + ids.len();
        if end > self.max_len {
            return Err(ReportError::SequenceTooLong {
                len: end,
                max: self.max_len,
            });
        }

        let mut out = Vec::with_capacity(ids.len() * self.dim);
        for (offset, &id) in ids.iter().enumerate() {
            out.extend(self.embed_at(id, start + offset)?);
        }
        Ok(out)
    }

    /// Embed a single token at an absolute position
    pub fn embed_at(&self, id: u32, position: usize) -> Result<Vec<f32>> {
        let row = id as usize;
        if row >= self.vocab_size {
            return Err(ReportError::TokenOutOfRange {
                id,
                vocab_size: self.vocab_size,
            });
        }
        if position >= self.max_len {
            return Err(ReportError::SequenceTooLong {
                len: position + 1,
                max: self.max_len,
            });
        }

        let token = &self.token[row * self.dim..(row + 1) * self.dim];
        let pos = &self.position[position * self.dim..(position + 1) * self.dim];
        Ok(token.iter().zip(pos).map(|(t, p)| t + p).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding() -> PositionalEmbedding {
        let config = ModelConfig::tiny(7);
        let weights = Weights::random(&config, 3).unwrap();
        PositionalEmbedding::from_weights(&weights, &config).unwrap()
    }

    #[test]
    fn test_embed_adds_position() {
        let emb = embedding();
        let out = emb.embed(&[2, 5, 5]).unwrap();
        assert_eq!(out.len(), 3 * 16);

        // same token, different position => different vector
        assert_ne!(&out[16..32], &out[32..48]);

        let expected: Vec<f32> = (0..16)
            .map(|i| emb.token[5 * 16 + i] + emb.position[16 + i])
            .collect();
        assert_eq!(&out[16..32], expected.as_slice());
    }

    #[test]
    fn test_embed_at_matches_embed() {
        let emb = embedding();
        let full = emb.embed(&[2, 4, 6]).unwrap();
        assert_eq!(emb.embed_at(6, 2).unwrap(), full[32..48].to_vec());
        assert_eq!(emb.embed_from(&[4, 6], 1).unwrap(), full[16..].to_vec());
    }

    #[test]
    fn test_embed_errors() {
        let emb = embedding();
        assert!(matches!(emb.embed(&[]), Err(ReportError::Model(_))));
        assert!(matches!(
            emb.embed(&[2, 7]),
            Err(ReportError::TokenOutOfRange { id: 7, vocab_size: 7 })
        ));
        assert!(matches!(
            emb.embed(&[4; 17]),
            Err(ReportError::SequenceTooLong { len: 17, max: 16 })
        ));
        assert!(emb.embed_at(4, 16).is_err());

        // exactly max_len is fine
        assert!(emb.embed(&[4; 16]).is_ok());
    }
}
