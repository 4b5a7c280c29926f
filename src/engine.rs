//! Inference context
//!
//! `InferenceContext` bundles everything a request needs (tokenizer, feature
//! encoder, decoder and generation settings). It is built once at startup,
//! never mutated afterwards, and shared by reference (`Arc`) between
//! concurrent requests. All per-request state lives inside the generate
//! calls.

use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::beam::{BeamSearch, GenerationControl};
use crate::config::{GenerationConfig, ModelConfig};
use crate::decoder::{Decoder, Recompute};
use crate::encoder::{EncoderOutput, FeatureEncoder, PatchEncoder};
use crate::preprocess::{ImageTensor, PreprocessConfig};
use crate::tokenizer::Tokenizer;
use crate::weights::Weights;
use crate::{ReportError, Result};

/// Generated report for one image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Decoded text with special tokens removed
    pub text: String,

    /// Raw token ids, starting with SOS
    pub tokens: Vec<u32>,

    /// Length-normalized score of the chosen candidate
    pub score: f64,

    /// Whether generation ended with EOS rather than the step cap
    pub finished: bool,

    /// Number of beam steps executed
    pub steps: usize,
}

/// Immutable model bundle shared by all requests
///
/// # Example
///
/// ```
/// use report_decoder::{GenerationConfig, InferenceContext, ModelConfig, Tokenizer, Weights};
/// use report_decoder::preprocess::PreprocessConfig;
///
/// let tokenizer = Tokenizer::from_words(["normal", "lung", "field"]).unwrap();
/// let config = ModelConfig::tiny(tokenizer.vocab_size());
/// let weights = Weights::random(&config, 0).unwrap();
/// let generation = GenerationConfig { max_steps: 8, ..Default::default() };
///
/// let context = InferenceContext::from_weights(
///     tokenizer,
///     &weights,
///     &config,
///     generation,
///     PreprocessConfig { input_size: 16, ..Default::default() },
/// )
/// .unwrap();
/// assert_eq!(context.model_config().vocab_size, 7);
/// ```
pub struct InferenceContext {
    tokenizer: Tokenizer,
    encoder: Box<dyn FeatureEncoder>,
    decoder: Decoder,
    generation: GenerationConfig,
    preprocess: PreprocessConfig,
    weights_pretrained: bool,
}

impl InferenceContext {
    /// Assemble a context from already-built parts
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if:
    /// - The tokenizer's vocabulary size differs from the decoder's
    /// - The encoder's feature width differs from the decoder's model dimension
    /// - The generation or preprocessing settings are invalid
    pub fn new(
        tokenizer: Tokenizer,
        encoder: Box<dyn FeatureEncoder>,
        decoder: Decoder,
        generation: GenerationConfig,
        preprocess: PreprocessConfig,
        weights_pretrained: bool,
    ) -> Result<Self> {
        let model = decoder.config();
        if tokenizer.vocab_size() != model.vocab_size {
            return Err(ReportError::InvalidConfig(format!(
                "tokenizer vocabulary ({}) does not match model vocab_size ({})",
                tokenizer.vocab_size(),
                model.vocab_size
            )));
        }
        if encoder.dim() != model.embed_dim {
            return Err(ReportError::InvalidConfig(format!(
                "encoder width ({}) does not match decoder embed_dim ({})",
                encoder.dim(),
                model.embed_dim
            )));
        }
        generation.validate_for_max_len(model.max_len)?;
        preprocess.validate()?;

        Ok(Self {
            tokenizer,
            encoder,
            decoder,
            generation,
            preprocess,
            weights_pretrained,
        })
    }

    /// Build the patch encoder and decoder from one parameter store
    pub fn from_weights(
        tokenizer: Tokenizer,
        weights: &Weights,
        config: &ModelConfig,
        generation: GenerationConfig,
        preprocess: PreprocessConfig,
    ) -> Result<Self> {
        let encoder = PatchEncoder::from_weights(weights, config)?;
        let decoder = Decoder::from_weights(weights, config)?;
        Self::new(
            tokenizer,
            Box::new(encoder),
            decoder,
            generation,
            preprocess,
            weights.is_pretrained(),
        )
    }

    /// Load tokenizer and weights from disk, falling back to defaults
    ///
    /// # Arguments
    ///
    /// * `vocab_path` - JSON word -> id map; the built-in radiology vocabulary if `None`
    /// * `weights_path` - safetensors file; seeded random init if missing (unless `require_weights`)
    /// * `seed` - Seed for random initialization
    pub fn load(
        vocab_path: Option<&Path>,
        weights_path: Option<&Path>,
        require_weights: bool,
        seed: u64,
        generation: GenerationConfig,
        preprocess: PreprocessConfig,
    ) -> Result<Self> {
        let tokenizer = match vocab_path {
            Some(path) => Tokenizer::from_file(path)?,
            None => Tokenizer::default_radiology()?,
        };
        let config = ModelConfig::xray_default(tokenizer.vocab_size());
        let weights = Weights::load_or_random(weights_path, &config, seed, require_weights)?;

        info!(
            vocab_size = tokenizer.vocab_size(),
            n_layers = config.n_layers,
            embed_dim = config.embed_dim,
            pretrained = weights.is_pretrained(),
            "Model loaded"
        );
        Self::from_weights(tokenizer, &weights, &config, generation, preprocess)
    }

    /// Decode and normalize image bytes, then generate
    pub fn generate_from_bytes(&self, bytes: &[u8], control: &GenerationControl) -> Result<Report> {
        let image = ImageTensor::from_bytes(bytes, &self.preprocess)?;
        self.generate_from_tensor(&image, control)
    }

    /// Generate from a base64 string or `data:image/...;base64,` URL
    pub fn generate_from_base64(&self, payload: &str, control: &GenerationControl) -> Result<Report> {
        let image = ImageTensor::from_base64(payload, &self.preprocess)?;
        self.generate_from_tensor(&image, control)
    }

    pub fn generate_from_tensor(&self, image: &ImageTensor, control: &GenerationControl) -> Result<Report> {
        let encoder_out = self.encoder.encode(image)?;
        self.generate_from_features(&encoder_out, control)
    }

    /// Run beam search over already-encoded features
    pub fn generate_from_features(
        &self,
        encoder_out: &EncoderOutput,
        control: &GenerationControl,
    ) -> Result<Report> {
        let start = Instant::now();
        let search = BeamSearch::new(
            self.generation.clone(),
            self.tokenizer.sos_id(),
            self.tokenizer.eos_id(),
        )?;

        let output = if self.generation.use_kv_cache {
            search.run(&self.decoder, encoder_out, control)?
        } else {
            search.run(&Recompute(&self.decoder), encoder_out, control)?
        };

        let text = self.tokenizer.decode(&output.tokens, true);
        debug!(
            steps = output.steps,
            finished = output.finished,
            score = output.normalized_score,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Generated report"
        );

        Ok(Report {
            text,
            tokens: output.tokens,
            score: output.normalized_score,
            finished: output.finished,
            steps: output.steps,
        })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn model_config(&self) -> &ModelConfig {
        self.decoder.config()
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation
    }

    pub fn preprocess_config(&self) -> &PreprocessConfig {
        &self.preprocess
    }

    /// True when weights came from a file rather than random init
    pub fn weights_pretrained(&self) -> bool {
        self.weights_pretrained
    }
}
