//! Named parameter store
//!
//! All model parameters live in one flat map from tensor name to an `f32`
//! buffer. The map is filled either from a safetensors file or by seeded
//! random initialization, driven by the same list of [`ParamSpec`]s so both
//! paths produce exactly the tensors the model asks for.
//!
//! # Tensor names
//!
//! ```text
//! encoder.patch_proj.{weight,bias}
//! encoder.block.self_attn.{q,k,v,out}_proj.{weight,bias}
//! encoder.block.ff.linear{1,2}.{weight,bias}
//! encoder.block.norm{1,2}.{weight,bias}
//! decoder.embedding.token.weight            [vocab_size, embed_dim]
//! decoder.embedding.position.weight         [max_len, embed_dim]
//! decoder.layers.{i}.self_attn.{q,k,v,out}_proj.{weight,bias}
//! decoder.layers.{i}.cross_attn.{q,k,v,out}_proj.{weight,bias}
//! decoder.layers.{i}.ff.linear{1,2}.{weight,bias}
//! decoder.layers.{i}.norm{1,2,3}.{weight,bias}
//! decoder.output_proj.{weight,bias}         [vocab_size, embed_dim]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::decoder::Decoder;
use crate::encoder::PatchEncoder;
use crate::{ReportError, Result};

/// How a parameter is initialized when no weights file is available
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// Uniform in `[-bound, bound)`
    Uniform(f32),
    Ones,
    Zeros,
}

/// Name, shape and initializer of one model parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: Init,
}

impl ParamSpec {
    pub fn uniform(name: String, shape: Vec<usize>, bound: f32) -> Self {
        Self {
            name,
            shape,
            init: Init::Uniform(bound),
        }
    }

    pub fn ones(name: String, shape: Vec<usize>) -> Self {
        Self {
            name,
            shape,
            init: Init::Ones,
        }
    }

    pub fn zeros(name: String, shape: Vec<usize>) -> Self {
        Self {
            name,
            shape,
            init: Init::Zeros,
        }
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Every parameter of the encoder and decoder for `config`, in a fixed order
pub fn model_param_specs(config: &ModelConfig) -> Vec<ParamSpec> {
    let mut specs = PatchEncoder::param_specs(config);
    specs.extend(Decoder::param_specs(config));
    specs
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Where the parameters came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightSource {
    File(PathBuf),
    Random { seed: u64 },
}

/// Loaded model parameters
#[derive(Debug, Clone)]
pub struct Weights {
    tensors: HashMap<String, WeightTensor>,
    source: WeightSource,
}

impl Weights {
    /// Seeded random initialization of every parameter `config` needs
    ///
    /// The same seed always produces the same parameters.
    pub fn random(config: &ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(seed);
        let mut tensors = HashMap::new();
        for spec in model_param_specs(config) {
            let numel = spec.numel();
            let data = match spec.init {
                Init::Uniform(bound) if bound > 0.0 => {
                    (0..numel).map(|_| rng.random_range(-bound..bound)).collect()
                }
                Init::Uniform(_) | Init::Zeros => vec![0.0; numel],
                Init::Ones => vec![1.0; numel],
            };
            tensors.insert(
                spec.name,
                WeightTensor {
                    shape: spec.shape,
                    data,
                },
            );
        }

        debug!(tensors = tensors.len(), seed, "Initialized random weights");
        Ok(Self {
            tensors,
            source: WeightSource::Random { seed },
        })
    }

    /// Load every parameter `config` needs from a safetensors file
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read or parsed
    /// - A required tensor is missing or not `F32`
    /// - A tensor's shape differs from what `config` implies
    pub fn from_safetensors(path: &Path, config: &ModelConfig) -> Result<Self> {
        config.validate()?;

        let bytes = std::fs::read(path)?;
        let file = SafeTensors::deserialize(&bytes)?;

        let specs = model_param_specs(config);
        let mut tensors = HashMap::with_capacity(specs.len());
        for spec in specs {
            let view = file.tensor(&spec.name).map_err(|_| {
                ReportError::Weights(format!(
                    "Missing tensor '{}' in {}",
                    spec.name,
                    path.display()
                ))
            })?;

            if view.dtype() != Dtype::F32 {
                return Err(ReportError::Weights(format!(
                    "Tensor '{}' has dtype {:?}, expected F32",
                    spec.name,
                    view.dtype()
                )));
            }
            if view.shape() != spec.shape.as_slice() {
                return Err(ReportError::ShapeMismatch {
                    what: spec.name,
                    expected: spec.shape,
                    got: view.shape().to_vec(),
                });
            }

            let data = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            tensors.insert(
                spec.name,
                WeightTensor {
                    shape: spec.shape,
                    data,
                },
            );
        }

        let extra = file.names().len().saturating_sub(tensors.len());
        if extra > 0 {
            debug!(extra, "Ignoring tensors not used by the model");
        }
        info!(path = %path.display(), tensors = tensors.len(), "Loaded weights");

        Ok(Self {
            tensors,
            source: WeightSource::File(path.to_path_buf()),
        })
    }

    /// Load from `path` if it exists, otherwise fall back to random init
    ///
    /// With `require` set, a missing file is an error instead of a warning.
    pub fn load_or_random(
        path: Option<&Path>,
        config: &ModelConfig,
        seed: u64,
        require: bool,
    ) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::from_safetensors(path, config),
            Some(path) => {
                if require {
                    return Err(ReportError::Weights(format!(
                        "Weights file {} not found",
                        path.display()
                    )));
                }
                warn!(
                    path = %path.display(),
                    seed,
                    "Weights file not found, using random initialization"
                );
                Self::random(config, seed)
            }
            None => {
                if require {
                    return Err(ReportError::Weights(
                        "No weights file configured".to_string(),
                    ));
                }
                warn!(seed, "No weights file configured, using random initialization");
                Self::random(config, seed)
            }
        }
    }

    /// Write all tensors to a safetensors file
    pub fn save_safetensors(&self, path: &Path) -> Result<()> {
        let mut names: Vec<&String> = self.tensors.keys().collect();
        names.sort();

        let buffers: Vec<(&String, &WeightTensor, Vec<u8>)> = names
            .into_iter()
            .map(|name| {
                let tensor = &self.tensors[name];
                let bytes = tensor.data.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name, tensor, bytes)
            })
            .collect();

        let views = buffers
            .iter()
            .map(|(name, tensor, bytes)| {
                TensorView::new(Dtype::F32, tensor.shape.clone(), bytes)
                    .map(|view| (name.as_str(), view))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let serialized = safetensors::serialize(views, &None)?;
        std::fs::write(path, serialized)?;
        info!(path = %path.display(), tensors = buffers.len(), "Saved weights");
        Ok(())
    }

    /// Borrow a tensor, checking its shape
    ///
    /// # Errors
    ///
    /// Returns `Weights` if the tensor is missing and `ShapeMismatch` if its
    /// shape differs from `shape`.
    pub fn get(&self, name: &str, shape: &[usize]) -> Result<&[f32]> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| ReportError::Weights(format!("Missing tensor '{}'", name)))?;

        if tensor.shape != shape {
            return Err(ReportError::ShapeMismatch {
                what: name.to_string(),
                expected: shape.to_vec(),
                got: tensor.shape.clone(),
            });
        }
        Ok(&tensor.data)
    }

    /// Replace or add a tensor
    pub fn insert(&mut self, name: impl Into<String>, tensor: WeightTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn source(&self) -> &WeightSource {
        &self.source
    }

    /// True when parameters came from a file rather than random init
    pub fn is_pretrained(&self) -> bool {
        matches!(self.source, WeightSource::File(_))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}
