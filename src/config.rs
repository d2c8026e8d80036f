/// Layer configurations
///
/// Every layer is constructed from one of these structs. They serialize to the
/// `config` half of a layer spec; the base fields (`name`, `trainable`,
/// `dtype`) are flattened in next to the layer's own options.
use std::collections::BTreeMap;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::policies::{Constraint, Initializer, Regularizer};

fn default_trainable() -> bool {
    true
}

fn default_dtype() -> String {
    "float32".to_string()
}

fn default_use_bias() -> bool {
    true
}

/// Options every layer accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseLayerConfig {
    /// Layer name, also the prefix of its weight paths
    #[serde(default)]
    pub name: Option<String>,

    /// Whether an optimizer may update the layer's weights; weights of a
    /// non-trainable layer are kept out of the build context's var map
    #[serde(default = "default_trainable")]
    pub trainable: bool,

    /// Weight dtype: "float16", "bfloat16", "float32" or "float64"
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

impl Default for BaseLayerConfig {
    fn default() -> Self {
        Self {
            name: None,
            trainable: true,
            dtype: default_dtype(),
        }
    }
}

impl BaseLayerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Parse the dtype string into a candle dtype
    pub fn dtype(&self) -> crate::Result<DType> {
        match self.dtype.as_str() {
            "float16" | "f16" => Ok(DType::F16),
            "bfloat16" | "bf16" => Ok(DType::BF16),
            "float32" | "f32" => Ok(DType::F32),
            "float64" | "f64" => Ok(DType::F64),
            other => Err(crate::EmbedSimError::Config(format!(
                "Invalid dtype: {}. Must be 'float16', 'bfloat16', 'float32' or 'float64'",
                other
            ))),
        }
    }

    /// Fill in the default name when none was given; true if it was
    pub(crate) fn resolve_name(&mut self, default_name: &str) -> bool {
        if self.name.as_deref().map_or(true, str::is_empty) {
            self.name = Some(default_name.to_string());
            return true;
        }
        false
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        self.dtype()?;
        Ok(())
    }
}

fn check_unknown_keys(unknown: &BTreeMap<String, serde_json::Value>) -> crate::Result<()> {
    if unknown.is_empty() {
        return Ok(());
    }
    let keys: Vec<&str> = unknown.keys().map(String::as_str).collect();
    Err(crate::EmbedSimError::Config(format!(
        "Unknown configuration keys: {}",
        keys.join(", ")
    )))
}

/// Configuration for [`RetrievalEmbedding`](crate::layers::RetrievalEmbedding)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalEmbeddingConfig {
    #[serde(flatten)]
    pub base: BaseLayerConfig,

    /// Vocabulary size
    pub input_dim: usize,

    /// Embedding dimension
    pub output_dim: usize,

    #[serde(default = "Initializer::uniform")]
    pub embeddings_initializer: Initializer,

    #[serde(default)]
    pub embeddings_regularizer: Option<Regularizer>,

    #[serde(default)]
    pub embeddings_constraint: Option<Constraint>,

    /// Token id masked out of the lookup output
    #[serde(default)]
    pub pad_id: Option<u32>,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl RetrievalEmbeddingConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            base: BaseLayerConfig::default(),
            input_dim,
            output_dim,
            embeddings_initializer: Initializer::uniform(),
            embeddings_regularizer: None,
            embeddings_constraint: None,
            pad_id: None,
            unknown: BTreeMap::new(),
        }
    }

    pub fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = Some(pad_id);
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        check_unknown_keys(&self.unknown)?;
        self.base.validate()?;

        if self.input_dim == 0 || self.output_dim == 0 {
            return Err(crate::EmbedSimError::Config(
                "input_dim and output_dim must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration for [`TiedOutputProjection`](crate::layers::TiedOutputProjection)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiedOutputProjectionConfig {
    #[serde(flatten)]
    pub base: BaseLayerConfig,

    /// Add a learned per-token bias after the projection
    #[serde(default = "default_use_bias")]
    pub use_bias: bool,

    /// Bias initializer
    #[serde(default)]
    pub initializer: Initializer,

    /// Bias regularizer
    #[serde(default)]
    pub regularizer: Option<Regularizer>,

    /// Bias constraint
    #[serde(default)]
    pub constraint: Option<Constraint>,

    /// Treat the embedding table input as a constant
    #[serde(default)]
    pub stop_gradient: bool,

    /// Return raw scores instead of softmax probabilities.
    ///
    /// Never written by `get_config`: a reloaded layer falls back to `false`
    /// unless the key is added to the config by hand.
    #[serde(default, skip_serializing)]
    pub return_logits: bool,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl Default for TiedOutputProjectionConfig {
    fn default() -> Self {
        Self {
            base: BaseLayerConfig::default(),
            use_bias: true,
            initializer: Initializer::Zeros {},
            regularizer: None,
            constraint: None,
            stop_gradient: false,
            return_logits: false,
            unknown: BTreeMap::new(),
        }
    }
}

impl TiedOutputProjectionConfig {
    pub fn validate(&self) -> crate::Result<()> {
        check_unknown_keys(&self.unknown)?;
        self.base.validate()
    }
}

/// How a position embedding is combined with its input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionMode {
    /// Inputs are positions; output is their embedding
    #[default]
    Expand,
    /// Embedding is added to the input features
    Add,
    /// Embedding is concatenated to the input features
    Concat,
}

/// Configuration for [`PositionEmbedding`](crate::layers::PositionEmbedding)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEmbeddingConfig {
    #[serde(flatten)]
    pub base: BaseLayerConfig,

    /// Maximum position (expand mode: maximum absolute position)
    pub input_dim: usize,

    /// Embedding dimension
    pub output_dim: usize,

    #[serde(default)]
    pub mode: PositionMode,

    #[serde(default = "Initializer::uniform")]
    pub embeddings_initializer: Initializer,

    #[serde(default)]
    pub embeddings_regularizer: Option<Regularizer>,

    #[serde(default)]
    pub embeddings_constraint: Option<Constraint>,

    /// Expand mode only: mask out position 0
    #[serde(default)]
    pub mask_zero: bool,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl PositionEmbeddingConfig {
    pub fn new(input_dim: usize, output_dim: usize, mode: PositionMode) -> Self {
        Self {
            base: BaseLayerConfig::default(),
            input_dim,
            output_dim,
            mode,
            embeddings_initializer: Initializer::uniform(),
            embeddings_regularizer: None,
            embeddings_constraint: None,
            mask_zero: false,
            unknown: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        check_unknown_keys(&self.unknown)?;
        self.base.validate()?;

        if self.input_dim == 0 || self.output_dim == 0 {
            return Err(crate::EmbedSimError::Config(
                "input_dim and output_dim must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration for [`TrigPosEmbedding`](crate::layers::TrigPosEmbedding)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrigPosEmbeddingConfig {
    #[serde(flatten)]
    pub base: BaseLayerConfig,

    #[serde(default = "default_trig_mode")]
    pub mode: PositionMode,

    /// Embedding dimension; required for expand and concat, taken from the
    /// input in add mode
    #[serde(default)]
    pub output_dim: Option<usize>,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

fn default_trig_mode() -> PositionMode {
    PositionMode::Add
}

impl Default for TrigPosEmbeddingConfig {
    fn default() -> Self {
        Self {
            base: BaseLayerConfig::default(),
            mode: PositionMode::Add,
            output_dim: None,
            unknown: BTreeMap::new(),
        }
    }
}

impl TrigPosEmbeddingConfig {
    pub fn new(mode: PositionMode, output_dim: Option<usize>) -> Self {
        Self {
            mode,
            output_dim,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        check_unknown_keys(&self.unknown)?;
        self.base.validate()?;

        match (self.mode, self.output_dim) {
            (PositionMode::Expand | PositionMode::Concat, None) => {
                return Err(crate::EmbedSimError::Config(
                    "output_dim is required in expand and concat modes".to_string(),
                ));
            }
            (_, Some(dim)) if dim == 0 || dim % 2 != 0 => {
                return Err(crate::EmbedSimError::Config(format!(
                    "output_dim must be a positive even number, got {}",
                    dim
                )));
            }
            _ => {}
        }

        Ok(())
    }
}
