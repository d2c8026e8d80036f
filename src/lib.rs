//! Embedding retrieval and tied-weight similarity layers for candle
//!
//! Two layers make up the core of the crate:
//! - **RetrievalEmbedding**: a token embedding lookup that also hands back its
//!   weight matrix as a second output
//! - **TiedOutputProjection**: scores features against an embedding table,
//!   producing per-token logits or probabilities (a tied decoder head)
//!
//! Learned and sinusoidal position embeddings are provided alongside them, and
//! every layer can be serialized to a `{class_name, config}` spec and rebuilt through an
//! explicit [`LayerRegistry`].
//!
//! # Example
//!
//! ```ignore
//! use embed_sim::config::{RetrievalEmbeddingConfig, TiedOutputProjectionConfig};
//! use embed_sim::layers::{BuildContext, Layer};
//! use embed_sim::{RetrievalEmbedding, TiedOutputProjection};
//!
//! let varmap = candle_nn::VarMap::new();
//! let ctx = BuildContext::new(&varmap, &device);
//! let mut embed = RetrievalEmbedding::new(RetrievalEmbeddingConfig::new(vocab_size, dim))?;
//! let mut head = TiedOutputProjection::new(TiedOutputProjectionConfig::default())?;
//!
//! let embedded = embed.apply(&[ids], None, &ctx)?;
//! let probs = head.apply(&[embedded[0].clone(), embedded[1].clone()], None, &ctx)?;
//! ```

pub mod config;
pub mod layers;
pub mod policies;
pub mod registry;
pub mod utils;

// Re-export commonly used items
pub use layers::{Layer, PositionEmbedding, RetrievalEmbedding, TiedOutputProjection, TrigPosEmbedding};
pub use registry::{serialize_layer, LayerRegistry};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum EmbedSimError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Layer '{0}' has not been built")]
    NotBuilt(String),

    #[error("Layer '{0}' has already been built")]
    AlreadyBuilt(String),

    #[error("Unknown layer class: {0}")]
    UnknownLayer(String),

    #[error("Weight '{0}' is already registered")]
    DuplicateWeight(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EmbedSimError>;
