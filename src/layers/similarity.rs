/// Similarity between features and token embeddings
///
/// Scores each feature vector against every row of an embedding table, the
/// output head of a decoder whose input and output embeddings are tied. The
/// table arrives as the second input rather than being owned by the layer;
/// only the optional per-token bias is a weight of this layer.
use candle_core::{DType, Tensor, D};

use super::{cast_to, claim_default_name, expect_inputs, BuildContext, BuildState, Layer, ShapeSpec, Weight};
use crate::config::{BaseLayerConfig, TiedOutputProjectionConfig};
use crate::{EmbedSimError, Result};

struct BuiltProjection {
    bias: Option<Weight>,
}

pub struct TiedOutputProjection {
    auto_named: bool,
    config: TiedOutputProjectionConfig,
    dtype: DType,
    state: BuildState<BuiltProjection>,
}

impl TiedOutputProjection {
    pub const CLASS_NAME: &'static str = "TiedOutputProjection";
    pub const DEFAULT_NAME: &'static str = "tied_output_projection";

    pub fn new(mut config: TiedOutputProjectionConfig) -> Result<Self> {
        config.validate()?;
        let auto_named = config.base.resolve_name(Self::DEFAULT_NAME);
        let dtype = config.base.dtype()?;
        Ok(Self {
            auto_named,
            config,
            dtype,
            state: BuildState::Unbuilt,
        })
    }

    pub fn from_config(config: serde_json::Value) -> Result<Self> {
        Self::new(serde_json::from_value(config)?)
    }

    pub fn config(&self) -> &TiedOutputProjectionConfig {
        &self.config
    }

    pub fn use_bias(&self) -> bool {
        self.config.use_bias
    }

    pub fn stop_gradient(&self) -> bool {
        self.config.stop_gradient
    }

    pub fn return_logits(&self) -> bool {
        self.config.return_logits
    }

    /// The bias vector, if the layer is built with one
    pub fn bias(&self) -> Result<Option<&Tensor>> {
        Ok(self.state.get(self.name())?.bias.as_ref().map(Weight::tensor))
    }

    /// Per-token scores for `features` against `embeddings`
    ///
    /// # Arguments
    /// * `features` - Tensor [..., embedding_dim]
    /// * `embeddings` - Tensor [vocab_size, embedding_dim]
    ///
    /// # Returns
    /// Tensor [..., vocab_size]: logits if `return_logits`, otherwise softmax
    /// probabilities over the last axis
    pub fn forward(&self, features: &Tensor, embeddings: &Tensor) -> Result<Tensor> {
        let built = self.state.get(self.name())?;
        check_table(self.name(), features, embeddings)?;

        let embeddings = if self.config.stop_gradient {
            embeddings.detach()
        } else {
            embeddings.clone()
        };
        let embeddings = cast_to(&embeddings, features.dtype())?;

        // features @ embeddings^T, contracting embedding_dim
        let outputs = if features.rank() == 1 {
            features
                .unsqueeze(0)?
                .matmul(&embeddings.t()?)?
                .squeeze(0)?
        } else {
            features.broadcast_matmul(&embeddings.t()?)?
        };

        let outputs = match &built.bias {
            Some(bias) => outputs.broadcast_add(&cast_to(bias.tensor(), outputs.dtype())?)?,
            None => outputs,
        };

        if self.config.return_logits {
            Ok(outputs)
        } else {
            Ok(candle_nn::ops::softmax(&outputs, D::Minus1)?)
        }
    }
}

fn check_table(layer: &str, features: &Tensor, embeddings: &Tensor) -> Result<()> {
    if embeddings.rank() != 2 {
        return Err(EmbedSimError::Shape(format!(
            "Layer '{}' expects a 2-D embedding table, got shape {:?}",
            layer,
            embeddings.dims()
        )));
    }
    let feature_dim = features.dim(D::Minus1)?;
    let embedding_dim = embeddings.dim(1)?;
    if feature_dim != embedding_dim {
        return Err(EmbedSimError::Shape(format!(
            "Layer '{}': feature dim {} does not match embedding dim {}",
            layer, feature_dim, embedding_dim
        )));
    }
    Ok(())
}

impl Layer for TiedOutputProjection {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
    }

    fn base_config(&self) -> &BaseLayerConfig {
        &self.config.base
    }

    fn supports_masking(&self) -> bool {
        true
    }

    fn is_built(&self) -> bool {
        self.state.is_built()
    }

    fn build(&mut self, input_shapes: &[ShapeSpec], ctx: &BuildContext) -> Result<()> {
        expect_inputs(self.name(), input_shapes, 2)?;
        self.state.ensure_unbuilt(self.name())?;
        claim_default_name(&mut self.config.base, &mut self.auto_named, Self::DEFAULT_NAME, ctx)?;

        let (feature_shape, embed_shape) = (&input_shapes[0], &input_shapes[1]);
        if embed_shape.len() != 2 {
            return Err(EmbedSimError::Shape(format!(
                "Layer '{}' expects a 2-D embedding table, got {:?}",
                self.name(),
                embed_shape
            )));
        }
        if let (Some(Some(feature_dim)), Some(embedding_dim)) = (feature_shape.last(), embed_shape[1]) {
            if *feature_dim != embedding_dim {
                return Err(EmbedSimError::Shape(format!(
                    "Layer '{}': feature dim {} does not match embedding dim {}",
                    self.name(),
                    feature_dim,
                    embedding_dim
                )));
            }
        }

        let bias = if self.config.use_bias {
            let token_num = embed_shape[0].ok_or_else(|| {
                EmbedSimError::Shape(format!(
                    "Layer '{}' needs a statically known vocabulary size to allocate its bias",
                    self.name()
                ))
            })?;
            Some(ctx.add_weight(
                &self.config.base,
                "bias",
                token_num,
                self.dtype,
                &self.config.initializer,
                self.config.regularizer.clone(),
                self.config.constraint.clone(),
            )?)
        } else {
            None
        };

        log::debug!(
            "Built {} (bias: {}, stop_gradient: {}, return_logits: {})",
            self.name(),
            bias.is_some(),
            self.config.stop_gradient,
            self.config.return_logits
        );
        let name = self.name().to_string();
        self.state.transition(&name, BuiltProjection { bias })
    }

    fn call(&self, inputs: &[Tensor], _masks: Option<&[Option<Tensor>]>) -> Result<Vec<Tensor>> {
        expect_inputs(self.name(), inputs, 2)?;
        Ok(vec![self.forward(&inputs[0], &inputs[1])?])
    }

    fn compute_output_shape(&self, input_shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>> {
        expect_inputs(self.name(), input_shapes, 2)?;
        let (feature_shape, embed_shape) = (&input_shapes[0], &input_shapes[1]);
        let token_num = embed_shape.first().copied().ok_or_else(|| {
            EmbedSimError::Shape(format!("Layer '{}' got an empty embedding shape", self.name()))
        })?;

        let mut output_shape: ShapeSpec = feature_shape
            .split_last()
            .map(|(_, leading)| leading.to_vec())
            .unwrap_or_default();
        output_shape.push(token_num);
        Ok(vec![output_shape])
    }

    fn compute_mask(&self, _inputs: &[Tensor], masks: Option<&[Option<Tensor>]>) -> Result<Vec<Option<Tensor>>> {
        // Only the features-side mask survives; the table has no positions
        let mask = masks.and_then(|m| m.first().cloned().flatten());
        Ok(vec![mask])
    }

    fn get_config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.config)?)
    }

    fn weights(&self) -> Vec<&Weight> {
        match &self.state {
            BuildState::Built(BuiltProjection { bias: Some(bias) }) => vec![bias],
            _ => Vec::new(),
        }
    }
}
