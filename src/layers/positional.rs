/// Position embeddings: learned and sinusoidal
///
/// Both layers support three modes (see [`PositionMode`]): in `expand` the
/// input holds integer positions, in `add` and `concat` the input is a
/// `[batch, seq_len, features]` tensor whose positions are `0..seq_len`.
use candle_core::{DType, Device, Tensor, D};

use super::{cast_to, claim_default_name, expect_inputs, BuildContext, BuildState, Layer, ShapeSpec, Weight};
use crate::config::{BaseLayerConfig, PositionEmbeddingConfig, PositionMode, TrigPosEmbeddingConfig};
use crate::utils::padding_mask;
use crate::{EmbedSimError, Result};

/// Base for the sinusoid wavelengths
const TRIG_BASE: f32 = 10000.0;

/// Pass the first incoming mask through unchanged
fn first_mask(masks: Option<&[Option<Tensor>]>) -> Vec<Option<Tensor>> {
    vec![masks.and_then(|m| m.first().cloned().flatten())]
}

/// Split a `[batch, seq_len, features]` input
fn sequence_dims(layer: &str, inputs: &Tensor) -> Result<(usize, usize, usize)> {
    inputs.dims3().map_err(|_| {
        EmbedSimError::Shape(format!(
            "Layer '{}' expects [batch, seq_len, features] input, got {:?}",
            layer,
            inputs.dims()
        ))
    })
}

/// Output shape for add/concat modes given the embedding width
fn sequence_output_shape(layer: &str, mode: PositionMode, input: &ShapeSpec, output_dim: Option<usize>) -> Result<ShapeSpec> {
    let (last, leading) = input.split_last().ok_or_else(|| {
        EmbedSimError::Shape(format!("Layer '{}' got an empty input shape", layer))
    })?;
    match mode {
        PositionMode::Add => Ok(input.clone()),
        PositionMode::Concat => {
            let mut shape = leading.to_vec();
            shape.push(match (*last, output_dim) {
                (Some(features), Some(dim)) => Some(features + dim),
                _ => None,
            });
            Ok(shape)
        }
        PositionMode::Expand => {
            let mut shape = input.clone();
            shape.push(output_dim);
            Ok(shape)
        }
    }
}

/// Learned position embedding
///
/// In expand mode the table holds `2 * input_dim + 1` rows so that positions
/// in `[-input_dim, input_dim]` each get their own vector; positions outside
/// that range are clipped to it.
pub struct PositionEmbedding {
    auto_named: bool,
    config: PositionEmbeddingConfig,
    dtype: DType,
    state: BuildState<Weight>,
}

impl PositionEmbedding {
    pub const CLASS_NAME: &'static str = "PositionEmbedding";
    pub const DEFAULT_NAME: &'static str = "position_embedding";

    pub fn new(mut config: PositionEmbeddingConfig) -> Result<Self> {
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

    pub fn config(&self) -> &PositionEmbeddingConfig {
        &self.config
    }

    pub fn mode(&self) -> PositionMode {
        self.config.mode
    }

    pub fn embeddings(&self) -> Result<&Tensor> {
        Ok(self.state.get(self.name())?.tensor())
    }

    fn table_rows(&self) -> usize {
        match self.config.mode {
            PositionMode::Expand => self.config.input_dim * 2 + 1,
            PositionMode::Add | PositionMode::Concat => self.config.input_dim,
        }
    }

    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let table = self.state.get(self.name())?.tensor();
        match self.config.mode {
            PositionMode::Expand => {
                let limit = self.config.input_dim as f32;
                let rows = inputs
                    .to_dtype(DType::F32)?
                    .clamp(-limit, limit)?
                    .affine(1.0, limit as f64)?
                    .to_dtype(DType::U32)?;
                let mut out_dims = rows.dims().to_vec();
                out_dims.push(self.config.output_dim);
                let looked_up = table.index_select(&rows.flatten_all()?, 0)?;
                Ok(looked_up.reshape(out_dims)?)
            }
            PositionMode::Add | PositionMode::Concat => {
                let (batch, seq_len, _) = sequence_dims(self.name(), inputs)?;
                if seq_len > self.config.input_dim {
                    return Err(EmbedSimError::Shape(format!(
                        "Layer '{}' covers {} positions, got a sequence of {}",
                        self.name(),
                        self.config.input_dim,
                        seq_len
                    )));
                }
                let positions = cast_to(&table.narrow(0, 0, seq_len)?, inputs.dtype())?.unsqueeze(0)?;
                if self.config.mode == PositionMode::Add {
                    Ok(inputs.broadcast_add(&positions)?)
                } else {
                    let positions = positions
                        .broadcast_as((batch, seq_len, self.config.output_dim))?
                        .contiguous()?;
                    Ok(Tensor::cat(&[inputs, &positions], D::Minus1)?)
                }
            }
        }
    }
}

impl Layer for PositionEmbedding {
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
        expect_inputs(self.name(), input_shapes, 1)?;
        self.state.ensure_unbuilt(self.name())?;
        claim_default_name(&mut self.config.base, &mut self.auto_named, Self::DEFAULT_NAME, ctx)?;

        let weight = ctx.add_weight(
            &self.config.base,
            "embeddings",
            (self.table_rows(), self.config.output_dim),
            self.dtype,
            &self.config.embeddings_initializer,
            self.config.embeddings_regularizer.clone(),
            self.config.embeddings_constraint.clone(),
        )?;

        log::debug!("Built {} in {:?} mode", self.name(), self.config.mode);
        let name = self.name().to_string();
        self.state.transition(&name, weight)
    }

    fn call(&self, inputs: &[Tensor], _masks: Option<&[Option<Tensor>]>) -> Result<Vec<Tensor>> {
        expect_inputs(self.name(), inputs, 1)?;
        Ok(vec![self.forward(&inputs[0])?])
    }

    fn compute_output_shape(&self, input_shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>> {
        expect_inputs(self.name(), input_shapes, 1)?;
        Ok(vec![sequence_output_shape(
            self.name(),
            self.config.mode,
            &input_shapes[0],
            Some(self.config.output_dim),
        )?])
    }

    fn compute_mask(&self, inputs: &[Tensor], masks: Option<&[Option<Tensor>]>) -> Result<Vec<Option<Tensor>>> {
        match self.config.mode {
            PositionMode::Expand if self.config.mask_zero => {
                expect_inputs(self.name(), inputs, 1)?;
                Ok(vec![Some(padding_mask(&inputs[0], 0)?)])
            }
            PositionMode::Expand => Ok(vec![None]),
            PositionMode::Add | PositionMode::Concat => Ok(first_mask(masks)),
        }
    }

    fn get_config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.config)?)
    }

    fn weights(&self) -> Vec<&Weight> {
        match &self.state {
            BuildState::Built(weight) => vec![weight],
            BuildState::Unbuilt => Vec::new(),
        }
    }
}

/// Sinusoid table for the given positions
///
/// # Arguments
/// * `positions` - Tensor of positions, any shape, float dtype
/// * `dim` - Embedding dimension (even)
///
/// # Returns
/// Tensor `positions.dims() ++ [dim]` with `sin(p / 10000^(2i/dim))` in
/// channel `2i` and the matching cosine in channel `2i + 1`
pub fn sinusoid_embedding(positions: &Tensor, dim: usize, device: &Device) -> Result<Tensor> {
    // Inverse frequencies: 1 / (base^(2i/dim)) for i in [0, dim/2)
    let inv_freq: Vec<f32> = (0..dim)
        .step_by(2)
        .map(|i| 1.0 / TRIG_BASE.powf(i as f32 / dim as f32))
        .collect();
    let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;

    let rank = positions.rank();
    let angles = positions
        .to_dtype(DType::F32)?
        .unsqueeze(rank)?
        .broadcast_mul(&inv_freq)?;

    // [..., dim/2, 2] -> [..., dim] interleaves sin and cos
    let mut out_dims = positions.dims().to_vec();
    out_dims.push(dim);
    let interleaved = Tensor::stack(&[&angles.sin()?, &angles.cos()?], rank + 1)?;
    Ok(interleaved.reshape(out_dims)?)
}

/// Fixed sinusoidal position embedding; has no weights
pub struct TrigPosEmbedding {
    auto_named: bool,
    config: TrigPosEmbeddingConfig,
    state: BuildState<()>,
}

impl TrigPosEmbedding {
    pub const CLASS_NAME: &'static str = "TrigPosEmbedding";
    pub const DEFAULT_NAME: &'static str = "trig_pos_embedding";

    pub fn new(mut config: TrigPosEmbeddingConfig) -> Result<Self> {
        config.validate()?;
        let auto_named = config.base.resolve_name(Self::DEFAULT_NAME);
        Ok(Self {
            auto_named,
            config,
            state: BuildState::Unbuilt,
        })
    }

    pub fn from_config(config: serde_json::Value) -> Result<Self> {
        Self::new(serde_json::from_value(config)?)
    }

    pub fn config(&self) -> &TrigPosEmbeddingConfig {
        &self.config
    }

    pub fn mode(&self) -> PositionMode {
        self.config.mode
    }

    fn embedding_dim(&self, inputs: &Tensor) -> Result<usize> {
        match (self.config.mode, self.config.output_dim) {
            (_, Some(dim)) => Ok(dim),
            (PositionMode::Add, None) => Ok(inputs.dim(D::Minus1)?),
            _ => Err(EmbedSimError::Config(format!(
                "Layer '{}' needs output_dim in {:?} mode",
                self.name(),
                self.config.mode
            ))),
        }
    }

    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let dim = self.embedding_dim(inputs)?;
        match self.config.mode {
            PositionMode::Expand => sinusoid_embedding(inputs, dim, inputs.device()),
            PositionMode::Add | PositionMode::Concat => {
                let (batch, seq_len, features) = sequence_dims(self.name(), inputs)?;
                let positions = Tensor::arange(0u32, seq_len as u32, inputs.device())?;
                let table = cast_to(&sinusoid_embedding(&positions, dim, inputs.device())?, inputs.dtype())?;
                if self.config.mode == PositionMode::Add {
                    if features != dim {
                        return Err(EmbedSimError::Shape(format!(
                            "Layer '{}': input features {} do not match output_dim {}",
                            self.name(),
                            features,
                            dim
                        )));
                    }
                    Ok(inputs.broadcast_add(&table.unsqueeze(0)?)?)
                } else {
                    let table = table.unsqueeze(0)?.broadcast_as((batch, seq_len, dim))?.contiguous()?;
                    Ok(Tensor::cat(&[inputs, &table], D::Minus1)?)
                }
            }
        }
    }
}

impl Layer for TrigPosEmbedding {
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
        expect_inputs(self.name(), input_shapes, 1)?;
        self.state.ensure_unbuilt(self.name())?;
        claim_default_name(&mut self.config.base, &mut self.auto_named, Self::DEFAULT_NAME, ctx)?;
        let name = self.name().to_string();
        self.state.transition(&name, ())
    }

    fn call(&self, inputs: &[Tensor], _masks: Option<&[Option<Tensor>]>) -> Result<Vec<Tensor>> {
        expect_inputs(self.name(), inputs, 1)?;
        self.state.get(self.name())?;
        Ok(vec![self.forward(&inputs[0])?])
    }

    fn compute_output_shape(&self, input_shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>> {
        expect_inputs(self.name(), input_shapes, 1)?;
        Ok(vec![sequence_output_shape(
            self.name(),
            self.config.mode,
            &input_shapes[0],
            self.config.output_dim,
        )?])
    }

    fn compute_mask(&self, _inputs: &[Tensor], masks: Option<&[Option<Tensor>]>) -> Result<Vec<Option<Tensor>>> {
        Ok(first_mask(masks))
    }

    fn get_config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.config)?)
    }

    fn weights(&self) -> Vec<&Weight> {
        Vec::new()
    }
}
