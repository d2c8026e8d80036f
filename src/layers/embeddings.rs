/// Embedding layer that also returns its weight matrix
///
/// The second output lets a decoder head score features against the same
/// table (see [`TiedOutputProjection`](super::TiedOutputProjection)).
use candle_core::{DType, Module, Tensor};
use candle_nn::Embedding;

use super::{claim_default_name, expect_inputs, BuildContext, BuildState, Layer, ShapeSpec, Weight};
use crate::config::{BaseLayerConfig, RetrievalEmbeddingConfig};
use crate::utils::padding_mask;
use crate::Result;

struct BuiltEmbedding {
    weight: Weight,
    embedding: Embedding,
}

pub struct RetrievalEmbedding {
    auto_named: bool,
    config: RetrievalEmbeddingConfig,
    dtype: DType,
    state: BuildState<BuiltEmbedding>,
}

impl RetrievalEmbedding {
    pub const CLASS_NAME: &'static str = "RetrievalEmbedding";
    pub const DEFAULT_NAME: &'static str = "retrieval_embedding";

    pub fn new(mut config: RetrievalEmbeddingConfig) -> Result<Self> {
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

    pub fn config(&self) -> &RetrievalEmbeddingConfig {
        &self.config
    }

    pub fn input_dim(&self) -> usize {
        self.config.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.config.output_dim
    }

    pub fn pad_id(&self) -> Option<u32> {
        self.config.pad_id
    }

    /// The embedding table, once built
    pub fn embeddings(&self) -> Result<&Tensor> {
        Ok(self.state.get(self.name())?.weight.tensor())
    }

    /// Lookup result and the table itself
    ///
    /// `ids` may have any shape; the lookup has shape `ids.dims() ++ [output_dim]`.
    pub fn forward(&self, ids: &Tensor) -> Result<(Tensor, Tensor)> {
        let built = self.state.get(self.name())?;
        let looked_up = built.embedding.forward(ids)?;
        Ok((looked_up, built.weight.tensor().clone()))
    }

    /// Padding mask for `ids`, `None` when no padding id is configured
    pub fn mask(&self, ids: &Tensor) -> Result<Option<Tensor>> {
        match self.config.pad_id {
            Some(pad_id) => Ok(Some(padding_mask(ids, pad_id)?)),
            None => Ok(None),
        }
    }
}

impl Layer for RetrievalEmbedding {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
    }

    fn base_config(&self) -> &BaseLayerConfig {
        &self.config.base
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
            (self.config.input_dim, self.config.output_dim),
            self.dtype,
            &self.config.embeddings_initializer,
            self.config.embeddings_regularizer.clone(),
            self.config.embeddings_constraint.clone(),
        )?;
        let embedding = Embedding::new(weight.tensor().clone(), self.config.output_dim);

        log::debug!(
            "Built {} ({} x {}, pad_id {:?})",
            self.name(),
            self.config.input_dim,
            self.config.output_dim,
            self.config.pad_id
        );
        let name = self.name().to_string();
        self.state.transition(&name, BuiltEmbedding { weight, embedding })
    }

    fn call(&self, inputs: &[Tensor], _masks: Option<&[Option<Tensor>]>) -> Result<Vec<Tensor>> {
        expect_inputs(self.name(), inputs, 1)?;
        let (looked_up, table) = self.forward(&inputs[0])?;
        Ok(vec![looked_up, table])
    }

    fn compute_output_shape(&self, input_shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>> {
        expect_inputs(self.name(), input_shapes, 1)?;
        let mut lookup_shape = input_shapes[0].clone();
        lookup_shape.push(Some(self.config.output_dim));
        Ok(vec![
            lookup_shape,
            vec![Some(self.config.input_dim), Some(self.config.output_dim)],
        ])
    }

    fn compute_mask(&self, inputs: &[Tensor], _masks: Option<&[Option<Tensor>]>) -> Result<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        Ok(vec![self.mask(&inputs[0])?, None])
    }

    fn get_config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.config)?)
    }

    fn weights(&self) -> Vec<&Weight> {
        match &self.state {
            BuildState::Built(built) => vec![&built.weight],
            BuildState::Unbuilt => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::Regularizer;
    use crate::EmbedSimError;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn built(config: RetrievalEmbeddingConfig, varmap: &VarMap, device: &Device) -> Result<RetrievalEmbedding> {
        let mut layer = RetrievalEmbedding::new(config)?;
        layer.build(&[vec![None, None]], &BuildContext::new(varmap, device))?;
        Ok(layer)
    }

    #[test]
    fn test_lookup_and_table_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let layer = built(RetrievalEmbeddingConfig::new(10, 4), &varmap, &device)?;

        let ids = Tensor::new(&[[1u32, 2, 3], [4, 5, 0]], &device)?;
        let outputs = layer.call(&[ids], None)?;

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].dims(), &[2, 3, 4]);
        assert_eq!(outputs[1].dims(), &[10, 4]);

        Ok(())
    }

    #[test]
    fn test_table_output_equals_parameter() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let layer = built(RetrievalEmbeddingConfig::new(6, 3), &varmap, &device)?;

        let ids = Tensor::new(&[[5u32, 0]], &device)?;
        let (looked_up, table) = layer.forward(&ids)?;

        assert_eq!(table.to_vec2::<f32>()?, layer.embeddings()?.to_vec2::<f32>()?);

        // Each looked-up row is the matching table row
        let rows = looked_up.squeeze(0)?.to_vec2::<f32>()?;
        let table = table.to_vec2::<f32>()?;
        assert_eq!(rows[0], table[5]);
        assert_eq!(rows[1], table[0]);

        Ok(())
    }

    #[test]
    fn test_padding_mask() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let layer = built(RetrievalEmbeddingConfig::new(10, 4).with_pad_id(0), &varmap, &device)?;

        let ids = Tensor::new(&[[3u32, 0, 7], [0, 0, 1]], &device)?;
        let masks = layer.compute_mask(&[ids], None)?;

        assert_eq!(masks.len(), 2);
        let mask = masks[0].as_ref().map(|m| m.to_vec2::<u8>()).transpose()?;
        assert_eq!(mask, Some(vec![vec![1, 0, 1], vec![0, 0, 1]]));
        assert!(masks[1].is_none());

        Ok(())
    }

    #[test]
    fn test_no_mask_without_pad_id() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let layer = built(RetrievalEmbeddingConfig::new(10, 4), &varmap, &device)?;

        let ids = Tensor::new(&[[3u32, 0, 7]], &device)?;
        let masks = layer.compute_mask(&[ids], None)?;
        assert!(masks.iter().all(Option::is_none));

        Ok(())
    }

    #[test]
    fn test_output_shape_inference() -> Result<()> {
        let layer = RetrievalEmbedding::new(RetrievalEmbeddingConfig::new(100, 16))?;
        let shapes = layer.compute_output_shape(&[vec![None, Some(12)]])?;
        assert_eq!(shapes, vec![vec![None, Some(12), Some(16)], vec![Some(100), Some(16)]]);
        Ok(())
    }

    #[test]
    fn test_call_before_build_fails() -> Result<()> {
        let device = Device::Cpu;
        let layer = RetrievalEmbedding::new(RetrievalEmbeddingConfig::new(10, 4))?;
        let ids = Tensor::new(&[1u32, 2], &device)?;
        assert!(matches!(layer.call(&[ids], None), Err(EmbedSimError::NotBuilt(_))));
        Ok(())
    }

    #[test]
    fn test_build_twice_fails() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let mut layer = built(RetrievalEmbeddingConfig::new(10, 4), &varmap, &device)?;
        let again = layer.build(&[vec![None]], &BuildContext::new(&varmap, &device));
        assert!(matches!(again, Err(EmbedSimError::AlreadyBuilt(_))));
        Ok(())
    }

    #[test]
    fn test_regularizer_reported_as_loss() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let mut config = RetrievalEmbeddingConfig::new(10, 4);
        config.embeddings_regularizer = Some(Regularizer::L2 { l2: 0.01 });
        let layer = built(config, &varmap, &device)?;

        assert_eq!(layer.losses()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_config_keeps_pad_id() -> Result<()> {
        let layer = RetrievalEmbedding::new(RetrievalEmbeddingConfig::new(10, 4).with_pad_id(3))?;
        let value = layer.get_config()?;
        assert_eq!(value["pad_id"], 3);
        assert_eq!(value["name"], "retrieval_embedding");

        let restored = RetrievalEmbedding::from_config(value)?;
        assert_eq!(restored.pad_id(), Some(3));
        assert_eq!(restored.config(), layer.config());
        Ok(())
    }
}
