/// Differentiable layers
///
/// This module contains the layer abstraction and the layers built on it:
/// - Embeddings (lookup that also returns its table)
/// - Similarity (tied-weight output projection)
/// - Positional encodings (learned, sinusoidal)
///
/// A layer goes through two phases. It is constructed from its config alone,
/// then `build` allocates its weights once the input shapes are known. `build`
/// is the only transition and runs at most once.
use std::cell::RefCell;
use std::collections::HashSet;

use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::VarMap;

use crate::config::BaseLayerConfig;
use crate::policies::{Constraint, Initializer, Regularizer};
use crate::{EmbedSimError, Result};

pub mod embeddings;
pub mod positional;
pub mod similarity;

pub use embeddings::RetrievalEmbedding;
pub use positional::{PositionEmbedding, TrigPosEmbedding};
pub use similarity::TiedOutputProjection;

/// Static shape of a layer input or output; `None` marks a dimension that is
/// only known at call time (typically the batch)
pub type ShapeSpec = Vec<Option<usize>>;

/// Fully known shape spec of a concrete tensor
pub fn shape_spec(tensor: &Tensor) -> ShapeSpec {
    tensor.dims().iter().map(|&d| Some(d)).collect()
}

/// Where newly allocated weights go
///
/// Trainable weights are registered in `varmap`, the map an optimizer is built
/// from. Weights of non-trainable layers never enter it: they go to the
/// optional `frozen` map, or stay owned by their layer alone.
pub struct BuildContext<'a> {
    varmap: &'a VarMap,
    frozen: Option<&'a VarMap>,
    device: &'a Device,
    claimed_names: RefCell<HashSet<String>>,
}

impl<'a> BuildContext<'a> {
    pub fn new(varmap: &'a VarMap, device: &'a Device) -> Self {
        Self {
            varmap,
            frozen: None,
            device,
            claimed_names: RefCell::new(HashSet::new()),
        }
    }

    /// Also keep weights of non-trainable layers in `frozen`
    pub fn with_frozen(mut self, frozen: &'a VarMap) -> Self {
        self.frozen = Some(frozen);
        self
    }

    pub fn device(&self) -> &Device {
        self.device
    }

    fn maps(&self) -> impl Iterator<Item = &'a VarMap> {
        std::iter::once(self.varmap).chain(self.frozen)
    }

    fn has_prefix(&self, prefix: &str) -> Result<bool> {
        for map in self.maps() {
            let data = map
                .data()
                .lock()
                .map_err(|e| EmbedSimError::Config(format!("Var map lock poisoned: {}", e)))?;
            if data.keys().any(|path| path.starts_with(prefix)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// First of `base`, `base_1`, `base_2`, ... not yet used by a layer
    /// built in this context or by a weight already in the var maps
    pub fn unique_name(&self, base: &str) -> Result<String> {
        let mut suffix = 0usize;
        loop {
            let candidate = if suffix == 0 {
                base.to_string()
            } else {
                format!("{}_{}", base, suffix)
            };
            let taken = self.claimed_names.borrow().contains(&candidate)
                || self.has_prefix(&format!("{}.", candidate))?;
            if !taken {
                self.claimed_names.borrow_mut().insert(candidate.clone());
                return Ok(candidate);
            }
            suffix += 1;
        }
    }

    /// Allocate a weight for `owner` under `"{layer}.{name}"`
    ///
    /// The weight lands in the var map when `owner` is trainable, so an
    /// optimizer built from `VarMap::all_vars` sees it; otherwise in the
    /// frozen map, if there is one.
    #[allow(clippy::too_many_arguments)]
    pub fn add_weight<S: Into<Shape>>(
        &self,
        owner: &BaseLayerConfig,
        name: &str,
        shape: S,
        dtype: DType,
        initializer: &Initializer,
        regularizer: Option<Regularizer>,
        constraint: Option<Constraint>,
    ) -> Result<Weight> {
        let path = format!("{}.{}", owner.name.as_deref().unwrap_or_default(), name);
        let shape = shape.into();

        for map in self.maps() {
            let data = map
                .data()
                .lock()
                .map_err(|e| EmbedSimError::Config(format!("Var map lock poisoned: {}", e)))?;
            if data.contains_key(&path) {
                return Err(EmbedSimError::DuplicateWeight(path));
            }
        }

        let target = if owner.trainable { Some(self.varmap) } else { self.frozen };
        log::debug!(
            "Allocating weight {} with shape {:?} (trainable: {})",
            path,
            shape,
            owner.trainable
        );
        let var = initializer.var(shape, dtype, self.device)?;
        if let Some(map) = target {
            map.data()
                .lock()
                .map_err(|e| EmbedSimError::Config(format!("Var map lock poisoned: {}", e)))?
                .insert(path.clone(), var.clone());
        }

        Ok(Weight {
            path,
            var,
            regularizer,
            constraint,
        })
    }
}

/// A weight owned by a layer, with the policies attached to it
#[derive(Debug, Clone)]
pub struct Weight {
    path: String,
    var: Var,
    regularizer: Option<Regularizer>,
    constraint: Option<Constraint>,
}

impl Weight {
    /// Full path in the var map
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn var(&self) -> &Var {
        &self.var
    }

    pub fn tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// Regularization penalty, if the weight has a regularizer
    pub fn penalty(&self) -> Result<Option<Tensor>> {
        match &self.regularizer {
            Some(reg) => Ok(Some(reg.penalty(self.var.as_tensor())?)),
            None => Ok(None),
        }
    }

    /// Overwrite the weight with its constrained value
    pub fn constrain(&self) -> Result<()> {
        if let Some(constraint) = &self.constraint {
            let projected = constraint.apply(self.var.as_tensor())?;
            self.var.set(&projected)?;
        }
        Ok(())
    }
}

/// Two-phase lifecycle shared by all layers
#[derive(Debug, Clone)]
pub enum BuildState<T> {
    Unbuilt,
    Built(T),
}

impl<T> Default for BuildState<T> {
    fn default() -> Self {
        BuildState::Unbuilt
    }
}

impl<T> BuildState<T> {
    pub fn is_built(&self) -> bool {
        matches!(self, BuildState::Built(_))
    }

    /// Fail unless the layer is still unbuilt
    pub fn ensure_unbuilt(&self, layer: &str) -> Result<()> {
        match self {
            BuildState::Unbuilt => Ok(()),
            BuildState::Built(_) => Err(EmbedSimError::AlreadyBuilt(layer.to_string())),
        }
    }

    /// Move to the built state; fails if the layer was already built
    pub fn transition(&mut self, layer: &str, built: T) -> Result<()> {
        self.ensure_unbuilt(layer)?;
        *self = BuildState::Built(built);
        Ok(())
    }

    pub fn get(&self, layer: &str) -> Result<&T> {
        match self {
            BuildState::Built(built) => Ok(built),
            BuildState::Unbuilt => Err(EmbedSimError::NotBuilt(layer.to_string())),
        }
    }
}

/// A differentiable layer
///
/// Inputs and outputs are lists so single- and multi-tensor layers share one
/// interface. Masks travel next to the tensors they describe; a `None` entry
/// means "no mask".
pub trait Layer {
    /// Name used to look the layer up in a [`LayerRegistry`](crate::LayerRegistry)
    fn class_name(&self) -> &'static str;

    fn base_config(&self) -> &BaseLayerConfig;

    fn name(&self) -> &str {
        self.base_config().name.as_deref().unwrap_or_default()
    }

    fn trainable(&self) -> bool {
        self.base_config().trainable
    }

    fn supports_masking(&self) -> bool {
        false
    }

    fn is_built(&self) -> bool;

    /// Allocate weights for inputs of the given shapes
    fn build(&mut self, input_shapes: &[ShapeSpec], ctx: &BuildContext) -> Result<()>;

    /// Forward computation
    fn call(&self, inputs: &[Tensor], masks: Option<&[Option<Tensor>]>) -> Result<Vec<Tensor>>;

    fn compute_output_shape(&self, input_shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>>;

    /// Masks for each output
    fn compute_mask(&self, inputs: &[Tensor], masks: Option<&[Option<Tensor>]>) -> Result<Vec<Option<Tensor>>>;

    /// Serializable configuration, base options merged in
    fn get_config(&self) -> Result<serde_json::Value>;

    fn weights(&self) -> Vec<&Weight>;

    fn trainable_weights(&self) -> Vec<&Weight> {
        if self.trainable() {
            self.weights()
        } else {
            Vec::new()
        }
    }

    /// Regularization penalties to add to the training loss
    fn losses(&self) -> Result<Vec<Tensor>> {
        let mut losses = Vec::new();
        for weight in self.weights() {
            if let Some(penalty) = weight.penalty()? {
                losses.push(penalty);
            }
        }
        Ok(losses)
    }

    /// Project weights through their constraints; call after optimizer steps
    fn apply_constraints(&self) -> Result<()> {
        for weight in self.weights() {
            weight.constrain()?;
        }
        Ok(())
    }

    /// Build from the inputs' shapes on first use, then call
    fn apply(
        &mut self,
        inputs: &[Tensor],
        masks: Option<&[Option<Tensor>]>,
        ctx: &BuildContext,
    ) -> Result<Vec<Tensor>> {
        if !self.is_built() {
            let shapes: Vec<ShapeSpec> = inputs.iter().map(shape_spec).collect();
            self.build(&shapes, ctx)?;
        }
        self.call(inputs, masks)
    }
}

/// Replace a defaulted layer name with one that is unique within `ctx`
pub(crate) fn claim_default_name(
    base: &mut BaseLayerConfig,
    auto_named: &mut bool,
    default_name: &str,
    ctx: &BuildContext,
) -> Result<()> {
    if *auto_named {
        base.name = Some(ctx.unique_name(default_name)?);
        *auto_named = false;
    }
    Ok(())
}

/// Cast `tensor` to `dtype` if it differs
pub(crate) fn cast_to(tensor: &Tensor, dtype: DType) -> candle_core::Result<Tensor> {
    if tensor.dtype() != dtype {
        tensor.to_dtype(dtype)
    } else {
        Ok(tensor.clone())
    }
}

/// Check a layer received exactly `expected` inputs
pub(crate) fn expect_inputs<T>(layer: &str, inputs: &[T], expected: usize) -> Result<()> {
    if inputs.len() != expected {
        return Err(EmbedSimError::Shape(format!(
            "Layer '{}' expects {} input(s), got {}",
            layer,
            expected,
            inputs.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_weight_registers_in_varmap() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let ctx = BuildContext::new(&varmap, &device);
        let proj = BaseLayerConfig::named("proj");

        let weight = ctx.add_weight(&proj, "bias", 5usize, DType::F32, &Initializer::Zeros {}, None, None)?;
        assert_eq!(weight.path(), "proj.bias");
        assert_eq!(weight.tensor().dims(), &[5]);
        assert_eq!(varmap.all_vars().len(), 1);

        Ok(())
    }

    #[test]
    fn test_add_weight_rejects_duplicate_path() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let ctx = BuildContext::new(&varmap, &device);
        let proj = BaseLayerConfig::named("proj");

        ctx.add_weight(&proj, "bias", 5usize, DType::F32, &Initializer::Zeros {}, None, None)?;
        let second = ctx.add_weight(&proj, "bias", 5usize, DType::F32, &Initializer::Zeros {}, None, None);
        assert!(matches!(second, Err(EmbedSimError::DuplicateWeight(_))));

        Ok(())
    }

    #[test]
    fn test_weight_constraint_and_penalty() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let ctx = BuildContext::new(&varmap, &device);
        let proj = BaseLayerConfig::named("proj");

        let weight = ctx.add_weight(
            &proj,
            "bias",
            3usize,
            DType::F32,
            &Initializer::Constant { value: -1.0 },
            Some(Regularizer::L1 { l1: 1.0 }),
            Some(Constraint::NonNeg {}),
        )?;

        let penalty = weight.penalty()?.map(|p| p.to_scalar::<f32>()).transpose()?;
        assert_eq!(penalty, Some(3.0));

        weight.constrain()?;
        assert_eq!(weight.tensor().to_vec1::<f32>()?, vec![0.0, 0.0, 0.0]);

        Ok(())
    }

    #[test]
    fn test_non_trainable_weight_stays_out_of_varmap() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let frozen = VarMap::new();
        let frozen_proj = BaseLayerConfig {
            trainable: false,
            ..BaseLayerConfig::named("frozen_proj")
        };

        let ctx = BuildContext::new(&varmap, &device);
        let weight = ctx.add_weight(&frozen_proj, "bias", 3usize, DType::F32, &Initializer::Ones {}, None, None)?;
        assert_eq!(weight.tensor().to_vec1::<f32>()?, vec![1.0; 3]);
        assert!(varmap.all_vars().is_empty());

        let ctx = BuildContext::new(&varmap, &device).with_frozen(&frozen);
        ctx.add_weight(&frozen_proj, "kernel", 3usize, DType::F32, &Initializer::Ones {}, None, None)?;
        ctx.add_weight(&BaseLayerConfig::named("proj"), "bias", 3usize, DType::F32, &Initializer::Zeros {}, None, None)?;
        assert_eq!(varmap.all_vars().len(), 1);
        assert_eq!(frozen.all_vars().len(), 1);
        assert!(frozen.data().lock().map_or(false, |data| data.contains_key("frozen_proj.kernel")));

        // Paths are unique across both maps
        let again = ctx.add_weight(&frozen_proj, "kernel", 3usize, DType::F32, &Initializer::Ones {}, None, None);
        assert!(matches!(again, Err(EmbedSimError::DuplicateWeight(_))));

        Ok(())
    }

    #[test]
    fn test_unique_name_appends_suffix() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();

        let ctx = BuildContext::new(&varmap, &device);
        assert_eq!(ctx.unique_name("head")?, "head");
        assert_eq!(ctx.unique_name("head")?, "head_1");
        assert_eq!(ctx.unique_name("head")?, "head_2");
        assert_eq!(ctx.unique_name("embedding")?, "embedding");

        // A fresh context on the same var map skips names that own weights
        ctx.add_weight(&BaseLayerConfig::named("head"), "bias", 2usize, DType::F32, &Initializer::Zeros {}, None, None)?;
        let ctx = BuildContext::new(&varmap, &device);
        assert_eq!(ctx.unique_name("head")?, "head_1");

        Ok(())
    }

    #[test]
    fn test_build_state_transitions_once() -> Result<()> {
        let mut state: BuildState<u8> = BuildState::default();
        assert!(matches!(state.get("layer"), Err(EmbedSimError::NotBuilt(_))));

        state.transition("layer", 7)?;
        assert!(state.is_built());
        assert_eq!(*state.get("layer")?, 7);

        assert!(matches!(state.transition("layer", 8), Err(EmbedSimError::AlreadyBuilt(_))));
        assert_eq!(*state.get("layer")?, 7);

        Ok(())
    }

    #[test]
    fn test_shape_spec_of_tensor() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::zeros((2, 3), DType::F32, &device)?;
        assert_eq!(shape_spec(&t), vec![Some(2), Some(3)]);
        Ok(())
    }
}
