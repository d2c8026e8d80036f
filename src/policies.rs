/// Weight policies: initializers, regularizers and constraints
///
/// Each policy serializes as `{"class_name": ..., "config": {...}}` so a layer
/// config can be written out and read back without losing how its weights are
/// created and kept in check. Short names (`"zeros"`, `"l2"`, `"non_neg"`) are
/// accepted through `FromStr`.
use std::str::FromStr;

use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::Init;
use serde::{Deserialize, Serialize};

use crate::EmbedSimError;

/// Small constant used by the norm constraints to avoid dividing by zero
const NORM_EPSILON: f64 = 1e-7;

fn default_stddev() -> f64 {
    0.05
}

fn default_minval() -> f64 {
    -0.05
}

fn default_maxval() -> f64 {
    0.05
}

fn default_penalty() -> f64 {
    0.01
}

fn default_max_value() -> f64 {
    2.0
}

fn default_one() -> f64 {
    1.0
}

/// How a weight is filled when it is first allocated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum Initializer {
    Zeros {},
    Ones {},
    Constant {
        #[serde(default)]
        value: f64,
    },
    RandomNormal {
        #[serde(default)]
        mean: f64,
        #[serde(default = "default_stddev")]
        stddev: f64,
    },
    RandomUniform {
        #[serde(default = "default_minval")]
        minval: f64,
        #[serde(default = "default_maxval")]
        maxval: f64,
    },
}

impl Initializer {
    /// Uniform in [-0.05, 0.05], the default for embedding tables
    pub fn uniform() -> Self {
        Initializer::RandomUniform {
            minval: default_minval(),
            maxval: default_maxval(),
        }
    }

    /// Equivalent candle initializer
    pub fn to_init(&self) -> Init {
        match *self {
            Initializer::Zeros {} => Init::Const(0.0),
            Initializer::Ones {} => Init::Const(1.0),
            Initializer::Constant { value } => Init::Const(value),
            Initializer::RandomNormal { mean, stddev } => Init::Randn { mean, stdev: stddev },
            Initializer::RandomUniform { minval, maxval } => Init::Uniform { lo: minval, up: maxval },
        }
    }

    /// Allocate a fresh variable filled by this initializer
    pub fn var<S: Into<Shape>>(&self, shape: S, dtype: DType, device: &Device) -> candle_core::Result<Var> {
        self.to_init().var(shape, dtype, device)
    }
}

impl Default for Initializer {
    fn default() -> Self {
        Initializer::Zeros {}
    }
}

impl FromStr for Initializer {
    type Err = EmbedSimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zeros" | "zero" => Ok(Initializer::Zeros {}),
            "ones" | "one" => Ok(Initializer::Ones {}),
            "random_normal" | "normal" => Ok(Initializer::RandomNormal {
                mean: 0.0,
                stddev: default_stddev(),
            }),
            "random_uniform" | "uniform" => Ok(Initializer::uniform()),
            other => Err(EmbedSimError::Config(format!("Unknown initializer: {}", other))),
        }
    }
}

/// Penalty added to the training loss for a weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum Regularizer {
    L1 {
        #[serde(default = "default_penalty")]
        l1: f64,
    },
    L2 {
        #[serde(default = "default_penalty")]
        l2: f64,
    },
    L1L2 {
        #[serde(default)]
        l1: f64,
        #[serde(default)]
        l2: f64,
    },
}

impl Regularizer {
    /// Scalar penalty for `weight`
    pub fn penalty(&self, weight: &Tensor) -> candle_core::Result<Tensor> {
        match *self {
            Regularizer::L1 { l1 } => weight.abs()?.sum_all()? * l1,
            Regularizer::L2 { l2 } => weight.sqr()?.sum_all()? * l2,
            Regularizer::L1L2 { l1, l2 } => {
                let l1_term = (weight.abs()?.sum_all()? * l1)?;
                let l2_term = (weight.sqr()?.sum_all()? * l2)?;
                l1_term + l2_term
            }
        }
    }
}

impl FromStr for Regularizer {
    type Err = EmbedSimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l1" => Ok(Regularizer::L1 { l1: default_penalty() }),
            "l2" => Ok(Regularizer::L2 { l2: default_penalty() }),
            "l1_l2" => Ok(Regularizer::L1L2 {
                l1: default_penalty(),
                l2: default_penalty(),
            }),
            other => Err(EmbedSimError::Config(format!("Unknown regularizer: {}", other))),
        }
    }
}

/// Projection applied to a weight after each optimizer update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum Constraint {
    NonNeg {},
    MaxNorm {
        #[serde(default = "default_max_value")]
        max_value: f64,
        #[serde(default)]
        axis: usize,
    },
    UnitNorm {
        #[serde(default)]
        axis: usize,
    },
    MinMaxNorm {
        #[serde(default)]
        min_value: f64,
        #[serde(default = "default_one")]
        max_value: f64,
        #[serde(default = "default_one")]
        rate: f64,
        #[serde(default)]
        axis: usize,
    },
}

impl Constraint {
    /// Constrained copy of `weight`
    pub fn apply(&self, weight: &Tensor) -> candle_core::Result<Tensor> {
        match *self {
            Constraint::NonNeg {} => weight.relu(),
            Constraint::MaxNorm { max_value, axis } => {
                let norms = weight.sqr()?.sum_keepdim(axis)?.sqrt()?;
                let desired = norms.clamp(0.0, max_value)?;
                rescale(weight, &norms, &desired)
            }
            Constraint::UnitNorm { axis } => {
                let norms = weight.sqr()?.sum_keepdim(axis)?.sqrt()?;
                weight.broadcast_div(&(norms + NORM_EPSILON)?)
            }
            Constraint::MinMaxNorm {
                min_value,
                max_value,
                rate,
                axis,
            } => {
                let norms = weight.sqr()?.sum_keepdim(axis)?.sqrt()?;
                let clipped = (norms.clamp(min_value, max_value)? * rate)?;
                let desired = (clipped + (norms.clone() * (1.0 - rate))?)?;
                rescale(weight, &norms, &desired)
            }
        }
    }
}

/// weight * desired / (epsilon + norms)
fn rescale(weight: &Tensor, norms: &Tensor, desired: &Tensor) -> candle_core::Result<Tensor> {
    let scale = desired.div(&(norms + NORM_EPSILON)?)?;
    weight.broadcast_mul(&scale)
}

impl FromStr for Constraint {
    type Err = EmbedSimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "non_neg" | "nonneg" => Ok(Constraint::NonNeg {}),
            "max_norm" => Ok(Constraint::MaxNorm {
                max_value: default_max_value(),
                axis: 0,
            }),
            "unit_norm" => Ok(Constraint::UnitNorm { axis: 0 }),
            "min_max_norm" => Ok(Constraint::MinMaxNorm {
                min_value: 0.0,
                max_value: 1.0,
                rate: 1.0,
                axis: 0,
            }),
            other => Err(EmbedSimError::Config(format!("Unknown constraint: {}", other))),
        }
    }
}
