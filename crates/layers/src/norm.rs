//! Layer normalisation with unified shape and dtype handling.
//!
//! Inputs follow the `(batch, seq, hidden)` convention and are normalised
//! along the last axis. Mean and variance are computed in
//! [`PrecisionPolicy::reduction`] before the output is cast back to storage.
//! The same unit backs the per-layer norms of an encoder layer, the history
//! normalisation slots and the final stack norm.

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
        }
    }
}

/// Shared interface for normalisation layers used across the stack.
pub trait NormalizationLayer: Send + Sync {
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a hidden state tensor.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Standard LayerNorm with learnable scale and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    /// Constructs a LayerNorm from existing scale and bias tensors.
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_dtype_in("norm.weight", &weight, checks::FLOAT_DTYPES)?;
        checks::expect_shape("norm.bias", &bias, &[config.hidden_size])?;
        checks::expect_dtype_in("norm.bias", &bias, checks::FLOAT_DTYPES)?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Fetches (or initialises to ones/zeros) `weight` and `bias` under `vb`.
    pub fn from_var_builder(config: NormConfig, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(config.hidden_size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(config.hidden_size, "bias", Init::Const(0.0))?;
        Self::new(weight, bias, config)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let stats = policy.cast_for_reduction(hidden)?;
        let centered = stats.broadcast_sub(&stats.mean_keepdim(D::Minus1)?)?;
        let inv_std = (centered.sqr()?.mean_keepdim(D::Minus1)? + self.config.epsilon)?
            .sqrt()?
            .recip()?;
        let normalized = policy.cast_for_matmul(&centered.broadcast_mul(&inv_std)?)?;

        let dtype = normalized.dtype();
        let scaled = normalized
            .broadcast_mul(&self.weight.to_dtype(dtype)?)?
            .broadcast_add(&self.bias.to_dtype(dtype)?)?;
        policy.cast_to_storage(&scaled)
    }
}
