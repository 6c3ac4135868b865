//! Dense affine projections.
//!
//! Linear layers take `(batch, seq, in_dim)` or `(rows, in_dim)` inputs and
//! return the same leading dimensions with `out_dim` features. Weights use the
//! `(out_dim, in_dim)` layout. Matmuls run in [`PrecisionPolicy::compute`] and
//! results are cast back to storage.

use candle_core::{Error, Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    /// Whether a learnable bias vector is applied.
    pub bias: bool,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Weight initialisation policies for projections.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
}

impl LinearInit {
    /// Translates the policy into the `candle_nn` initialiser for a weight of
    /// shape `(fan_out, fan_in)`.
    pub fn to_init(&self, fan_in: usize, fan_out: usize) -> Init {
        let (fan_in, fan_out) = (fan_in as f64, fan_out as f64);
        match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_shape(
            "linear.weight",
            &weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", &weight, checks::FLOAT_DTYPES)?;
        match (config.bias, bias.as_ref()) {
            (true, Some(bias)) => {
                checks::expect_shape("linear.bias", bias, &[config.output_dim])?;
            }
            (false, Some(_)) => {
                return Err(Error::Msg("bias provided but config disables bias".into()))
            }
            (true, None) => return Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => {}
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Fetches `weight` (and `bias`) under `vb`, initialising them with `init`
    /// when the builder is backed by a fresh `VarMap`.
    pub fn from_var_builder(config: LinearConfig, init: &LinearInit, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (config.output_dim, config.input_dim),
            "weight",
            init.to_init(config.input_dim, config.output_dim),
        )?;
        let bias = if config.bias {
            Some(vb.get_with_hints(config.output_dim, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Applies the projection, promoting to the compute dtype for the matmul.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;

        let mut output = match input.dims() {
            [batch, seq, in_dim] if *in_dim == self.config.input_dim => {
                let flat = input.reshape((*batch * *seq, self.config.input_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((*batch, *seq, self.config.output_dim))?
            }
            [_, in_dim] if *in_dim == self.config.input_dim => input.matmul(&weight_t)?,
            dims => {
                return Err(Error::Msg(format!(
                    "linear expects [B, T, {}] or [T, {}], got {:?}",
                    self.config.input_dim, self.config.input_dim, dims
                )))
            }
        };

        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_matmul(bias)?;
            output = output.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn forward_matches_manual_matmul() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(3, 2);
        let weight = Tensor::from_vec(vec![1.0f32, 0.0, -1.0, 0.5, 0.5, 0.5], (2, 3), &device)?;
        let bias = Tensor::from_vec(vec![0.25f32, -0.25], 2, &device)?;
        let linear = Linear::new(config, weight, Some(bias))?;

        let input = Tensor::from_vec(vec![1.0f32, 2.0, 3.0], (1, 1, 3), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let out = linear.forward(&input, &policy)?.flatten_all()?.to_vec1::<f32>()?;

        assert!((out[0] - (1.0 - 3.0 + 0.25)).abs() < 1e-6);
        assert!((out[1] - (3.0 - 0.25)).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn var_builder_registers_named_parameters() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let linear = Linear::from_var_builder(
            LinearConfig::new(8, 16),
            &LinearInit::XavierUniform,
            vb.pp("fc1"),
        )?;
        assert_eq!(linear.weight().dims(), &[16, 8]);

        let bound = (6.0f32 / 24.0).sqrt();
        let max = linear.weight().abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max <= bound);

        let data = varmap.data().lock().map_err(|_| Error::Msg("poisoned".into()))?;
        assert!(data.contains_key("fc1.weight"));
        assert!(data.contains_key("fc1.bias"));
        Ok(())
    }

    #[test]
    fn rejects_mismatched_input() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::new(
            LinearConfig::new(4, 4),
            Tensor::zeros((4, 4), DType::F32, &device)?,
            Some(Tensor::zeros(4, DType::F32, &device)?),
        )?;
        let input = Tensor::zeros((1, 2, 5), DType::F32, &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        assert!(linear.forward(&input, &policy).is_err());
        Ok(())
    }
}
