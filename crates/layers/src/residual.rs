//! Residual connections and deterministic dropout.
//!
//! Residual branches combine tensors of shape `(batch, seq, hidden)`. Dropout
//! masks come from a seeded linear congruential generator; two encoders built
//! with the same layer indices drop the same activations.

use std::sync::Mutex;

use candle_core::{Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration describing how a residual branch is merged.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualConfig {
    /// Dropout probability applied to the branch during training.
    pub dropout_p: Option<f32>,
}

impl ResidualConfig {
    pub fn new(dropout_p: Option<f32>) -> Self {
        Self { dropout_p }
    }
}

/// Inverted dropout with a seeded mask generator.
#[derive(Debug)]
pub struct Dropout {
    probability: f32,
    rng: Option<Mutex<Lcg64>>,
}

impl Dropout {
    /// `None`, `0.0` or values `>= 1.0` disable dropout.
    pub fn new(probability: Option<f32>, seed: u64) -> Self {
        match probability.unwrap_or(0.0) {
            p if p <= 0.0 || p >= 1.0 => Self {
                probability: 0.0,
                rng: None,
            },
            p => Self {
                probability: p,
                rng: Some(Mutex::new(Lcg64::new(seed))),
            },
        }
    }

    /// Applies dropout when `train` is set; evaluation is the identity.
    pub fn forward(&self, tensor: &Tensor, policy: &PrecisionPolicy, train: bool) -> Result<Tensor> {
        let Some(rng) = self.rng.as_ref().filter(|_| train) else {
            return Ok(tensor.clone());
        };
        let keep_prob = 1.0 - self.probability;
        let total = tensor.elem_count();
        let mut rng = rng
            .lock()
            .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
        let mask_data = (0..total)
            .map(|_| if rng.next_f32() < keep_prob { 1.0f32 / keep_prob } else { 0.0 })
            .collect::<Vec<_>>();
        drop(rng);

        let compute = policy.cast_for_matmul(tensor)?;
        let mask = Tensor::from_vec(mask_data, tensor.dims(), tensor.device())?
            .to_dtype(compute.dtype())?;
        policy.cast_to_storage(&compute.mul(&mask)?)
    }
}

/// Residual add helper with branch dropout.
#[derive(Debug)]
pub struct Residual {
    dropout: Dropout,
}

impl Residual {
    pub fn new(config: ResidualConfig, seed: u64) -> Self {
        Self {
            dropout: Dropout::new(config.dropout_p, seed),
        }
    }

    /// Adds `branch` to `residual` in the compute dtype.
    pub fn add(&self, branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_shape("residual.branch", branch, residual.dims())?;
        checks::expect_same_dtype("residual.branch", branch, "residual.input", residual)?;

        let branch = policy.cast_for_matmul(branch)?;
        let residual = policy.cast_for_matmul(residual)?;
        policy.cast_to_storage(&branch.add(&residual)?)
    }

    /// Branch output -> dropout -> add residual.
    ///
    /// Returns the dropped branch alongside the sum so callers can expose
    /// the sublayer output.
    pub fn step(
        &self,
        branch: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let dropped = self.dropout.forward(branch, policy, train)?;
        let sum = self.add(&dropped, residual, policy)?;
        Ok((dropped, sum))
    }
}

/// Simple 64-bit linear congruential generator for deterministic masks.
#[derive(Debug, Clone)]
struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Knuth MMIX multiplier.
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}
