//! Learnable dense layer history.
//!
//! The history keeps a ledger of checkpoint outputs recorded during a single
//! forward pass and combines them with a learnable lower-triangular matrix.
//! Row `n - 1` of the matrix weights the `n` entries recorded so far. At
//! initialisation every row is a uniform average over the entries it sees.
//!
//! Entries beyond the first pass through a [`NormalizationBank`] slot: on
//! the way in when the stack is pre-norm, on the way out otherwise.

use std::{fmt, sync::Arc};

use candle_core::{bail, DType, Device, Result, Tensor, Var};
use candle_nn::{Init, VarBuilder};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    norm::{LayerNorm, NormConfig, NormalizationLayer},
};

use crate::config::IntegrationType;

/// Ordered, independent normalisation units, one per history slot.
#[derive(Clone)]
pub struct NormalizationBank {
    slots: Vec<Arc<dyn NormalizationLayer>>,
}

impl NormalizationBank {
    /// Registers `slots` layer norms under `layer_norms.<slot>`.
    pub fn new(slots: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("layer_norms");
        let slots = (0..slots)
            .map(|slot| {
                LayerNorm::from_var_builder(NormConfig::new(hidden_size), vb.pp(slot))
                    .map(|norm| Arc::new(norm) as Arc<dyn NormalizationLayer>)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { slots })
    }

    pub fn from_layers(slots: Vec<Arc<dyn NormalizationLayer>>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn apply(&self, slot: usize, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match self.slots.get(slot) {
            Some(norm) => norm.forward(hidden, policy),
            None => bail!(
                "history normalisation slot {slot} out of range ({} slots)",
                self.slots.len()
            ),
        }
    }
}

impl fmt::Debug for NormalizationBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizationBank")
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// Lower-triangular matrix with row `i` equal to `1 / (i + 1)`.
pub fn initial_weight(size: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; size * size];
    for row in 0..size {
        let value = 1.0 / (row + 1) as f32;
        for col in 0..=row {
            data[row * size + col] = value;
        }
    }
    Tensor::from_vec(data, (size, size), device)?.to_dtype(dtype)
}

/// Running weighted combination of checkpoint outputs.
pub struct LayerHistory {
    weight: Tensor,
    norms: NormalizationBank,
    ledger: Vec<Tensor>,
    normalize_before: bool,
    integration: IntegrationType,
    policy: PrecisionPolicy,
}

impl LayerHistory {
    /// Builds a history for `checkpoints` entries (`len(k)`), fetching
    /// `weight` and `layer_norms.<slot>` under `vb`.
    ///
    /// A freshly allocated weight is set to [`initial_weight`]; weights read
    /// from a snapshot are used as stored.
    pub fn new(
        checkpoints: usize,
        hidden_size: usize,
        normalize_before: bool,
        integration: IntegrationType,
        vb: VarBuilder,
    ) -> Result<Self> {
        if checkpoints == 0 {
            bail!("layer history needs at least one checkpoint");
        }
        let policy = PrecisionPolicy::from_parameter_dtype(vb.dtype());
        let weight = vb.get_with_hints((checkpoints, checkpoints), "weight", Init::Const(0.0))?;
        if weight.is_variable() && is_all_zero(&weight)? {
            let init = initial_weight(checkpoints, weight.dtype(), weight.device())?;
            Var::from_tensor(&weight)?.set(&init)?;
        }
        let norms = NormalizationBank::new(checkpoints - 1, hidden_size, vb)?;
        Self::from_parts(weight, norms, normalize_before, integration, policy)
    }

    /// Assembles a history from existing parameters.
    pub fn from_parts(
        weight: Tensor,
        norms: NormalizationBank,
        normalize_before: bool,
        integration: IntegrationType,
        policy: PrecisionPolicy,
    ) -> Result<Self> {
        let size = weight.dim(0)?;
        checks::expect_shape("history.weight", &weight, &[size, size])?;
        if norms.len() + 1 != size {
            bail!(
                "history.weight is {size}x{size} but {} normalisation slots were supplied, expected {}",
                norms.len(),
                size.saturating_sub(1)
            );
        }
        Ok(Self {
            weight,
            norms,
            ledger: Vec::with_capacity(size),
            normalize_before,
            integration,
            policy,
        })
    }

    /// Clears the ledger. Runs at the start of every forward pass.
    pub fn reset(&mut self) {
        self.ledger.clear();
    }

    /// Appends a layer output to the ledger.
    pub fn record(&mut self, hidden: &Tensor) -> Result<()> {
        checks::expect_rank("history.record", hidden, 3)?;
        let position = self.ledger.len();
        if position >= self.capacity() {
            bail!(
                "layer history is full ({} entries); reset() must run before each pass",
                self.capacity()
            );
        }
        if let Some(first) = self.ledger.first() {
            checks::expect_shape("history.record", hidden, first.dims())?;
        }

        let entry = if self.normalize_before && position > 0 {
            self.norms.apply(position - 1, hidden, &self.policy)?
        } else {
            hidden.clone()
        };
        log::debug!("layer_history record entry={}", position);
        self.ledger.push(entry);
        Ok(())
    }

    /// Weighted combination of the ledger using row `len - 1`.
    pub fn combine(&self) -> Result<Tensor> {
        let n = self.ledger.len();
        if n == 0 {
            bail!("layer history combine called on an empty ledger");
        }

        let reduction = self.policy.reduction();
        let row = self
            .weight
            .get(n - 1)?
            .narrow(0, 0, n)?
            .to_dtype(reduction)?
            .reshape((n, 1, 1, 1))?;
        let entries = self
            .ledger
            .iter()
            .map(|entry| self.policy.cast_for_reduction(entry))
            .collect::<Result<Vec<_>>>()?;
        let mut combined = Tensor::stack(&entries, 0)?.broadcast_mul(&row)?.sum(0)?;
        if self.integration == IntegrationType::Avg {
            combined = (combined / n as f64)?;
        }
        let combined = self.policy.cast_to_storage(&combined)?;
        log::debug!("layer_history combine entries={}", n);

        if n == 1 || self.normalize_before {
            Ok(combined)
        } else {
            self.norms.apply(n - 2, &combined, &self.policy)
        }
    }

    /// `0.5 * mean_i((Σ_j w[i, j] - 1)^2)`, for the training loop to add to
    /// its objective.
    pub fn regularization_loss(&self) -> Result<Tensor> {
        let row_sums = self.weight.to_dtype(self.policy.reduction())?.sum(1)?;
        let deviation = (row_sums - 1.0)?;
        deviation.sqr()?.mean_all()? * 0.5
    }

    pub fn weights(&self) -> &Tensor {
        &self.weight
    }

    pub fn norms(&self) -> &NormalizationBank {
        &self.norms
    }

    pub fn len(&self) -> usize {
        self.ledger.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.is_empty()
    }

    /// Number of entries one pass may record.
    pub fn capacity(&self) -> usize {
        self.weight.dims().first().copied().unwrap_or(0)
    }
}

impl fmt::Debug for LayerHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerHistory")
            .field("capacity", &self.capacity())
            .field("entries", &self.ledger.len())
            .field("normalize_before", &self.normalize_before)
            .field("integration", &self.integration)
            .finish()
    }
}

fn is_all_zero(tensor: &Tensor) -> Result<bool> {
    let total = tensor
        .abs()?
        .sum_all()?
        .to_dtype(DType::F32)?
        .to_vec0::<f32>()?;
    Ok(total == 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Optimizer, VarMap, SGD};

    /// Multiplies its input by a constant so tests can tell slots apart.
    struct Scale {
        config: NormConfig,
        factor: f64,
    }

    impl NormalizationLayer for Scale {
        fn config(&self) -> &NormConfig {
            &self.config
        }

        fn forward(&self, hidden: &Tensor, _policy: &PrecisionPolicy) -> Result<Tensor> {
            hidden * self.factor
        }
    }

    fn scaled_bank(factors: &[f64]) -> NormalizationBank {
        NormalizationBank::from_layers(
            factors
                .iter()
                .map(|&factor| {
                    Arc::new(Scale {
                        config: NormConfig::new(2),
                        factor,
                    }) as Arc<dyn NormalizationLayer>
                })
                .collect(),
        )
    }

    fn f32_policy() -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(DType::F32)
    }

    fn filled(value: f32) -> Result<Tensor> {
        Tensor::full(value, (1, 2, 2), &Device::Cpu)
    }

    fn values(tensor: &Tensor) -> Result<Vec<f32>> {
        tensor.flatten_all()?.to_vec1::<f32>()
    }

    fn assert_close(actual: &[f32], expected: f32) {
        for v in actual {
            assert!((v - expected).abs() < 1e-5, "{v} != {expected}");
        }
    }

    #[test]
    fn initial_rows_are_uniform_lower_triangular() -> Result<()> {
        let weight = initial_weight(4, DType::F32, &Device::Cpu)?;
        let rows = weight.to_vec2::<f32>()?;
        for (i, row) in rows.iter().enumerate() {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
            for (j, value) in row.iter().enumerate() {
                if j <= i {
                    assert!((value - 1.0 / (i + 1) as f32).abs() < 1e-6);
                } else {
                    assert_eq!(*value, 0.0);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn var_builder_initialises_weight_and_slots() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let history = LayerHistory::new(3, 2, true, IntegrationType::Sum, vb)?;
        assert_eq!(history.capacity(), 3);
        assert_eq!(history.norms().len(), 2);
        let rows = history.weights().to_vec2::<f32>()?;
        assert!((rows[2][1] - 1.0 / 3.0).abs() < 1e-6);

        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("poisoned".into()))?;
        for key in [
            "weight",
            "layer_norms.0.weight",
            "layer_norms.0.bias",
            "layer_norms.1.weight",
            "layer_norms.1.bias",
        ] {
            assert!(data.contains_key(key), "missing {key}");
        }
        assert!(!data.contains_key("layer_norms.2.weight"));
        Ok(())
    }

    #[test]
    fn single_entry_combines_to_itself() -> Result<()> {
        let weight = initial_weight(2, DType::F32, &Device::Cpu)?;
        let mut history = LayerHistory::from_parts(
            weight,
            scaled_bank(&[10.0]),
            false,
            IntegrationType::Sum,
            f32_policy(),
        )?;
        let input = Tensor::new(&[[[0.5f32, -1.5], [2.0, 3.0]]], &Device::Cpu)?;
        history.record(&input)?;
        assert_eq!(values(&history.combine()?)?, values(&input)?);
        Ok(())
    }

    #[test]
    fn combine_uses_the_active_row() -> Result<()> {
        let weight = Tensor::new(
            &[[1.0f32, 0.0, 0.0], [0.5, 0.5, 0.0], [0.2, 0.3, 0.5]],
            &Device::Cpu,
        )?;
        let mut history = LayerHistory::from_parts(
            weight,
            scaled_bank(&[1.0, 1.0]),
            false,
            IntegrationType::Sum,
            f32_policy(),
        )?;
        history.record(&filled(1.0)?)?;
        history.record(&filled(2.0)?)?;
        history.record(&filled(4.0)?)?;
        assert_close(&values(&history.combine()?)?, 0.2 + 0.6 + 2.0);
        assert_eq!(history.len(), 3);
        Ok(())
    }

    #[test]
    fn post_norm_applies_slot_after_combining() -> Result<()> {
        let weight = initial_weight(3, DType::F32, &Device::Cpu)?;
        let mut history = LayerHistory::from_parts(
            weight,
            scaled_bank(&[2.0, 3.0]),
            false,
            IntegrationType::Sum,
            f32_policy(),
        )?;
        history.record(&filled(1.0)?)?;
        history.record(&filled(3.0)?)?;
        // mean(1, 3) through slot 0
        assert_close(&values(&history.combine()?)?, 4.0);
        history.record(&filled(5.0)?)?;
        // mean(1, 3, 5) through slot 1
        assert_close(&values(&history.combine()?)?, 9.0);
        Ok(())
    }

    #[test]
    fn pre_norm_applies_slot_on_record() -> Result<()> {
        let weight = initial_weight(3, DType::F32, &Device::Cpu)?;
        let mut history = LayerHistory::from_parts(
            weight,
            scaled_bank(&[2.0, 3.0]),
            true,
            IntegrationType::Sum,
            f32_policy(),
        )?;
        history.record(&filled(1.0)?)?;
        history.record(&filled(1.0)?)?;
        history.record(&filled(1.0)?)?;
        // (1 + 2 + 3) / 3, no norm on the way out
        assert_close(&values(&history.combine()?)?, 2.0);
        Ok(())
    }

    #[test]
    fn avg_integration_divides_by_ledger_length() -> Result<()> {
        let weight = initial_weight(2, DType::F32, &Device::Cpu)?;
        let mut history = LayerHistory::from_parts(
            weight,
            scaled_bank(&[1.0]),
            true,
            IntegrationType::Avg,
            f32_policy(),
        )?;
        history.record(&filled(2.0)?)?;
        assert_close(&values(&history.combine()?)?, 2.0);
        history.record(&filled(4.0)?)?;
        assert_close(&values(&history.combine()?)?, 1.5);
        Ok(())
    }

    #[test]
    fn empty_ledger_and_overflow_are_errors() -> Result<()> {
        let weight = initial_weight(2, DType::F32, &Device::Cpu)?;
        let mut history = LayerHistory::from_parts(
            weight,
            scaled_bank(&[1.0]),
            false,
            IntegrationType::Sum,
            f32_policy(),
        )?;
        assert!(history.combine().is_err());
        history.record(&filled(1.0)?)?;
        history.record(&filled(1.0)?)?;
        assert!(history.record(&filled(1.0)?).is_err());

        history.reset();
        assert!(history.is_empty());
        history.record(&filled(1.0)?)?;
        Ok(())
    }

    #[test]
    fn mismatched_slot_count_is_rejected() -> Result<()> {
        let weight = initial_weight(3, DType::F32, &Device::Cpu)?;
        let result = LayerHistory::from_parts(
            weight,
            scaled_bank(&[1.0]),
            false,
            IntegrationType::Sum,
            f32_policy(),
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn regularization_pulls_rows_back_to_one() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let history = LayerHistory::new(3, 2, true, IntegrationType::Sum, vb)?;
        let initial = history.regularization_loss()?.to_vec0::<f32>()?;
        assert!(initial.abs() < 1e-10);

        let drifted = Tensor::new(
            &[[1.4f32, 0.0, 0.0], [0.9, 0.6, 0.0], [0.1, 0.2, 0.3]],
            &Device::Cpu,
        )?;
        Var::from_tensor(history.weights())?.set(&drifted)?;
        assert!(history.regularization_loss()?.to_vec0::<f32>()? > 0.01);

        let mut sgd = SGD::new(varmap.all_vars(), 0.5)?;
        for _ in 0..100 {
            let loss = history.regularization_loss()?;
            sgd.backward_step(&loss)?;
        }
        let row_sums = history.weights().sum(1)?.to_vec1::<f32>()?;
        for sum in row_sums {
            assert!((sum - 1.0).abs() < 1e-3, "row sum {sum}");
        }
        Ok(())
    }
}
