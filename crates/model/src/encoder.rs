use std::sync::Arc;

use candle_core::{bail, Result, Tensor};
use candle_nn::VarBuilder;
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    norm::{LayerNorm, NormConfig, NormalizationLayer},
    residual::Dropout,
};

use crate::{
    block::{EncoderLayer, LayerBlock},
    config::EncoderConfig,
    history::LayerHistory,
    schedule::{CheckpointSchedule, LayerStep},
};

/// Parameter prefix of the encoder stack.
pub const STACK_PREFIX: &str = "encoder";

/// Final encoder state.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `(batch, seq, hidden)`.
    pub hidden: Tensor,
    /// `(batch, seq)`, non-zero at padded positions; `None` when nothing is
    /// padded.
    pub padding_mask: Option<Tensor>,
}

impl EncoderOutput {
    /// Selects batch rows in `new_order`, e.g. when beams are reordered.
    pub fn reorder(&self, new_order: &Tensor) -> Result<Self> {
        let hidden = self.hidden.index_select(new_order, 0)?;
        let padding_mask = match &self.padding_mask {
            Some(mask) => Some(mask.index_select(new_order, 0)?),
            None => None,
        };
        Ok(Self {
            hidden,
            padding_mask,
        })
    }
}

/// `(batch, seq)` mask of positions equal to `padding_idx`, or `None` when
/// no position is padded.
pub fn padding_mask(tokens: &Tensor, padding_idx: u32) -> Result<Option<Tensor>> {
    checks::expect_rank("padding_mask.tokens", tokens, 2)?;
    let mask = tokens.eq(padding_idx as f64)?;
    if mask.max_all()?.to_vec0::<u8>()? == 0 {
        Ok(None)
    } else {
        Ok(Some(mask))
    }
}

enum Mode {
    Residual,
    Dense {
        history: LayerHistory,
        schedule: CheckpointSchedule,
    },
}

/// Encoder stack whose checkpoint positions read a learnable combination of
/// earlier checkpoint outputs.
pub struct DepthEncoder {
    config: EncoderConfig,
    layers: Vec<Box<dyn LayerBlock>>,
    mode: Mode,
    layer_norm: Option<Arc<dyn NormalizationLayer>>,
    input_dropout: Dropout,
    policy: PrecisionPolicy,
}

impl DepthEncoder {
    /// Validates `config`, then registers every parameter under
    /// `encoder.*` in `vb`.
    pub fn new(config: EncoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let stack_vb = vb.pp(STACK_PREFIX);
        let layers_vb = stack_vb.pp("layers");
        let layers = (0..config.layers)
            .map(|position| {
                EncoderLayer::new(position, &config, layers_vb.pp(position))
                    .map(|layer| Box::new(layer) as Box<dyn LayerBlock>)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::with_blocks(config, layers, vb)
    }

    /// Uses caller-supplied layer blocks; history and norm parameters are
    /// still registered under `encoder.*` in `vb`.
    pub fn with_blocks(config: EncoderConfig, layers: Vec<Box<dyn LayerBlock>>, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        if layers.len() != config.layers {
            bail!(
                "encoder configured for {} layers but {} blocks were supplied",
                config.layers,
                layers.len()
            );
        }
        let stack_vb = vb.pp(STACK_PREFIX);
        let policy = PrecisionPolicy::from_parameter_dtype(vb.dtype());

        let mode = if config.history.is_enabled() {
            let schedule = CheckpointSchedule::new(&config.history.k, config.layers)?;
            let history = LayerHistory::new(
                config.history.k.len(),
                config.embed_dim,
                config.normalize_before,
                config.history.integration_type,
                stack_vb.pp("history"),
            )?;
            Mode::Dense { history, schedule }
        } else {
            Mode::Residual
        };

        let layer_norm = if config.normalize_before {
            let norm = LayerNorm::from_var_builder(
                NormConfig::new(config.embed_dim),
                stack_vb.pp("layer_norm"),
            )?;
            Some(Arc::new(norm) as Arc<dyn NormalizationLayer>)
        } else {
            None
        };

        log::info!(
            "depth_encoder init layers={} dense={} checkpoints={:?} normalize_before={}",
            config.layers,
            config.history.is_enabled(),
            config.history.k,
            config.normalize_before
        );

        Ok(Self {
            input_dropout: Dropout::new(Some(config.dropout), u64::MAX / 2),
            config,
            layers,
            mode,
            layer_norm,
            policy,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn history(&self) -> Option<&LayerHistory> {
        match &self.mode {
            Mode::Dense { history, .. } => Some(history),
            Mode::Residual => None,
        }
    }

    pub fn schedule(&self) -> Option<&CheckpointSchedule> {
        match &self.mode {
            Mode::Dense { schedule, .. } => Some(schedule),
            Mode::Residual => None,
        }
    }

    /// History weight penalty, `None` for a plain residual stack.
    pub fn history_loss(&self) -> Result<Option<Tensor>> {
        self.history().map(LayerHistory::regularization_loss).transpose()
    }

    /// Runs the stack over embedded input `(batch, seq, hidden)`.
    ///
    /// `padding_mask` is `(batch, seq)`, non-zero at padded positions.
    /// Dropout is active only when `train` is set.
    pub fn forward(&mut self, input: &Tensor, padding_mask: Option<&Tensor>, train: bool) -> Result<EncoderOutput> {
        checks::expect_batch_seq_hidden("encoder.input", input, self.config.embed_dim)?;
        let hidden = self.input_dropout.forward(input, &self.policy, train)?;

        let hidden = match &mut self.mode {
            Mode::Residual => run_residual(&self.layers, hidden, padding_mask, train)?,
            Mode::Dense { history, schedule } => {
                run_dense(&self.layers, history, schedule, hidden, padding_mask, train)?
            }
        };

        let hidden = match &self.layer_norm {
            Some(norm) => norm.forward(&hidden, &self.policy)?,
            None => hidden,
        };
        Ok(EncoderOutput {
            hidden,
            padding_mask: padding_mask.cloned(),
        })
    }
}

fn run_residual(
    layers: &[Box<dyn LayerBlock>],
    mut hidden: Tensor,
    padding_mask: Option<&Tensor>,
    train: bool,
) -> Result<Tensor> {
    for layer in layers {
        hidden = layer.forward(&hidden, padding_mask, train)?.hidden;
    }
    Ok(hidden)
}

fn run_dense(
    layers: &[Box<dyn LayerBlock>],
    history: &mut LayerHistory,
    schedule: &CheckpointSchedule,
    mut hidden: Tensor,
    padding_mask: Option<&Tensor>,
    train: bool,
) -> Result<Tensor> {
    history.reset();
    history.record(&hidden)?;
    for (layer, step) in layers.iter().zip(schedule.steps()) {
        if *step == LayerStep::CombineThenRun {
            hidden = history.combine()?;
        }
        hidden = layer.forward(&hidden, padding_mask, train)?.hidden;
        if *step == LayerStep::RunThenRecord {
            history.record(&hidden)?;
        }
    }
    history.combine()
}
