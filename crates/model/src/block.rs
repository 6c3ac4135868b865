use std::{fmt, sync::Arc};

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use layers::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    norm::{LayerNorm, NormConfig, NormalizationLayer},
    residual::{Dropout, Residual, ResidualConfig},
};

use crate::{attention::SelfAttention, config::EncoderConfig};

/// Everything one layer position produces.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    /// Representation carried to the next position.
    pub hidden: Tensor,
    /// Self-attention branch after dropout, before the residual add.
    pub attention_output: Tensor,
    /// Feed-forward branch after dropout, before the residual add.
    pub ffn_output: Tensor,
    /// Head-averaged attention probabilities `(batch, seq, seq)`.
    pub attention_weights: Tensor,
}

/// Per-position transformation driven by the encoder.
pub trait LayerBlock: Send + Sync {
    fn forward(&self, hidden: &Tensor, padding_mask: Option<&Tensor>, train: bool) -> Result<LayerOutput>;
}

/// Self-attention followed by a ReLU feed-forward network.
///
/// Post-norm layers run `sublayer -> dropout -> add -> norm`; pre-norm layers
/// run `norm -> sublayer -> dropout -> add`.
pub struct EncoderLayer {
    normalize_before: bool,
    policy: PrecisionPolicy,
    self_attn: SelfAttention,
    fc1: Linear,
    fc2: Linear,
    layer_norms: [Arc<dyn NormalizationLayer>; 2],
    relu_dropout: Dropout,
    residual_attn: Residual,
    residual_ffn: Residual,
}

impl fmt::Debug for EncoderLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderLayer")
            .field("normalize_before", &self.normalize_before)
            .field("relative", &self.self_attn.is_relative())
            .field("ffn_dim", &self.fc1.config().output_dim)
            .finish()
    }
}

impl EncoderLayer {
    /// Builds the layer at `index`, registering parameters under `vb`
    /// (normally `encoder.layers.<index>`).
    pub fn new(index: usize, config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let policy = PrecisionPolicy::from_parameter_dtype(vb.dtype());
        let base_seed = (index as u64).saturating_mul(4);

        let self_attn = SelfAttention::new(
            config.embed_dim,
            config.attention_heads,
            &config.attention,
            config.attention_dropout,
            base_seed,
            vb.pp("self_attn"),
        )?;
        let fc1 = Linear::from_var_builder(
            LinearConfig::new(config.embed_dim, config.ffn_embed_dim),
            &LinearInit::XavierUniform,
            vb.pp("fc1"),
        )?;
        let fc2 = Linear::from_var_builder(
            LinearConfig::new(config.ffn_embed_dim, config.embed_dim),
            &LinearInit::XavierUniform,
            vb.pp("fc2"),
        )?;

        let norms_vb = vb.pp("layer_norms");
        let norm = |slot: usize| -> Result<Arc<dyn NormalizationLayer>> {
            let norm = LayerNorm::from_var_builder(NormConfig::new(config.embed_dim), norms_vb.pp(slot))?;
            Ok(Arc::new(norm) as Arc<dyn NormalizationLayer>)
        };
        let layer_norms = [norm(0)?, norm(1)?];

        let residual_cfg = ResidualConfig::new(Some(config.dropout));
        Ok(Self {
            normalize_before: config.normalize_before,
            policy,
            self_attn,
            fc1,
            fc2,
            layer_norms,
            relu_dropout: Dropout::new(Some(config.relu_dropout), base_seed + 1),
            residual_attn: Residual::new(residual_cfg.clone(), base_seed + 2),
            residual_ffn: Residual::new(residual_cfg, base_seed + 3),
        })
    }

    fn maybe_layer_norm(&self, slot: usize, hidden: &Tensor, before: bool) -> Result<Tensor> {
        if before == self.normalize_before {
            self.layer_norms[slot].forward(hidden, &self.policy)
        } else {
            Ok(hidden.clone())
        }
    }
}

impl LayerBlock for EncoderLayer {
    fn forward(&self, hidden: &Tensor, padding_mask: Option<&Tensor>, train: bool) -> Result<LayerOutput> {
        let normed = self.maybe_layer_norm(0, hidden, true)?;
        let (attn, attention_weights) = self.self_attn.forward(&normed, padding_mask, train)?;
        let (attention_output, after_attn) =
            self.residual_attn.step(&attn, hidden, &self.policy, train)?;
        let after_attn = self.maybe_layer_norm(0, &after_attn, false)?;

        let normed = self.maybe_layer_norm(1, &after_attn, true)?;
        let inner = self.fc1.forward(&normed, &self.policy)?.relu()?;
        let inner = self.relu_dropout.forward(&inner, &self.policy, train)?;
        let ffn = self.fc2.forward(&inner, &self.policy)?;
        let (ffn_output, after_ffn) = self.residual_ffn.step(&ffn, &after_attn, &self.policy, train)?;
        let hidden = self.maybe_layer_norm(1, &after_ffn, false)?;

        Ok(LayerOutput {
            hidden,
            attention_output,
            ffn_output,
            attention_weights,
        })
    }
}
