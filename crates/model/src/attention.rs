//! Multi-head self-attention with optional relative position representations.
//!
//! Relative attention follows Shaw et al.: the offset `j - i` between query
//! and key positions is clipped to `[-max, max]` and looked up in learned
//! tables added to the key (and, unless `k_only`, value) side of the dot
//! product. Queries, keys and values come from one fused `in_proj`.

use candle_core::{bail, DType, Device, Result, Tensor, D};
use candle_nn::{ops, VarBuilder};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    residual::Dropout,
};

use crate::config::AttentionKind;

const MASKED_SCORE: f64 = -1e9;

#[derive(Debug, Clone)]
struct RelativePositions {
    max_relative_length: usize,
    keys: Tensor,
    values: Option<Tensor>,
}

impl RelativePositions {
    fn new(max_relative_length: usize, k_only: bool, head_dim: usize, vb: &VarBuilder) -> Result<Self> {
        let rows = 2 * max_relative_length + 1;
        let init = LinearInit::XavierUniform;
        let keys = vb.pp("relative_position_keys").get_with_hints(
            (rows, head_dim),
            "weight",
            init.to_init(head_dim, rows),
        )?;
        let values = if k_only {
            None
        } else {
            Some(
                vb.pp("relative_position_values").get_with_hints(
                    (rows, head_dim),
                    "weight",
                    init.to_init(head_dim, rows),
                )?,
            )
        };
        Ok(Self {
            max_relative_length,
            keys,
            values,
        })
    }

    /// `(seq, seq)` table indices for every query/key pair.
    fn indices(&self, seq: usize, device: &Device) -> Result<Tensor> {
        let max = self.max_relative_length as i64;
        let data = (0..seq as i64)
            .flat_map(|i| (0..seq as i64).map(move |j| ((j - i).clamp(-max, max) + max) as u32))
            .collect::<Vec<_>>();
        Tensor::from_vec(data, (seq, seq), device)
    }

    fn lookup(table: &Tensor, indices: &Tensor, dtype: DType) -> Result<Tensor> {
        let (seq, _) = indices.dims2()?;
        let head_dim = table.dim(1)?;
        table
            .to_dtype(dtype)?
            .index_select(&indices.flatten_all()?, 0)?
            .reshape((seq, seq, head_dim))
    }
}

/// Self-attention over `(batch, seq, hidden)` inputs.
#[derive(Debug)]
pub struct SelfAttention {
    embed_dim: usize,
    heads: usize,
    head_dim: usize,
    in_proj: Linear,
    out_proj: Linear,
    relative: Option<RelativePositions>,
    dropout: Dropout,
    policy: PrecisionPolicy,
    inner_policy: PrecisionPolicy,
}

impl SelfAttention {
    pub fn new(
        embed_dim: usize,
        heads: usize,
        kind: &AttentionKind,
        dropout: f32,
        seed: u64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if heads == 0 || embed_dim % heads != 0 {
            bail!("embed_dim {embed_dim} is not divisible by {heads} heads");
        }
        let head_dim = embed_dim / heads;
        let policy = PrecisionPolicy::from_parameter_dtype(vb.dtype());
        let inner_policy = policy.internal();

        let in_proj = Linear::from_var_builder(
            LinearConfig::new(embed_dim, 3 * embed_dim),
            &LinearInit::XavierUniform,
            vb.pp("in_proj"),
        )?;
        let out_proj = Linear::from_var_builder(
            LinearConfig::new(embed_dim, embed_dim),
            &LinearInit::XavierUniform,
            vb.pp("out_proj"),
        )?;
        let relative = match kind {
            AttentionKind::Standard => None,
            AttentionKind::Relative {
                max_relative_length,
                k_only,
            } => Some(RelativePositions::new(
                *max_relative_length,
                *k_only,
                head_dim,
                &vb,
            )?),
        };

        Ok(Self {
            embed_dim,
            heads,
            head_dim,
            in_proj,
            out_proj,
            relative,
            dropout: Dropout::new(Some(dropout), seed),
            policy,
            inner_policy,
        })
    }

    pub fn is_relative(&self) -> bool {
        self.relative.is_some()
    }

    fn split_heads(&self, tensor: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        tensor
            .reshape((batch, seq, self.heads, self.head_dim))?
            .permute((0, 2, 1, 3))?
            .contiguous()
    }

    /// `(B, H, T, X)` against a `(T, X, Y)` table per query position,
    /// giving `(B, H, T, Y)`.
    fn per_position_matmul(&self, lhs: &Tensor, table: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq, width) = lhs.dims4()?;
        let out_width = table.dim(2)?;
        lhs.reshape((batch * heads, seq, width))?
            .transpose(0, 1)?
            .contiguous()?
            .matmul(table)?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((batch, heads, seq, out_width))
    }

    /// Returns the projected output and the head-averaged attention weights
    /// `(batch, seq, seq)`.
    ///
    /// `padding_mask` is `(batch, seq)` with non-zero entries at padded keys.
    pub fn forward(
        &self,
        hidden: &Tensor,
        padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        checks::expect_batch_seq_hidden("self_attn.input", hidden, self.embed_dim)?;
        let (batch, seq, _) = hidden.dims3()?;
        let compute = self.policy.compute();

        let qkv = self.policy.cast_for_matmul(&self.in_proj.forward(hidden, &self.policy)?)?;
        let scaling = (self.head_dim as f64).powf(-0.5);
        let q = (qkv.narrow(D::Minus1, 0, self.embed_dim)? * scaling)?;
        let k = qkv.narrow(D::Minus1, self.embed_dim, self.embed_dim)?;
        let v = qkv.narrow(D::Minus1, 2 * self.embed_dim, self.embed_dim)?;

        let q = self.split_heads(&q, batch, seq)?;
        let k = self.split_heads(&k, batch, seq)?;
        let v = self.split_heads(&v, batch, seq)?;

        let mut scores = q.matmul(&k.t()?.contiguous()?)?;
        let relative_indices = match &self.relative {
            Some(relative) => {
                let indices = relative.indices(seq, hidden.device())?;
                let rel_keys = RelativePositions::lookup(&relative.keys, &indices, compute)?;
                let rel_keys_t = rel_keys.transpose(1, 2)?.contiguous()?;
                scores = (scores + self.per_position_matmul(&q, &rel_keys_t)?)?;
                Some(indices)
            }
            None => None,
        };

        if let Some(mask) = padding_mask {
            checks::expect_shape("self_attn.padding_mask", mask, &[batch, seq])?;
            let bias = (mask.ne(0u32)?.to_dtype(compute)? * MASKED_SCORE)?
                .reshape((batch, 1, 1, seq))?;
            scores = scores.broadcast_add(&bias)?;
        }

        let probs = ops::softmax_last_dim(&scores)?;
        let dropped = self.dropout.forward(&probs, &self.inner_policy, train)?;

        let mut context = dropped.matmul(&v)?;
        if let (Some(relative), Some(indices)) = (&self.relative, &relative_indices) {
            if let Some(values) = &relative.values {
                let rel_values = RelativePositions::lookup(values, indices, compute)?;
                context = (context + self.per_position_matmul(&dropped, &rel_values)?)?;
            }
        }

        let merged = context
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((batch, seq, self.embed_dim))?;
        let merged = self.policy.cast_to_storage(&merged)?;
        let output = self.out_proj.forward(&merged, &self.policy)?;
        let weights = self.policy.cast_to_storage(&probs.mean(1)?)?;
        Ok((output, weights))
    }
}
