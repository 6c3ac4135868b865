use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use model::{
    padding_mask, AttentionKind, DepthEncoder, EncoderConfig, HistoryConfig, LayerBlock,
    LayerOutput, PRESETS,
};

fn small_config(layers: usize, k: Vec<usize>) -> EncoderConfig {
    EncoderConfig::new(8, 16, 2, layers)
        .with_normalize_before(true)
        .with_attention(AttentionKind::Relative {
            max_relative_length: 4,
            k_only: true,
        })
        .with_history(HistoryConfig::dense(k))
}

/// Adds a constant and counts how often it runs.
struct Shift {
    amount: f64,
    calls: Arc<AtomicUsize>,
}

impl LayerBlock for Shift {
    fn forward(
        &self,
        hidden: &Tensor,
        _padding_mask: Option<&Tensor>,
        _train: bool,
    ) -> candle_core::Result<LayerOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let out = (hidden + self.amount)?;
        Ok(LayerOutput {
            hidden: out.clone(),
            attention_output: out.clone(),
            ffn_output: out,
            attention_weights: hidden.clone(),
        })
    }
}

fn shift_blocks(layers: usize, calls: &Arc<AtomicUsize>) -> Vec<Box<dyn LayerBlock>> {
    (0..layers)
        .map(|_| {
            Box::new(Shift {
                amount: 1.0,
                calls: Arc::clone(calls),
            }) as Box<dyn LayerBlock>
        })
        .collect()
}

/// Adds one and keeps the largest magnitude of every input it sees.
struct Tap {
    seen: Arc<Mutex<Vec<f32>>>,
}

impl LayerBlock for Tap {
    fn forward(
        &self,
        hidden: &Tensor,
        _padding_mask: Option<&Tensor>,
        _train: bool,
    ) -> candle_core::Result<LayerOutput> {
        let magnitude = hidden.abs()?.max_all()?.to_vec0::<f32>()?;
        self.seen
            .lock()
            .map_err(|_| candle_core::Error::Msg("tap mutex poisoned".into()))?
            .push(magnitude);
        let out = (hidden + 1.0)?;
        Ok(LayerOutput {
            hidden: out.clone(),
            attention_output: out.clone(),
            ffn_output: out,
            attention_weights: hidden.clone(),
        })
    }
}

#[test]
fn dense_encoder_preserves_shape() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let mut encoder = DepthEncoder::new(small_config(6, vec![0, 3, 6]), vb)?;

    let input = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu)?;
    let output = encoder.forward(&input, None, false)?;

    assert_eq!(output.hidden.dims(), &[2, 5, 8]);
    assert!(output.padding_mask.is_none());
    assert_eq!(encoder.history().map(|h| h.len()), Some(3));
    Ok(())
}

#[test]
fn every_checkpoint_output_reaches_the_ledger() -> Result<()> {
    for preset in PRESETS.iter().filter(|preset| preset.layers <= 24) {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = EncoderConfig::new(4, 8, 1, preset.layers).with_history(preset.history());
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut encoder =
            DepthEncoder::with_blocks(config, shift_blocks(preset.layers, &calls), vb)?;

        let input = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu)?;
        encoder.forward(&input, None, false)?;

        assert_eq!(calls.load(Ordering::SeqCst), preset.layers, "{}", preset.name);
        assert_eq!(
            encoder.history().map(|h| h.len()),
            Some(preset.k.len()),
            "{}",
            preset.name
        );
    }
    Ok(())
}

/// Post-norm: every combine after the first entry goes through a fresh
/// LayerNorm, which maps the constant hidden states to zero. Layers add one,
/// so a layer fed zeros ran right after a combine.
#[test]
fn forward_combines_once_per_checkpoint() -> Result<()> {
    for preset in PRESETS.iter().filter(|preset| preset.layers <= 24) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let blocks = (0..preset.layers)
            .map(|_| {
                Box::new(Tap {
                    seen: Arc::clone(&seen),
                }) as Box<dyn LayerBlock>
            })
            .collect();
        let config = EncoderConfig::new(4, 8, 1, preset.layers)
            .with_normalize_before(false)
            .with_history(preset.history());
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut encoder = DepthEncoder::with_blocks(config, blocks, vb)?;

        let input = Tensor::ones((1, 2, 4), DType::F32, &Device::Cpu)?;
        let output = encoder.forward(&input, None, false)?;

        let seen = seen
            .lock()
            .map_err(|_| anyhow::anyhow!("tap mutex poisoned"))?
            .clone();
        assert_eq!(seen.len(), preset.layers, "{}", preset.name);
        let combined_before = seen
            .iter()
            .enumerate()
            .filter(|(_, magnitude)| **magnitude < 1e-3)
            .map(|(position, _)| position)
            .collect::<Vec<_>>();
        let inner = preset
            .k
            .iter()
            .copied()
            .filter(|&position| position > 0 && position < preset.layers)
            .collect::<Vec<_>>();
        assert_eq!(combined_before, inner, "{}", preset.name);

        // The first combine sees only the input; the last one yields the output.
        assert!((seen[0] - 1.0).abs() < 1e-6, "{}", preset.name);
        let final_magnitude = output.hidden.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(final_magnitude < 1e-3, "{}", preset.name);
        assert_eq!(combined_before.len() + 2, preset.k.len(), "{}", preset.name);
    }
    Ok(())
}

#[test]
fn history_is_reset_between_passes() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = EncoderConfig::new(4, 8, 1, 4).with_history(HistoryConfig::dense(vec![0, 2, 4]));
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let mut encoder = DepthEncoder::with_blocks(config, shift_blocks(4, &calls), vb)?;

    let input = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu)?;
    for _ in 0..3 {
        encoder.forward(&input, None, true)?;
        assert_eq!(encoder.history().map(|h| h.len()), Some(3));
    }
    Ok(())
}

#[test]
fn without_history_the_stack_is_plain_residual() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = EncoderConfig::new(4, 8, 1, 5);
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let mut encoder = DepthEncoder::with_blocks(config, shift_blocks(5, &calls), vb)?;
    assert!(encoder.history().is_none());
    assert!(encoder.history_loss()?.is_none());

    let input = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu)?;
    let output = encoder.forward(&input, None, false)?;
    let values = output.hidden.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| (*v - 5.0).abs() < 1e-6));
    assert!(varmap.all_vars().is_empty());
    Ok(())
}

#[test]
fn invalid_checkpoints_fail_at_construction() -> Result<()> {
    for k in [vec![0, 5], vec![1, 6], vec![0, 3, 3, 6], vec![0, 5, 6]] {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(
            DepthEncoder::new(small_config(6, k.clone()), vb).is_err(),
            "k={k:?}"
        );
        assert!(varmap.all_vars().is_empty(), "k={k:?} allocated parameters");
    }
    Ok(())
}

#[test]
fn history_loss_is_zero_at_initialisation() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let encoder = DepthEncoder::new(small_config(4, vec![0, 2, 4]), vb)?;
    let loss = encoder
        .history_loss()?
        .map(|loss| loss.to_vec0::<f32>())
        .transpose()?
        .expect("dense encoder exposes a history loss");
    assert!(loss.abs() < 1e-10);
    Ok(())
}

#[test]
fn parameters_round_trip_through_safetensors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("encoder.safetensors");
    let config = small_config(4, vec![0, 2, 4]);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let mut trained = DepthEncoder::new(config.clone(), vb)?;
    varmap.save(&path)?;

    let tensors = candle_core::safetensors::load(&path, &Device::Cpu)?;
    assert!(tensors.contains_key("encoder.history.weight"));
    assert!(tensors.contains_key("encoder.history.layer_norms.1.bias"));
    assert!(!tensors.contains_key("encoder.history.layer_norms.2.bias"));
    assert!(tensors.contains_key("encoder.layer_norm.weight"));
    assert_eq!(tensors.len(), 4 * 13 + 1 + 2 * 2 + 2);

    let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
    let mut restored = DepthEncoder::new(config, vb)?;

    let input = Tensor::randn(0f32, 1.0, (1, 6, 8), &Device::Cpu)?;
    let a = trained.forward(&input, None, false)?.hidden;
    let b = restored.forward(&input, None, false)?.hidden;
    let diff = a.sub(&b)?.abs()?.max_all()?.to_vec0::<f32>()?;
    assert!(diff < 1e-6);
    Ok(())
}

#[test]
fn padding_mask_and_reorder() -> Result<()> {
    let device = Device::Cpu;
    let tokens = Tensor::new(&[[5u32, 6, 1], [7, 8, 9]], &device)?;
    let mask = padding_mask(&tokens, 1)?;
    assert!(mask.is_some());
    assert!(padding_mask(&tokens, 0)?.is_none());

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mut encoder = DepthEncoder::new(small_config(2, vec![0, 2]), vb)?;
    let input = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
    let output = encoder.forward(&input, mask.as_ref(), false)?;

    let order = Tensor::new(&[1u32, 0], &device)?;
    let reordered = output.reorder(&order)?;
    let first = reordered.hidden.get(0)?.flatten_all()?.to_vec1::<f32>()?;
    let second = output.hidden.get(1)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(first, second);
    let mask_rows = reordered
        .padding_mask
        .map(|m| m.to_vec2::<u8>())
        .transpose()?;
    assert_eq!(mask_rows, Some(vec![vec![0, 0, 0], vec![0, 0, 1]]));
    Ok(())
}

#[test]
fn config_file_drives_encoder_construction() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("encoder.toml");
    std::fs::write(
        &path,
        r#"
embed_dim = 8
ffn_embed_dim = 16
attention_heads = 2
layers = 6
normalize_before = false

[history]
history_type = "learnable_dense"
k = [0, 2, 6]
"#,
    )?;
    let config = EncoderConfig::from_path(&path)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let mut encoder = DepthEncoder::new(config, vb)?;
    let input = Tensor::randn(0f32, 1.0, (1, 4, 8), &Device::Cpu)?;
    assert_eq!(encoder.forward(&input, None, true)?.hidden.dims(), &[1, 4, 8]);

    std::fs::write(&path, "embed_dim = 8\nffn_embed_dim = 16\nattention_heads = 3\nlayers = 2\n")?;
    assert!(EncoderConfig::from_path(&path).is_err());
    Ok(())
}
