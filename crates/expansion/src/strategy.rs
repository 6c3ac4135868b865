//! Depth expansion strategies.
//!
//! Each strategy is a pure function from a source snapshot to a new one.
//! Keys the parser does not recognise, and keys of other stacks, are copied
//! through unchanged.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use candle_core::Tensor;
use clap::ValueEnum;
use model::{checkpoint_violations, STACK_PREFIX};

use crate::{
    errors::{ExpansionError, Result},
    key::ParamKey,
    snapshot::Snapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExpansionStrategy {
    /// Clone every position `p` to `p + L` and every history slot `s` to
    /// `s + L`.
    DuplicateAll,
    /// Clone the top `delta` positions above the stack and add one history
    /// slot.
    #[default]
    StackOnTop,
    /// Clone the top position `delta` times and add one history slot.
    TopOnly,
    /// Expand position `p` into `2p` and `2p + 1`.
    Interleave,
}

impl fmt::Display for ExpansionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExpansionStrategy::DuplicateAll => "duplicate-all",
            ExpansionStrategy::StackOnTop => "stack-on-top",
            ExpansionStrategy::TopOnly => "top-only",
            ExpansionStrategy::Interleave => "interleave",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionParams {
    pub strategy: ExpansionStrategy,
    pub delta: usize,
    /// Stack prefix whose layers are expanded.
    pub stack: String,
    /// Replaces the output `k` when set.
    pub checkpoints: Option<Vec<usize>>,
}

impl ExpansionParams {
    pub fn new(strategy: ExpansionStrategy, delta: usize) -> Self {
        Self {
            strategy,
            delta,
            stack: STACK_PREFIX.to_string(),
            checkpoints: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Vec<usize>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }
}

/// Applies `params.strategy` to `snapshot`.
pub fn expand(snapshot: &Snapshot, params: &ExpansionParams) -> Result<Snapshot> {
    if params.delta == 0 {
        return Err(ExpansionError::InvalidDelta {
            delta: 0,
            reason: "depth increment must be positive".into(),
        });
    }

    let mut expanded = match params.strategy {
        ExpansionStrategy::DuplicateAll => duplicate_all(snapshot, &params.stack, params.delta)?,
        ExpansionStrategy::StackOnTop => stack_on_top(snapshot, &params.stack, params.delta)?,
        ExpansionStrategy::TopOnly => top_only(snapshot, &params.stack, params.delta)?,
        ExpansionStrategy::Interleave => interleave(snapshot, &params.stack, params.delta)?,
    };

    if let Some(checkpoints) = &params.checkpoints {
        expanded.metadata.k = checkpoints.clone();
    }
    if !expanded.metadata.k.is_empty() {
        for violation in checkpoint_violations(&expanded.metadata.k, expanded.metadata.encoder_layers) {
            log::warn!("expand output k={:?} will not load: {}", expanded.metadata.k, violation);
        }
    }
    for mismatch in history_mismatches(&expanded) {
        log::warn!("expand output history does not match k={:?}: {}", expanded.metadata.k, mismatch);
    }

    log::info!(
        "expand strategy={} stack={} layers={}->{} k={:?} tensors={}",
        params.strategy,
        params.stack,
        snapshot.layer_positions(&params.stack).len(),
        expanded.layer_positions(&params.stack).len(),
        expanded.metadata.k,
        expanded.len()
    );
    Ok(expanded)
}

/// Parameters of each layer position of `stack`, keyed by position.
type LayerGroups = BTreeMap<usize, Vec<(String, Tensor)>>;

/// Groups the layer parameters of `stack` and checks that positions run
/// exactly `0..L`, with `L` the stack's declared depth when the metadata has
/// one.
fn layer_groups(snapshot: &Snapshot, stack: &str) -> Result<LayerGroups> {
    let mut groups = LayerGroups::new();
    for (raw, tensor) in &snapshot.tensors {
        match ParamKey::parse(raw) {
            ParamKey::Layer {
                stack: key_stack,
                position,
                param,
            } if key_stack == stack => groups.entry(position).or_default().push((param, tensor.clone())),
            key if key.looks_layer_like() => {
                log::warn!("expand passthrough of unparsed layer-like key {}", raw);
            }
            _ => {}
        }
    }

    if groups.is_empty() {
        return Err(ExpansionError::MissingLayers {
            stack: stack.to_string(),
        });
    }
    let declared = snapshot.metadata.stack_layers(stack).unwrap_or(groups.len());
    if !groups.keys().copied().eq(0..declared) {
        return Err(ExpansionError::UnsupportedDepth(format!(
            "metadata declares {declared} layers but stack '{stack}' has positions {:?}",
            groups.keys().collect::<Vec<_>>()
        )));
    }

    let expected = groups.values().map(Vec::len).max().unwrap_or_default();
    for (position, params) in &groups {
        if params.len() != expected {
            log::warn!(
                "expand layer {} of '{}' has {} parameters, expected {}",
                position,
                stack,
                params.len(),
                expected
            );
        }
    }
    Ok(groups)
}

fn insert_layer(tensors: &mut BTreeMap<String, Tensor>, stack: &str, position: usize, param: &str, tensor: Tensor) {
    let key = ParamKey::Layer {
        stack: stack.to_string(),
        position,
        param: param.to_string(),
    };
    tensors.insert(key.to_string(), tensor);
}

fn require_doubling(delta: usize, layers: usize, strategy: ExpansionStrategy) -> Result<()> {
    if delta != layers {
        return Err(ExpansionError::InvalidDelta {
            delta,
            reason: format!("{strategy} doubles depth and needs delta == {layers}"),
        });
    }
    Ok(())
}

/// Every position `p` is cloned to `p + L`; history slot `s` to `s + L`.
///
/// `k` and the history weight are left as they were, so a dense encoder
/// snapshot comes out with slots its `k` does not use; [`expand`] reports
/// this.
pub fn duplicate_all(snapshot: &Snapshot, stack: &str, delta: usize) -> Result<Snapshot> {
    let groups = layer_groups(snapshot, stack)?;
    let layers = groups.len();
    require_doubling(delta, layers, ExpansionStrategy::DuplicateAll)?;

    let mut tensors = snapshot.tensors.clone();
    for (position, params) in &groups {
        for (param, tensor) in params {
            insert_layer(&mut tensors, stack, position + layers, param, tensor.copy()?);
        }
    }
    for (raw, tensor) in &snapshot.tensors {
        if let ParamKey::HistoryNorm {
            stack: key_stack,
            slot,
            param,
        } = ParamKey::parse(raw)
        {
            if key_stack == stack {
                let key = ParamKey::HistoryNorm {
                    stack: key_stack,
                    slot: slot + layers,
                    param,
                };
                tensors.insert(key.to_string(), tensor.copy()?);
            }
        }
    }

    let mut metadata = snapshot.metadata.clone();
    metadata.set_stack_layers(stack, layers * 2);
    Ok(Snapshot::new(tensors, metadata))
}

/// The top `delta` positions are cloned to `L..L + delta`, keeping their
/// relative order.
pub fn stack_on_top(snapshot: &Snapshot, stack: &str, delta: usize) -> Result<Snapshot> {
    let groups = layer_groups(snapshot, stack)?;
    let layers = groups.len();
    if delta > layers {
        return Err(ExpansionError::InvalidDelta {
            delta,
            reason: format!("stack-on-top can clone at most the {layers} existing layers"),
        });
    }

    let mut tensors = snapshot.tensors.clone();
    for position in (layers - delta..layers).rev() {
        let params = groups.get(&position).map(Vec::as_slice).unwrap_or_default();
        log::debug!("expand clone layer {} -> {}", position, position + delta);
        for (param, tensor) in params {
            insert_layer(&mut tensors, stack, position + delta, param, tensor.copy()?);
        }
    }

    finish_with_new_slot(snapshot, tensors, stack, layers + delta)
}

/// The top position is cloned `delta` times; every clone owns its storage.
pub fn top_only(snapshot: &Snapshot, stack: &str, delta: usize) -> Result<Snapshot> {
    let groups = layer_groups(snapshot, stack)?;
    let layers = groups.len();
    let top = groups.get(&(layers - 1)).map(Vec::as_slice).unwrap_or_default();

    let mut tensors = snapshot.tensors.clone();
    for offset in 0..delta {
        for (param, tensor) in top {
            insert_layer(&mut tensors, stack, layers + offset, param, tensor.copy()?);
        }
    }

    finish_with_new_slot(snapshot, tensors, stack, layers + delta)
}

/// Position `p` becomes `2p` (same storage) and `2p + 1` (copied).
pub fn interleave(snapshot: &Snapshot, stack: &str, delta: usize) -> Result<Snapshot> {
    let groups = layer_groups(snapshot, stack)?;
    let layers = groups.len();
    require_doubling(delta, layers, ExpansionStrategy::Interleave)?;

    let mut tensors = snapshot
        .tensors
        .iter()
        .filter(|(raw, _)| {
            !matches!(ParamKey::parse(raw), ParamKey::Layer { stack: key_stack, .. } if key_stack == stack)
        })
        .map(|(raw, tensor)| (raw.clone(), tensor.clone()))
        .collect::<BTreeMap<_, _>>();
    for (position, params) in &groups {
        for (param, tensor) in params {
            insert_layer(&mut tensors, stack, 2 * position, param, tensor.clone());
            insert_layer(&mut tensors, stack, 2 * position + 1, param, tensor.copy()?);
        }
    }

    let mut metadata = snapshot.metadata.clone();
    metadata.set_stack_layers(stack, layers * 2);
    Ok(Snapshot::new(tensors, metadata))
}

/// Shared tail of the strategies that add one checkpoint interval: copies
/// the last history norm slot into a new one, grows the history matrix and
/// appends the new depth to `k`. Only the encoder has a `k`; other stacks
/// just get their new depth.
fn finish_with_new_slot(
    snapshot: &Snapshot,
    mut tensors: BTreeMap<String, Tensor>,
    stack: &str,
    new_layers: usize,
) -> Result<Snapshot> {
    let mut metadata = snapshot.metadata.clone();
    metadata.set_stack_layers(stack, new_layers);
    if stack != STACK_PREFIX || metadata.k.is_empty() {
        return Ok(Snapshot::new(tensors, metadata));
    }
    if metadata.k.len() < 2 {
        return Err(ExpansionError::UnsupportedDepth(format!(
            "checkpoint list {:?} has no interval to extend",
            metadata.k
        )));
    }

    let source_slot = metadata.k.len() - 2;
    let new_slot = metadata.k.len() - 1;
    let mut cloned = 0;
    for (raw, tensor) in &snapshot.tensors {
        match ParamKey::parse(raw) {
            ParamKey::HistoryNorm {
                stack: key_stack,
                slot,
                param,
            } if key_stack == stack && slot == source_slot => {
                let key = ParamKey::HistoryNorm {
                    stack: key_stack,
                    slot: new_slot,
                    param,
                };
                tensors.insert(key.to_string(), tensor.copy()?);
                cloned += 1;
            }
            ParamKey::HistoryWeight { stack: key_stack } if key_stack == stack => {
                tensors.insert(raw.clone(), grow_history_weight(tensor)?);
            }
            _ => {}
        }
    }
    if cloned == 0 {
        log::warn!("expand found no '{}' history norm parameters in slot {}", stack, source_slot);
    }

    metadata.k.push(new_layers);
    Ok(Snapshot::new(tensors, metadata))
}

/// Ways the encoder history parameters of `snapshot` disagree with its `k`.
///
/// A loadable snapshot has norm slots `0..len(k) - 1` and a `len(k)` square
/// weight, or no history parameters at all when `k` is empty.
pub fn history_mismatches(snapshot: &Snapshot) -> Vec<String> {
    let mut slots = BTreeSet::new();
    let mut weight_dims = None;
    for (raw, tensor) in &snapshot.tensors {
        match ParamKey::parse(raw) {
            ParamKey::HistoryNorm { stack, slot, .. } if stack == STACK_PREFIX => {
                slots.insert(slot);
            }
            ParamKey::HistoryWeight { stack } if stack == STACK_PREFIX => {
                weight_dims = Some(tensor.dims().to_vec());
            }
            _ => {}
        }
    }

    let k = &snapshot.metadata.k;
    let mut mismatches = Vec::new();
    if k.is_empty() {
        if !slots.is_empty() || weight_dims.is_some() {
            mismatches.push("history parameters present for a residual stack".to_string());
        }
        return mismatches;
    }

    let expected_slots = (0..k.len() - 1).collect::<BTreeSet<_>>();
    if slots != expected_slots {
        mismatches.push(format!("history norm slots {slots:?}, expected {expected_slots:?}"));
    }
    match weight_dims {
        Some(dims) if dims == [k.len(), k.len()] => {}
        Some(dims) => mismatches.push(format!(
            "history weight is {dims:?}, expected [{0}, {0}]",
            k.len()
        )),
        None => mismatches.push("history weight missing".to_string()),
    }
    mismatches
}

/// `(n, n)` to `(n + 1, n + 1)`: old entries kept, new column zero, new row
/// the uniform average `1 / (n + 1)`.
pub fn grow_history_weight(weight: &Tensor) -> Result<Tensor> {
    let (rows, cols) = weight.dims2()?;
    if rows != cols {
        return Err(candle_core::Error::Msg(format!("history weight must be square, got {rows}x{cols}")).into());
    }
    let size = rows + 1;
    let column = Tensor::zeros((rows, 1), weight.dtype(), weight.device())?;
    let top = Tensor::cat(&[weight, &column], 1)?;
    let row = (Tensor::ones((1, size), weight.dtype(), weight.device())? / size as f64)?;
    Ok(Tensor::cat(&[&top, &row], 0)?)
}
