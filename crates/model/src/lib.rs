//! Selective-depth transformer encoder with a learnable dense layer history.
//!
//! [`DepthEncoder`] runs `L` layer positions and, at the positions listed in
//! the checkpoint list `k`, replaces the carried representation with a
//! learned combination of earlier checkpoint outputs kept by
//! [`LayerHistory`]. Without history the encoder is a plain residual stack.

pub mod attention;
pub mod block;
pub mod config;
pub mod encoder;
pub mod history;
pub mod presets;
pub mod schedule;

pub use block::{EncoderLayer, LayerBlock, LayerOutput};
pub use config::{
    checkpoint_violations, AttentionKind, ConfigError, EncoderConfig, HistoryConfig, HistoryType,
    IntegrationType, Precision,
};
pub use encoder::{padding_mask, DepthEncoder, EncoderOutput, STACK_PREFIX};
pub use history::{LayerHistory, NormalizationBank};
pub use presets::{preset_by_name, preset_for_depth, DepthPreset, PRESETS};
pub use schedule::{CheckpointSchedule, LayerStep};
