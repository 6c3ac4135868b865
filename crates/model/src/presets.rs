//! Named depth layouts for tensor2tensor-style dense-history encoders.
//!
//! Every preset pairs a layer count with the checkpoint list that was used to
//! train it. Presets share the base dimensions (512 hidden, 2048 FFN, 8
//! heads), pre-norm layers, 0.1 dropouts and clipped relative attention.

use crate::config::{AttentionKind, EncoderConfig, HistoryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthPreset {
    pub name: &'static str,
    pub layers: usize,
    pub k: &'static [usize],
}

impl DepthPreset {
    pub fn history(&self) -> HistoryConfig {
        HistoryConfig::dense(self.k.to_vec())
    }
}

pub const PRESETS: &[DepthPreset] = &[
    DepthPreset { name: "t2t-6l", layers: 6, k: &[0, 6] },
    DepthPreset { name: "t2t-8l", layers: 8, k: &[0, 8] },
    DepthPreset { name: "t2t-9l", layers: 9, k: &[0, 9] },
    DepthPreset { name: "t2t-12l", layers: 12, k: &[0, 6, 12] },
    DepthPreset { name: "t2t-15l", layers: 15, k: &[0, 6, 9, 12, 15] },
    DepthPreset { name: "t2t-16l", layers: 16, k: &[0, 8, 16] },
    DepthPreset { name: "t2t-18l", layers: 18, k: &[0, 6, 12, 18] },
    DepthPreset { name: "t2t-21l", layers: 21, k: &[0, 6, 12, 21] },
    DepthPreset { name: "t2t-24l", layers: 24, k: &[0, 6, 12, 18, 24] },
    DepthPreset { name: "t2t-27l", layers: 27, k: &[0, 9, 18, 27] },
    DepthPreset { name: "t2t-30l", layers: 30, k: &[0, 6, 12, 18, 24, 30] },
    DepthPreset { name: "t2t-33l", layers: 33, k: &[0, 6, 12, 21, 33] },
    DepthPreset { name: "t2t-36l", layers: 36, k: &[0, 6, 12, 18, 24, 30, 36] },
    DepthPreset {
        name: "t2t-39l",
        layers: 39,
        k: &[0, 6, 9, 12, 15, 18, 21, 24, 27, 30, 33, 36, 39],
    },
    DepthPreset { name: "t2t-42l", layers: 42, k: &[0, 6, 12, 18, 24, 30, 36, 42] },
    DepthPreset {
        name: "t2t-45l",
        layers: 45,
        k: &[0, 6, 9, 12, 15, 18, 21, 24, 27, 30, 33, 36, 39, 42, 45],
    },
    DepthPreset { name: "t2t-48l", layers: 48, k: &[0, 6, 12, 18, 24, 30, 36, 42, 48] },
    DepthPreset {
        name: "t2t-54l",
        layers: 54,
        k: &[0, 6, 12, 18, 24, 30, 36, 42, 48, 54],
    },
    DepthPreset {
        name: "t2t-60l",
        layers: 60,
        k: &[0, 6, 12, 18, 24, 30, 36, 42, 48, 54, 60],
    },
    DepthPreset { name: "t2t-63l", layers: 63, k: &[0, 9, 18, 27, 36, 45, 54, 63] },
    DepthPreset {
        name: "t2t-66l",
        layers: 66,
        k: &[0, 6, 12, 18, 24, 30, 36, 42, 48, 54, 60, 66],
    },
    DepthPreset {
        name: "t2t-72l",
        layers: 72,
        k: &[0, 6, 12, 18, 24, 30, 36, 42, 48, 54, 60, 66, 72],
    },
    DepthPreset {
        name: "t2t-96l",
        layers: 96,
        k: &[0, 6, 12, 18, 24, 30, 36, 42, 48, 96],
    },
];

pub fn preset_for_depth(layers: usize) -> Option<&'static DepthPreset> {
    PRESETS.iter().find(|preset| preset.layers == layers)
}

pub fn preset_by_name(name: &str) -> Option<&'static DepthPreset> {
    PRESETS.iter().find(|preset| preset.name == name)
}

impl EncoderConfig {
    /// Base-size pre-norm relative encoder laid out by `preset`.
    pub fn t2t(preset: &DepthPreset) -> Self {
        let mut config = EncoderConfig::new(512, 2048, 8, preset.layers)
            .with_normalize_before(true)
            .with_attention(AttentionKind::Relative {
                max_relative_length: 8,
                k_only: true,
            })
            .with_history(preset.history());
        config.dropout = 0.1;
        config.attention_dropout = 0.1;
        config.relu_dropout = 0.1;
        config
    }

    /// Keeps dimensions and dropouts, replacing depth and checkpoints.
    pub fn with_preset(mut self, preset: &DepthPreset) -> Self {
        self.layers = preset.layers;
        self.history = preset.history();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::checkpoint_violations;

    #[test]
    fn every_preset_is_a_valid_layout() {
        for preset in PRESETS {
            let violations = checkpoint_violations(preset.k, preset.layers);
            assert!(violations.is_empty(), "{}: {violations:?}", preset.name);
            assert!(EncoderConfig::t2t(preset).validate().is_ok(), "{}", preset.name);
        }
    }

    #[test]
    fn lookup_by_depth_and_name() {
        let preset = preset_for_depth(24).expect("24 layer preset");
        assert_eq!(preset.k, &[0, 6, 12, 18, 24]);
        assert_eq!(preset_by_name("t2t-24l"), Some(preset));
        assert!(preset_for_depth(7).is_none());
    }

    #[test]
    fn with_preset_keeps_dimensions() {
        let preset = preset_for_depth(12).expect("12 layer preset");
        let config = EncoderConfig::new(16, 32, 2, 6).with_preset(preset);
        assert_eq!(config.embed_dim, 16);
        assert_eq!(config.layers, 12);
        assert_eq!(config.history.k, vec![0, 6, 12]);
    }
}
