use std::{fs, io, path::Path};

use candle_core::DType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether the encoder keeps a dense layer history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryType {
    /// Plain residual stack.
    #[default]
    None,
    /// Learnable lower-triangular combination of checkpoint outputs.
    LearnableDense,
}

/// How the weighted sum over the ledger is scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    /// `Σ w[n-1, j] * ledger[j]`.
    #[default]
    Sum,
    /// The weighted sum divided by the number of ledger entries.
    Avg,
}

/// Self-attention flavour used by every encoder layer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttentionKind {
    #[default]
    Standard,
    /// Clipped relative position representations.
    Relative {
        max_relative_length: usize,
        /// Only keys receive relative embeddings when set.
        #[serde(default = "default_k_only")]
        k_only: bool,
    },
}

fn default_k_only() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub history_type: HistoryType,
    #[serde(default)]
    pub integration_type: IntegrationType,
    /// Checkpoint positions; `k[0] == 0` and `k[last] == layers`.
    #[serde(default)]
    pub k: Vec<usize>,
}

impl HistoryConfig {
    pub fn dense(k: Vec<usize>) -> Self {
        Self {
            history_type: HistoryType::LearnableDense,
            integration_type: IntegrationType::Sum,
            k,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.history_type == HistoryType::LearnableDense
    }
}

/// Parameter storage precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F16,
    Bf16,
    F64,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::F64 => DType::F64,
        }
    }
}

/// Configuration for a [`crate::DepthEncoder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub embed_dim: usize,
    pub ffn_embed_dim: usize,
    pub attention_heads: usize,
    /// Number of layer positions `L`.
    pub layers: usize,
    #[serde(default)]
    pub normalize_before: bool,
    #[serde(default)]
    pub dropout: f32,
    #[serde(default)]
    pub attention_dropout: f32,
    #[serde(default)]
    pub relu_dropout: f32,
    #[serde(default)]
    pub attention: AttentionKind,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub precision: Precision,
}

impl EncoderConfig {
    /// Post-norm encoder without history or dropout.
    pub fn new(embed_dim: usize, ffn_embed_dim: usize, attention_heads: usize, layers: usize) -> Self {
        Self {
            embed_dim,
            ffn_embed_dim,
            attention_heads,
            layers,
            normalize_before: false,
            dropout: 0.0,
            attention_dropout: 0.0,
            relu_dropout: 0.0,
            attention: AttentionKind::Standard,
            history: HistoryConfig::default(),
            precision: Precision::F32,
        }
    }

    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }

    pub fn with_attention(mut self, attention: AttentionKind) -> Self {
        self.attention = attention;
        self
    }

    pub fn with_normalize_before(mut self, normalize_before: bool) -> Self {
        self.normalize_before = normalize_before;
        self
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: EncoderConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ConfigError::Format(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.attention_heads.max(1)
    }

    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }

    /// Checks every structural rule and reports all violations at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.embed_dim == 0 {
            errors.push("embed_dim must be greater than 0".to_string());
        }
        if self.ffn_embed_dim == 0 {
            errors.push("ffn_embed_dim must be greater than 0".to_string());
        }
        if self.attention_heads == 0 {
            errors.push("attention_heads must be greater than 0".to_string());
        } else if self.embed_dim % self.attention_heads != 0 {
            errors.push(format!(
                "embed_dim ({}) must be divisible by attention_heads ({})",
                self.embed_dim, self.attention_heads
            ));
        }
        if self.layers == 0 {
            errors.push("layers must be greater than 0".to_string());
        }

        for (name, p) in [
            ("dropout", self.dropout),
            ("attention_dropout", self.attention_dropout),
            ("relu_dropout", self.relu_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                errors.push(format!("{name} must be in [0, 1)"));
            }
        }

        if let AttentionKind::Relative {
            max_relative_length,
            ..
        } = self.attention
        {
            if max_relative_length == 0 {
                errors.push("attention.max_relative_length must be at least 1".to_string());
            }
        }

        if self.history.is_enabled() {
            errors.extend(checkpoint_violations(&self.history.k, self.layers));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// Lists every way `k` fails to describe a checkpoint layout over `layers`
/// positions. Empty when the list is usable.
///
/// Intervals shorter than two layers are rejected: a checkpoint position
/// never records its own output, so a one-layer interval would drop it.
pub fn checkpoint_violations(k: &[usize], layers: usize) -> Vec<String> {
    let mut errors = Vec::new();
    let (Some(&first), Some(&last)) = (k.first(), k.last()) else {
        errors.push("history.k must not be empty".to_string());
        return errors;
    };
    if k.len() < 2 {
        errors.push("history.k needs at least two entries".to_string());
    }
    if first != 0 {
        errors.push(format!("history.k must start at 0, found {first}"));
    }
    if last != layers {
        errors.push(format!(
            "history.k must end at the layer count {layers}, found {last}"
        ));
    }
    for pair in k.windows(2) {
        if pair[1] <= pair[0] {
            errors.push(format!(
                "history.k must be strictly increasing ({} then {})",
                pair[0], pair[1]
            ));
        } else if pair[1] - pair[0] < 2 {
            errors.push(format!(
                "history.k interval [{}, {}) spans fewer than two layers",
                pair[0], pair[1]
            ));
        }
    }
    errors
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Format(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        ConfigError::Format(value.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        ConfigError::Format(value.to_string())
    }
}

impl From<ConfigError> for candle_core::Error {
    fn from(value: ConfigError) -> Self {
        candle_core::Error::Msg(value.to_string())
    }
}
