//! Typed view of dotted parameter names.
//!
//! ```text
//! <stack>.layers.<position>.<param...>
//! <stack>.history.layer_norms.<slot>.<param...>
//! <stack>.history.weight
//! ```
//!
//! Anything else is [`ParamKey::Other`] and is carried through expansion
//! untouched.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKey {
    Layer {
        stack: String,
        position: usize,
        param: String,
    },
    HistoryNorm {
        stack: String,
        slot: usize,
        param: String,
    },
    HistoryWeight {
        stack: String,
    },
    Other(String),
}

impl ParamKey {
    pub fn parse(raw: &str) -> Self {
        let parts = raw.split('.').collect::<Vec<_>>();
        match parts.as_slice() {
            [stack, "layers", position, param @ ..] if !param.is_empty() => {
                match position.parse::<usize>() {
                    Ok(position) => ParamKey::Layer {
                        stack: stack.to_string(),
                        position,
                        param: param.join("."),
                    },
                    Err(_) => ParamKey::Other(raw.to_string()),
                }
            }
            [stack, "history", "layer_norms", slot, param @ ..] if !param.is_empty() => {
                match slot.parse::<usize>() {
                    Ok(slot) => ParamKey::HistoryNorm {
                        stack: stack.to_string(),
                        slot,
                        param: param.join("."),
                    },
                    Err(_) => ParamKey::Other(raw.to_string()),
                }
            }
            [stack, "history", "weight"] => ParamKey::HistoryWeight {
                stack: stack.to_string(),
            },
            _ => ParamKey::Other(raw.to_string()),
        }
    }

    /// Stack the key belongs to; `None` for unrecognised keys.
    pub fn stack(&self) -> Option<&str> {
        match self {
            ParamKey::Layer { stack, .. }
            | ParamKey::HistoryNorm { stack, .. }
            | ParamKey::HistoryWeight { stack } => Some(stack.as_str()),
            ParamKey::Other(_) => None,
        }
    }

    /// Unparsed keys that still mention `layers` or `history`; usually a
    /// sign that a snapshot uses a grammar the expander does not know.
    pub fn looks_layer_like(&self) -> bool {
        match self {
            ParamKey::Other(raw) => raw
                .split('.')
                .any(|part| part == "layers" || part == "history"),
            _ => false,
        }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKey::Layer {
                stack,
                position,
                param,
            } => write!(f, "{stack}.layers.{position}.{param}"),
            ParamKey::HistoryNorm { stack, slot, param } => {
                write!(f, "{stack}.history.layer_norms.{slot}.{param}")
            }
            ParamKey::HistoryWeight { stack } => write!(f, "{stack}.history.weight"),
            ParamKey::Other(raw) => f.write_str(raw),
        }
    }
}
