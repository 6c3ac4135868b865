use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExpansionError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("snapshot {path} is unusable: {reason}")]
    Snapshot { path: PathBuf, reason: String },
    #[error("invalid depth delta {delta}: {reason}")]
    InvalidDelta { delta: usize, reason: String },
    #[error("unsupported depth: {0}")]
    UnsupportedDepth(String),
    #[error("stack '{stack}' has no layer parameters")]
    MissingLayers { stack: String },
    #[error("output {} already exists; pass --force to replace it", .0.display())]
    OutputExists(PathBuf),
}

impl ExpansionError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| ExpansionError::Io { path, source }
    }

    pub(crate) fn snapshot(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ExpansionError::Snapshot {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExpansionError>;
