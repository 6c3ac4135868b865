//! Snapshot directories: `model.safetensors` plus a `manifest.json` holding
//! the depth metadata and a SHA-256 record of the weights file.
//!
//! Saving stages both files in a temporary directory next to the target and
//! renames it into place, so a crash never leaves a half-written snapshot at
//! the output path.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use hex::encode as hex_encode;
use model::STACK_PREFIX;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    errors::{ExpansionError, Result},
    key::ParamKey,
};

pub const SNAPSHOT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";

/// Depth metadata; unknown fields are preserved across expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub encoder_layers: usize,
    #[serde(default)]
    pub k: Vec<usize>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SnapshotMetadata {
    pub fn new(encoder_layers: usize, k: Vec<usize>) -> Self {
        Self {
            encoder_layers,
            k,
            extra: serde_json::Map::new(),
        }
    }

    /// Declared depth of `stack`: `encoder_layers` for the encoder, an
    /// optional `<stack>_layers` field for any other stack.
    pub fn stack_layers(&self, stack: &str) -> Option<usize> {
        if stack == STACK_PREFIX {
            return Some(self.encoder_layers);
        }
        self.extra
            .get(&stack_layers_field(stack))
            .and_then(serde_json::Value::as_u64)
            .map(|layers| layers as usize)
    }

    pub fn set_stack_layers(&mut self, stack: &str, layers: usize) {
        if stack == STACK_PREFIX {
            self.encoder_layers = layers;
        } else {
            self.extra
                .insert(stack_layers_field(stack), serde_json::Value::from(layers));
        }
    }
}

fn stack_layers_field(stack: &str) -> String {
    format!("{stack}_layers")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub model: FileRecord,
    pub metadata: SnapshotMetadata,
}

/// Named tensors plus depth metadata.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tensors: BTreeMap<String, Tensor>,
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    pub fn new(tensors: BTreeMap<String, Tensor>, metadata: SnapshotMetadata) -> Self {
        Self { tensors, metadata }
    }

    /// Captures every variable of a trained model.
    pub fn from_varmap(varmap: &VarMap, metadata: SnapshotMetadata) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("variable map mutex poisoned".into()))?;
        let tensors = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        Ok(Self { tensors, metadata })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    /// Layer positions present for `stack`.
    pub fn layer_positions(&self, stack: &str) -> BTreeSet<usize> {
        self.tensors
            .keys()
            .filter_map(|raw| match ParamKey::parse(raw) {
                ParamKey::Layer {
                    stack: key_stack,
                    position,
                    ..
                } if key_stack == stack => Some(position),
                _ => None,
            })
            .collect()
    }

    /// Tensors keyed for [`candle_core::safetensors::save`] or
    /// `VarBuilder::from_tensors`.
    pub fn to_hash_map(&self) -> HashMap<String, Tensor> {
        self.tensors
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.clone()))
            .collect()
    }

    pub fn load(directory: &Path, device: &Device) -> Result<Self> {
        let manifest = load_manifest(directory)?;
        if manifest.version != SNAPSHOT_VERSION {
            return Err(ExpansionError::snapshot(
                directory,
                format!(
                    "unsupported snapshot version {} (expected {})",
                    manifest.version, SNAPSHOT_VERSION
                ),
            ));
        }

        let model_path = directory.join(&manifest.model.filename);
        validate_file(&model_path, &manifest.model.sha256)?;
        let tensors = candle_core::safetensors::load(&model_path, device)
            .map_err(|err| ExpansionError::snapshot(&model_path, err.to_string()))?
            .into_iter()
            .collect();
        Ok(Self {
            tensors,
            metadata: manifest.metadata,
        })
    }

    /// Writes the snapshot to `directory`. An existing directory is replaced
    /// only when `overwrite` is set.
    pub fn save(&self, directory: &Path, overwrite: bool) -> Result<SnapshotManifest> {
        if directory.exists() && !overwrite {
            return Err(ExpansionError::OutputExists(directory.to_path_buf()));
        }
        let parent = match directory.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(ExpansionError::io(&parent))?;

        let staging = tempfile::Builder::new()
            .prefix(".snapshot-staging-")
            .tempdir_in(&parent)
            .map_err(ExpansionError::io(&parent))?;

        let model_path = staging.path().join(MODEL_FILENAME);
        candle_core::safetensors::save(&self.to_hash_map(), &model_path)?;
        let manifest = SnapshotManifest {
            version: SNAPSHOT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            model: file_record(&model_path)?,
            metadata: self.metadata.clone(),
        };
        write_json(&staging.path().join(MANIFEST_FILENAME), &manifest)?;

        let staged = staging.into_path();
        if let Err(err) = publish(&staged, directory, &parent) {
            if let Err(cleanup) = fs::remove_dir_all(&staged) {
                log::warn!("snapshot staging cleanup failed path={} error={}", staged.display(), cleanup);
            }
            return Err(err);
        }

        log::info!(
            "snapshot published path={} tensors={} encoder_layers={}",
            directory.display(),
            self.tensors.len(),
            self.metadata.encoder_layers
        );
        Ok(manifest)
    }
}

/// Renames `staged` to `directory`. A previous snapshot at `directory` is
/// moved aside first, restored if the rename fails and removed once the new
/// one is in place.
fn publish(staged: &Path, directory: &Path, parent: &Path) -> Result<()> {
    let previous = if directory.exists() {
        let holding = tempfile::Builder::new()
            .prefix(".snapshot-replaced-")
            .tempdir_in(parent)
            .map_err(ExpansionError::io(parent))?;
        let moved = holding.path().join("previous");
        fs::rename(directory, &moved).map_err(ExpansionError::io(directory))?;
        Some((holding, moved))
    } else {
        None
    };

    if let Err(err) = fs::rename(staged, directory) {
        if let Some((holding, moved)) = previous {
            if let Err(restore) = fs::rename(&moved, directory) {
                let kept = holding.into_path();
                log::error!(
                    "snapshot restore failed, previous snapshot kept in {} error={}",
                    kept.display(),
                    restore
                );
            }
        }
        return Err(ExpansionError::Io {
            path: directory.to_path_buf(),
            source: err,
        });
    }

    if let Some((holding, _)) = previous {
        let path = holding.path().to_path_buf();
        if let Err(err) = holding.close() {
            log::warn!("snapshot cleanup of replaced output failed path={} error={}", path.display(), err);
        }
    }
    Ok(())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord> {
    let sha256 = sha256_file(path)?;
    let bytes = path.metadata().map_err(ExpansionError::io(path))?.len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ExpansionError::snapshot(path, "file name is not valid UTF-8"))?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn load_manifest(directory: &Path) -> Result<SnapshotManifest> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(ExpansionError::snapshot(
            directory,
            format!("manifest not found at {}", manifest_path.display()),
        ));
    }
    read_json(&manifest_path)
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(ExpansionError::snapshot(path, "failed checksum validation"));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(ExpansionError::io(path))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(ExpansionError::io(path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(|source| ExpansionError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let mut file = File::create(path).map_err(ExpansionError::io(path))?;
    file.write_all(&data).map_err(ExpansionError::io(path))?;
    file.write_all(b"\n").map_err(ExpansionError::io(path))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(ExpansionError::io(path))?;
    serde_json::from_reader(file).map_err(|source| ExpansionError::Json {
        path: path.to_path_buf(),
        source,
    })
}
