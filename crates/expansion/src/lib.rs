//! Offline depth expansion of trained encoder snapshots.
//!
//! A shallow snapshot is grown into a deeper one by cloning and re-indexing
//! per-layer parameters (and, for the strategies that add a checkpoint
//! interval, the history normalisation and weight parameters). The output
//! loads into a [`model::DepthEncoder`] configured with the new depth.

pub mod errors;
pub mod key;
pub mod snapshot;
pub mod strategy;

use std::path::Path;

use candle_core::Device;

pub use errors::{ExpansionError, Result};
pub use key::ParamKey;
pub use snapshot::{FileRecord, Snapshot, SnapshotManifest, SnapshotMetadata, SNAPSHOT_VERSION};
pub use strategy::{expand, history_mismatches, ExpansionParams, ExpansionStrategy};

/// Loads `input`, expands it and publishes the result at `output`.
pub fn run_expansion(
    input: &Path,
    output: &Path,
    params: &ExpansionParams,
    overwrite: bool,
    device: &Device,
) -> Result<SnapshotManifest> {
    if output.exists() && !overwrite {
        return Err(ExpansionError::OutputExists(output.to_path_buf()));
    }
    let source = Snapshot::load(input, device)?;
    let expanded = expand(&source, params)?;
    expanded.save(output, overwrite)
}
