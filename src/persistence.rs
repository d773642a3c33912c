//! Durable state for specs and artifacts.
//!
//! State lives in a directory: `specs.json` holds the registered specs,
//! and `artifacts/spec_{id}.json` holds each spec's current artifact
//! together with its refresh record. Artifacts are whole-replaced on
//! every refresh, so snapshot files are the natural persistence unit;
//! there is no log to replay. Every write goes to a temp file first and
//! is renamed into place, so a crash mid-write leaves the prior state
//! intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CuboidError, Result};
use crate::registry::{AggregateSpec, SpecId, SpecRegistry};
use crate::store::{MaterializedArtifact, MaterializedStore, RefreshRecord};

const SPECS_FILE: &str = "specs.json";
const ARTIFACTS_DIR: &str = "artifacts";

#[derive(Serialize, Deserialize)]
struct SpecsFile {
    specs: Vec<SpecEntry>,
}

#[derive(Serialize, Deserialize)]
struct SpecEntry {
    id: SpecId,
    spec: AggregateSpec,
}

#[derive(Serialize, Deserialize)]
struct ArtifactFile {
    artifact: MaterializedArtifact,
    record: RefreshRecord,
}

/// File-backed persistence for registry and store state.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open (creating if needed) a state directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(ARTIFACTS_DIR))?;
        Ok(Self { dir })
    }

    /// The directory this store writes into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist the full spec registry.
    pub fn save_specs(&self, registry: &SpecRegistry) -> Result<()> {
        let file = SpecsFile {
            specs: registry
                .snapshot()
                .into_iter()
                .map(|(id, spec)| SpecEntry { id, spec })
                .collect(),
        };
        self.write_json(&self.dir.join(SPECS_FILE), &file)?;
        debug!(count = file.specs.len(), "persisted spec registry");
        Ok(())
    }

    /// Load persisted specs into a registry. A missing file is an empty
    /// registry, not an error.
    pub fn load_specs(&self, registry: &SpecRegistry) -> Result<usize> {
        let path = self.dir.join(SPECS_FILE);
        if !path.exists() {
            return Ok(0);
        }
        let file: SpecsFile = serde_json::from_str(&fs::read_to_string(&path)?)?;
        let count = file.specs.len();
        registry.restore(
            file.specs
                .into_iter()
                .map(|entry| (entry.id, entry.spec))
                .collect(),
        )?;
        Ok(count)
    }

    /// Persist one spec's current artifact and refresh record.
    pub fn save_artifact(
        &self,
        artifact: &MaterializedArtifact,
        record: &RefreshRecord,
    ) -> Result<()> {
        let file = ArtifactFile {
            artifact: artifact.clone(),
            record: record.clone(),
        };
        self.write_json(&self.artifact_path(artifact.spec_id), &file)?;
        debug!(spec = %artifact.spec_id, version = artifact.version, "persisted artifact");
        Ok(())
    }

    /// Delete a retired spec's artifact file, if present.
    pub fn remove_artifact(&self, id: SpecId) -> Result<()> {
        let path = self.artifact_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Load every persisted artifact into a store. Returns the spec ids
    /// restored. A file for a spec the registry no longer knows is left
    /// to the caller to reconcile.
    pub fn load_artifacts(&self, store: &MaterializedStore) -> Result<Vec<SpecId>> {
        let dir = self.dir.join(ARTIFACTS_DIR);
        let mut restored = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file: ArtifactFile =
                serde_json::from_str(&fs::read_to_string(&path)?).map_err(|e| {
                    CuboidError::serialization(format!(
                        "Corrupt artifact file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            restored.push(file.artifact.spec_id);
            store.restore(file.artifact, file.record);
        }
        restored.sort_unstable();
        if !restored.is_empty() {
            info!(count = restored.len(), "restored persisted artifacts");
        }
        Ok(restored)
    }

    fn artifact_path(&self, id: SpecId) -> PathBuf {
        self.dir
            .join(ARTIFACTS_DIR)
            .join(format!("spec_{}.json", id.0))
    }

    /// Write JSON atomically: temp file in the same directory, synced
    /// to disk, then renamed into place. The sync must precede the
    /// rename or a power loss can journal the rename ahead of the data
    /// and leave a truncated file under the final name.
    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
