// ============================================================================
// CHECKPOINTS - bincode snapshots per step, JSON index, scoped restore
// ============================================================================

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CheckpointError;
use crate::params::ParamStore;
use crate::tensor::Graph;

pub const INDEX_FILE: &str = "checkpoint.json";
const FORMAT_VERSION: &str = "1";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CheckpointIndex {
    /// Retained steps, oldest save first.
    pub steps: Vec<u64>,
    pub latest: Option<u64>,
    pub max_to_keep: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredParam {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub timestamp: String,
    pub step: u64,
    pub scopes: BTreeMap<String, BTreeMap<String, StoredParam>>,
}

pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
}

fn snapshot_name(step: u64) -> String { format!("ckpt-{}.bin", step) }

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> Self {
        CheckpointManager { dir: dir.into(), max_to_keep: max_to_keep.max(1) }
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn snapshot_path(&self, step: u64) -> PathBuf { self.dir.join(snapshot_name(step)) }

    /// `None` when the directory holds no index yet.
    pub fn read_index(&self) -> Result<Option<CheckpointIndex>, CheckpointError> {
        let path = self.dir.join(INDEX_FILE);
        if !path.exists() { return Ok(None); }
        let text = fs::read_to_string(&path).map_err(|e| CheckpointError::io(&path, e))?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn write_index(&self, index: &CheckpointIndex) -> Result<(), CheckpointError> {
        let path = self.dir.join(INDEX_FILE);
        let json = serde_json::to_string_pretty(index)?;
        fs::write(&path, json).map_err(|e| CheckpointError::io(&path, e))
    }

    pub fn latest_step(&self) -> Result<Option<u64>, CheckpointError> {
        Ok(self.read_index()?.and_then(|i| i.latest))
    }

    /// Writes every registered parameter at `step`, then evicts the oldest snapshots beyond the bound.
    pub fn save(&self, step: u64, store: &ParamStore, g: &Graph) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(&self.dir).map_err(|e| CheckpointError::io(&self.dir, e))?;

        let mut scopes = BTreeMap::new();
        for scope in store.scopes() {
            let params: BTreeMap<String, StoredParam> = store.scope(scope).iter()
                .map(|(name, id)| {
                    let (rows, cols) = g.shape(*id);
                    (name.clone(), StoredParam { rows, cols, data: g.data(*id).to_vec() })
                })
                .collect();
            scopes.insert(scope.to_string(), params);
        }
        let snapshot = Snapshot {
            version: FORMAT_VERSION.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            step,
            scopes,
        };
        let bytes = bincode::serialize(&snapshot)?;
        let path = self.snapshot_path(step);
        fs::write(&path, &bytes).map_err(|e| CheckpointError::io(&path, e))?;

        let mut index = self.read_index()?.unwrap_or_default();
        index.steps.retain(|&s| s != step);
        index.steps.push(step);
        index.latest = Some(step);
        index.max_to_keep = self.max_to_keep;
        while index.steps.len() > self.max_to_keep {
            let old = index.steps.remove(0);
            let old_path = self.snapshot_path(old);
            if old_path.exists() {
                fs::remove_file(&old_path).map_err(|e| CheckpointError::io(&old_path, e))?;
            }
            debug!(step = old, "evicted checkpoint");
        }
        self.write_index(&index)?;

        info!(step, path = %path.display(), bytes = bytes.len(), "saved checkpoint");
        Ok(path)
    }

    pub fn load_snapshot(&self, step: u64) -> Result<Snapshot, CheckpointError> {
        let path = self.snapshot_path(step);
        if !path.exists() {
            return Err(CheckpointError::NotFound { dir: self.dir.clone() });
        }
        let bytes = fs::read(&path).map_err(|e| CheckpointError::io(&path, e))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Overwrites the parameters of `scope` with the latest snapshot. Other scopes are untouched.
    pub fn restore(&self, scope: &str, store: &ParamStore, g: &mut Graph) -> Result<u64, CheckpointError> {
        let params = store.scope(scope);
        if params.is_empty() {
            return Err(CheckpointError::EmptyScope { scope: scope.to_string() });
        }
        let Some(step) = self.latest_step()? else {
            warn!(dir = %self.dir.display(), "no checkpoint found");
            return Err(CheckpointError::NotFound { dir: self.dir.clone() });
        };
        let snapshot = self.load_snapshot(step)?;
        let stored = snapshot.scopes.get(scope);
        if stored.is_none() {
            warn!(scope, step, "scope missing from checkpoint");
        }

        // Validate everything before writing anything.
        let mut updates = Vec::with_capacity(params.len());
        for (name, id) in params {
            let sp = stored.and_then(|s| s.get(name)).ok_or_else(|| CheckpointError::MissingParameter {
                step,
                scope: scope.to_string(),
                name: name.clone(),
            })?;
            let expected = g.shape(*id);
            if (sp.rows, sp.cols) != expected || sp.data.len() != sp.rows * sp.cols {
                return Err(CheckpointError::ShapeMismatch {
                    scope: scope.to_string(),
                    name: name.clone(),
                    expected,
                    actual: (sp.rows, sp.cols),
                });
            }
            updates.push((*id, sp));
        }
        for (id, sp) in updates {
            g.data_mut(id).copy_from_slice(&sp.data);
        }

        info!(scope, step, params = params.len(), "restored scope");
        Ok(step)
    }
}
