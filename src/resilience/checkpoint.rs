use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ResilienceError, ResilienceResult};

/// Append-only progress snapshot. `state_snapshot` is opaque to this crate;
/// each stage defines its own payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub project_id: String,
    pub stage: String,
    pub state_snapshot: serde_json::Value,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Unsaved record. The store assigns `id` and `created_at` on insert.
    pub fn new(
        project_id: impl Into<String>,
        stage: impl Into<String>,
        state_snapshot: serde_json::Value,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            project_id: project_id.into(),
            stage: stage.into(),
            state_snapshot,
            description: description.into(),
            created_at: Utc::now(),
        }
    }

    /// Give the record its per-project position. Stores call this while
    /// holding the project's write lock, so ids sort in commit order even if
    /// the wall clock steps backwards.
    pub fn stamp(&mut self, sequence: u64) {
        self.created_at = Utc::now();
        self.id = format!(
            "{:012}_{}_{}",
            sequence,
            self.created_at.format("%Y%m%dT%H%M%S%.9fZ"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
    }

    /// Position within the project, parsed from the id.
    pub fn sequence(&self) -> Option<u64> {
        sequence_of(&self.id)
    }

    /// Typed view of the snapshot for callers that know its shape.
    pub fn restore<T: DeserializeOwned>(&self) -> ResilienceResult<T> {
        serde_json::from_value(self.state_snapshot.clone()).map_err(|e| {
            ResilienceError::Checkpoint(format!(
                "Failed to restore {} snapshot {}: {}",
                self.stage, self.id, e
            ))
        })
    }
}

/// Persistence seam for checkpoints. Implementations must never drop a
/// record silently: every failure comes back as `ResilienceError::Checkpoint`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Stamp and persist `checkpoint`, returning the stored record. Inserts
    /// for one project are serialized; the last one stamped is the newest.
    async fn insert(&self, checkpoint: Checkpoint) -> ResilienceResult<Checkpoint>;

    async fn latest(&self, project_id: &str) -> ResilienceResult<Option<Checkpoint>>;

    /// Newest first.
    async fn list(&self, project_id: &str) -> ResilienceResult<Vec<Checkpoint>>;

    /// Delete all but the newest `keep` records, returning how many went.
    async fn prune(&self, project_id: &str, keep: usize) -> ResilienceResult<usize>;
}

fn sequence_of(id: &str) -> Option<u64> {
    id.split('_').next()?.parse().ok()
}

/// Percent-encodes everything outside `[A-Za-z0-9_-]` (and a leading dot),
/// so distinct project ids never share a directory.
fn project_dir_name(project_id: &str) -> String {
    if project_id.is_empty() {
        return "%".to_string();
    }
    let mut name = String::with_capacity(project_id.len());
    for (i, byte) in project_id.bytes().enumerate() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') || (byte == b'.' && i > 0) {
            name.push(char::from(byte));
        } else {
            let _ = write!(name, "%{byte:02X}");
        }
    }
    name
}

fn store_err(action: &str, target: &Path, err: impl std::fmt::Display) -> ResilienceError {
    ResilienceError::Checkpoint(format!("{} {}: {}", action, target.display(), err))
}

/// YAML files under `<root>/<project>/<id>.yaml`, written atomically
/// (temp file + rename). Writers for the same project are serialized.
pub struct FileCheckpointStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_dir_name(project_id))
    }

    fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Checkpoint ids in the project directory, newest first.
    async fn ids(&self, project_id: &str) -> ResilienceResult<Vec<String>> {
        let dir = self.project_dir(project_id);
        if !fs::try_exists(&dir)
            .await
            .map_err(|e| store_err("Failed to stat", &dir, e))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| store_err("Failed to read", &dir, e))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| store_err("Failed to read", &dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "yaml")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    async fn load(&self, project_id: &str, id: &str) -> ResilienceResult<Checkpoint> {
        let file = self.project_dir(project_id).join(format!("{id}.yaml"));
        let content = fs::read_to_string(&file)
            .await
            .map_err(|e| store_err("Failed to read", &file, e))?;
        serde_yaml_bw::from_str(&content).map_err(|e| store_err("Corrupt checkpoint", &file, e))
    }

    /// Records that really belong to `project_id`, newest first.
    async fn records(&self, project_id: &str) -> ResilienceResult<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for id in self.ids(project_id).await? {
            let checkpoint = self.load(project_id, &id).await?;
            if checkpoint.project_id == project_id {
                checkpoints.push(checkpoint);
            } else {
                debug!(
                    id = %id,
                    owner = %checkpoint.project_id,
                    project_id,
                    "Skipping foreign checkpoint"
                );
            }
        }
        Ok(checkpoints)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn insert(&self, mut checkpoint: Checkpoint) -> ResilienceResult<Checkpoint> {
        let lock = self.project_lock(&checkpoint.project_id);
        let _guard = lock.lock().await;

        let dir = self.project_dir(&checkpoint.project_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| store_err("Failed to create", &dir, e))?;

        let last = self
            .ids(&checkpoint.project_id)
            .await?
            .iter()
            .filter_map(|id| sequence_of(id))
            .max()
            .unwrap_or(0);
        checkpoint.stamp(last + 1);

        let file = dir.join(format!("{}.yaml", checkpoint.id));
        let temp_file = file.with_extension("yaml.tmp");

        let yaml = serde_yaml_bw::to_string(&checkpoint)
            .map_err(|e| store_err("Failed to serialize", &file, e))?;
        fs::write(&temp_file, &yaml)
            .await
            .map_err(|e| store_err("Failed to write", &temp_file, e))?;

        if let Err(e) = fs::rename(&temp_file, &file).await {
            let _ = fs::remove_file(&temp_file).await;
            return Err(store_err("Failed to commit", &file, e));
        }

        debug!(path = %file.display(), "Checkpoint written");
        Ok(checkpoint)
    }

    async fn latest(&self, project_id: &str) -> ResilienceResult<Option<Checkpoint>> {
        for id in self.ids(project_id).await? {
            let checkpoint = self.load(project_id, &id).await?;
            if checkpoint.project_id == project_id {
                return Ok(Some(checkpoint));
            }
        }
        Ok(None)
    }

    async fn list(&self, project_id: &str) -> ResilienceResult<Vec<Checkpoint>> {
        self.records(project_id).await
    }

    async fn prune(&self, project_id: &str, keep: usize) -> ResilienceResult<usize> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let records = self.records(project_id).await?;
        let dir = self.project_dir(project_id);
        let mut deleted = 0;
        for checkpoint in records.iter().skip(keep) {
            let file = dir.join(format!("{}.yaml", checkpoint.id));
            fs::remove_file(&file)
                .await
                .map_err(|e| store_err("Failed to delete", &file, e))?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

/// Process-local store, mainly for tests and dry runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn insert(&self, mut checkpoint: Checkpoint) -> ResilienceResult<Checkpoint> {
        let mut records = self.records.write();
        let list = records.entry(checkpoint.project_id.clone()).or_default();
        let last = list.last().and_then(Checkpoint::sequence).unwrap_or(0);
        checkpoint.stamp(last + 1);
        list.push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn latest(&self, project_id: &str) -> ResilienceResult<Option<Checkpoint>> {
        Ok(self
            .records
            .read()
            .get(project_id)
            .and_then(|v| v.last().cloned()))
    }

    async fn list(&self, project_id: &str) -> ResilienceResult<Vec<Checkpoint>> {
        Ok(self
            .records
            .read()
            .get(project_id)
            .map(|v| v.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn prune(&self, project_id: &str, keep: usize) -> ResilienceResult<usize> {
        let mut records = self.records.write();
        let Some(list) = records.get_mut(project_id) else {
            return Ok(0);
        };
        let excess = list.len().saturating_sub(keep);
        list.drain(..excess);
        Ok(excess)
    }
}

/// Persists and retrieves checkpoints; the caller decides when to take them.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    pub fn file(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileCheckpointStore::new(root)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCheckpointStore::new()))
    }

    pub async fn save(
        &self,
        project_id: &str,
        stage: &str,
        state_snapshot: serde_json::Value,
        description: &str,
    ) -> ResilienceResult<Checkpoint> {
        let checkpoint = self
            .store
            .insert(Checkpoint::new(project_id, stage, state_snapshot, description))
            .await?;
        info!(
            checkpoint_id = %checkpoint.id,
            project_id,
            stage,
            "Checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// Serialize any payload into the snapshot before saving.
    pub async fn save_state<T: Serialize>(
        &self,
        project_id: &str,
        stage: &str,
        state: &T,
        description: &str,
    ) -> ResilienceResult<Checkpoint> {
        let snapshot = serde_json::to_value(state).map_err(|e| {
            ResilienceError::Checkpoint(format!("Failed to serialize {stage} state: {e}"))
        })?;
        self.save(project_id, stage, snapshot, description).await
    }

    pub async fn get_latest(&self, project_id: &str) -> ResilienceResult<Option<Checkpoint>> {
        self.store.latest(project_id).await
    }

    pub async fn list(&self, project_id: &str) -> ResilienceResult<Vec<Checkpoint>> {
        self.store.list(project_id).await
    }

    pub async fn cleanup_old(&self, project_id: &str, keep: usize) -> ResilienceResult<usize> {
        let deleted = self.store.prune(project_id, keep).await?;
        if deleted > 0 {
            info!(project_id, deleted, "Cleaned up old checkpoints");
        }
        Ok(deleted)
    }
}
