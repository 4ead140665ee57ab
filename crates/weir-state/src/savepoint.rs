use std::collections::HashMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;
use weir_storage::{StorageProvider, StorageProviderRef};
use weir_types::{CheckpointId, JobId};

use crate::task_state::TaskState;

pub const SAVEPOINT_VERSION: u32 = 1;
const METADATA_FILE: &str = "_metadata";

/// The durable form of a checkpoint, written when externalization is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Savepoint {
    pub version: u32,
    pub job_id: JobId,
    pub checkpoint_id: CheckpointId,
    pub task_states: Vec<TaskState>,
}

impl Savepoint {
    pub fn new(job_id: JobId, checkpoint_id: CheckpointId, mut task_states: Vec<TaskState>) -> Self {
        task_states.sort_by(|a, b| a.job_vertex_id().cmp(b.job_vertex_id()));
        Self {
            version: SAVEPOINT_VERSION,
            job_id,
            checkpoint_id,
            task_states,
        }
    }

    /// Key of the metadata object relative to the target directory.
    pub fn metadata_key(job_id: &JobId, checkpoint_id: CheckpointId) -> String {
        format!("savepoint-{}-{}/{}", job_id, checkpoint_id, METADATA_FILE)
    }
}

/// Durable store for externalized checkpoints.
#[async_trait]
pub trait SavepointStore: Send + Sync {
    /// Writes the savepoint below `directory` and returns the external path it can be loaded from.
    async fn store(&self, directory: &str, savepoint: &Savepoint) -> anyhow::Result<String>;

    async fn load(
        &self,
        directory: &str,
        job_id: &JobId,
        checkpoint_id: CheckpointId,
    ) -> anyhow::Result<Savepoint>;
}

/// [SavepointStore] on top of [StorageProvider]; the directory may be any URL the storage layer
/// understands (local paths, `file://`, `s3://`, `memory://`).
#[derive(Default)]
pub struct StorageSavepointStore {
    providers: Mutex<HashMap<String, StorageProviderRef>>,
}

impl StorageSavepointStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn provider(&self, directory: &str) -> anyhow::Result<StorageProviderRef> {
        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(directory) {
            return Ok(provider.clone());
        }

        let provider = StorageProviderRef::new(
            StorageProvider::for_url(directory)
                .await
                .with_context(|| format!("invalid savepoint directory '{}'", directory))?,
        );
        providers.insert(directory.to_string(), provider.clone());
        Ok(provider)
    }
}

#[async_trait]
impl SavepointStore for StorageSavepointStore {
    async fn store(&self, directory: &str, savepoint: &Savepoint) -> anyhow::Result<String> {
        let provider = self.provider(directory).await?;
        let key = Savepoint::metadata_key(&savepoint.job_id, savepoint.checkpoint_id);
        let data = serde_json::to_vec(savepoint)?;

        provider
            .put(key.as_str(), data)
            .await
            .with_context(|| format!("failed to write savepoint to {}", directory))?;

        let path = provider.canonical_url_for(&key);
        info!(
            message = "stored savepoint",
            job_id = %savepoint.job_id,
            checkpoint_id = savepoint.checkpoint_id,
            path
        );
        Ok(path)
    }

    async fn load(
        &self,
        directory: &str,
        job_id: &JobId,
        checkpoint_id: CheckpointId,
    ) -> anyhow::Result<Savepoint> {
        let provider = self.provider(directory).await?;
        let key = Savepoint::metadata_key(job_id, checkpoint_id);
        let data = provider
            .get(key.as_str())
            .await
            .with_context(|| format!("failed to read savepoint {}", key))?;

        let savepoint: Savepoint = serde_json::from_slice(&data)?;
        if savepoint.version != SAVEPOINT_VERSION {
            bail!(
                "unsupported savepoint version {} (expected {})",
                savepoint.version,
                SAVEPOINT_VERSION
            );
        }
        Ok(savepoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::{ChainedStateHandle, KeyGroupRange, KeyGroupsStateHandle, StreamStateHandle};
    use crate::subtask_state::SubtaskState;
    use weir_types::JobVertexId;

    fn savepoint() -> Savepoint {
        let mut window = TaskState::new(JobVertexId::new("window"), 2, 128, 1);
        window
            .put_state(
                1,
                SubtaskState::with_keyed_state(KeyGroupsStateHandle::new(
                    KeyGroupRange::of(64, 127),
                    StreamStateHandle::bytes("window-1", vec![9u8, 9, 9]),
                )),
            )
            .unwrap();

        let mut source = TaskState::new(JobVertexId::new("source"), 1, 1, 1);
        source
            .put_state(
                0,
                SubtaskState::new(
                    Some(ChainedStateHandle::wrap_single(StreamStateHandle::bytes(
                        "offsets",
                        vec![1u8],
                    ))),
                    None,
                    None,
                ),
            )
            .unwrap();

        Savepoint::new(JobId::new("job-1"), 7, vec![window, source])
    }

    #[test]
    fn test_task_states_sorted() {
        let savepoint = savepoint();
        let ids: Vec<_> = savepoint
            .task_states
            .iter()
            .map(|t| t.job_vertex_id().to_string())
            .collect();
        assert_eq!(ids, vec!["source", "window"]);
    }

    #[tokio::test]
    async fn test_store_and_load_local() {
        let dir = tempfile::tempdir().unwrap();
        let directory = dir.path().to_str().unwrap().to_string();
        let store = StorageSavepointStore::new();

        let path = store.store(&directory, &savepoint()).await.unwrap();
        assert_eq!(
            path,
            format!("file://{}/savepoint-job-1-7/_metadata", directory)
        );
        assert!(dir.path().join("savepoint-job-1-7/_metadata").exists());

        let loaded = store
            .load(&directory, &JobId::new("job-1"), 7)
            .await
            .unwrap();
        assert_eq!(loaded, savepoint());
    }

    #[tokio::test]
    async fn test_store_rejects_invalid_directory() {
        let store = StorageSavepointStore::new();
        assert!(store.store("not a url", &savepoint()).await.is_err());
    }
}
