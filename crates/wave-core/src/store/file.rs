//! JSON snapshot store
//!
//! Keeps the tables in memory and rewrites a single JSON snapshot after every
//! mutation (temp file + rename, so a crash leaves either the old or the new
//! snapshot). Reopening the path restores every record, which is what lets an
//! orchestrator resume a batch after a restart.

use super::state::{Snapshot, StoreState};
use super::{OutputSchema, ResultRow, Store};
use crate::error::StoreError;
use crate::review::Rubric;
use crate::types::{
    BatchId, BatchOrchestration, ExecutionId, RowId, RubricId, SchemaId, TaskExecution,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

/// Store persisted as a JSON snapshot file
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileStore {
    /// Open the snapshot at `path`, starting empty if it does not exist
    ///
    /// # Errors
    /// `StoreError::Io` if the file exists but cannot be read,
    /// `StoreError::Encoding` if it is not a valid snapshot.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = if path.exists() {
            let raw = fs::read(&path).map_err(|e| StoreError::io_error(&path, e))?;
            let snapshot: Snapshot = serde_json::from_slice(&raw)?;
            StoreState::from_snapshot(snapshot)
        } else {
            StoreState::default()
        };
        tracing::debug!(path = %path.display(), "opened snapshot store");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Snapshot location
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the whole snapshot
    ///
    /// Blocking file I/O, called with the state lock held: every write in
    /// this store is serialized through it.
    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&state.to_snapshot())?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(|e| StoreError::io_error(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io_error(&self.path, e))
    }

    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock();
        // The live state only changes once the snapshot holding it is on disk
        let mut next = state.clone();
        let out = op(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn insert_batch(
        &self,
        batch: BatchOrchestration,
    ) -> Result<BatchOrchestration, StoreError> {
        self.mutate(|s| s.insert_batch(batch))
    }

    async fn batch(&self, id: BatchId) -> Result<BatchOrchestration, StoreError> {
        self.state.lock().batch(id)
    }

    async fn update_batch(
        &self,
        batch: BatchOrchestration,
    ) -> Result<BatchOrchestration, StoreError> {
        self.mutate(|s| s.update_batch(batch))
    }

    async fn running_batches(&self) -> Result<Vec<BatchOrchestration>, StoreError> {
        Ok(self.state.lock().running_batches())
    }

    async fn insert_execution(
        &self,
        execution: TaskExecution,
    ) -> Result<TaskExecution, StoreError> {
        self.mutate(|s| s.insert_execution(execution))
    }

    async fn execution(&self, id: ExecutionId) -> Result<TaskExecution, StoreError> {
        self.state.lock().execution(id)
    }

    async fn update_execution(
        &self,
        execution: TaskExecution,
    ) -> Result<TaskExecution, StoreError> {
        self.mutate(|s| s.update_execution(execution))
    }

    async fn find_execution(
        &self,
        batch: BatchId,
        target: &str,
    ) -> Result<Option<TaskExecution>, StoreError> {
        Ok(self.state.lock().find_execution(batch, target))
    }

    async fn executions_for_batch(
        &self,
        batch: BatchId,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        Ok(self.state.lock().executions_for_batch(batch))
    }

    async fn insert_schema(&self, schema: OutputSchema) -> Result<(), StoreError> {
        self.mutate(|s| s.insert_schema(schema))
    }

    async fn schema(&self, id: SchemaId) -> Result<OutputSchema, StoreError> {
        self.state.lock().schema(id)
    }

    async fn insert_rubric(&self, rubric: Rubric) -> Result<(), StoreError> {
        self.mutate(|s| s.insert_rubric(rubric))
    }

    async fn rubric(&self, id: RubricId) -> Result<Rubric, StoreError> {
        self.state.lock().rubric(id)
    }

    async fn insert_row(&self, row: ResultRow) -> Result<(), StoreError> {
        self.mutate(|s| s.insert_row(row))
    }

    async fn row(&self, id: RowId) -> Result<ResultRow, StoreError> {
        self.state.lock().row(id)
    }

    async fn row_for_execution(
        &self,
        execution: ExecutionId,
    ) -> Result<Option<ResultRow>, StoreError> {
        Ok(self.state.lock().row_for_execution(execution))
    }

    async fn update_cell(
        &self,
        row: RowId,
        field: &str,
        value: serde_json::Value,
    ) -> Result<ResultRow, StoreError> {
        self.mutate(|s| s.update_cell(row, field, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;

    #[tokio::test]
    async fn reopen_restores_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wave.json");

        let (batch_id, exec_id) = {
            let store = JsonFileStore::open(&path).unwrap();
            let batch = store
                .insert_batch(BatchOrchestration::new(
                    UserId::new("u"),
                    "task",
                    vec!["a".into(), "b".into()],
                    1,
                ))
                .await
                .unwrap();
            let exec = store
                .insert_execution(TaskExecution::queued("task a").for_target(batch.id, "a"))
                .await
                .unwrap();
            let mut updated = batch.clone();
            updated.dispatched_chunks.insert(0);
            store.update_batch(updated).await.unwrap();
            (batch.id, exec.id)
        };

        let reopened = JsonFileStore::open(&path).unwrap();
        let batch = reopened.batch(batch_id).await.unwrap();
        assert_eq!(batch.revision, 1);
        assert!(batch.dispatched_chunks.contains(&0));
        assert_eq!(reopened.execution(exec_id).await.unwrap().prompt, "task a");
        assert_eq!(reopened.running_batches().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_snapshot_write_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = dir.path().join("snapshots");
        fs::create_dir(&snapshots).unwrap();
        let store = JsonFileStore::open(snapshots.join("wave.json")).unwrap();
        let batch = store
            .insert_batch(BatchOrchestration::new(
                UserId::new("u"),
                "task",
                vec!["a".into()],
                1,
            ))
            .await
            .unwrap();

        fs::remove_dir_all(&snapshots).unwrap();
        let mut counted = batch.clone();
        counted.completed_count = 1;
        let err = store.update_batch(counted.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));

        let stored = store.batch(batch.id).await.unwrap();
        assert_eq!(stored.revision, 0);
        assert_eq!(stored.completed_count, 0);

        // Same revision applies once the directory is back
        fs::create_dir(&snapshots).unwrap();
        let written = store.update_batch(counted).await.unwrap();
        assert_eq!(written.revision, 1);
        let reopened = JsonFileStore::open(snapshots.join("wave.json")).unwrap();
        assert_eq!(reopened.batch(batch.id).await.unwrap().completed_count, 1);
    }

    #[tokio::test]
    async fn reads_do_not_create_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wave.json");
        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.batch(BatchId::new()).await.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_snapshot_is_an_encoding_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wave.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::Encoding(_))
        ));
    }
}
