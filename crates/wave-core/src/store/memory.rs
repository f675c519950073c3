//! In-process store

use super::state::StoreState;
use super::{OutputSchema, ResultRow, Store};
use crate::error::StoreError;
use crate::review::Rubric;
use crate::types::{
    BatchId, BatchOrchestration, ExecutionId, RowId, RubricId, SchemaId, TaskExecution,
};
use async_trait::async_trait;
use parking_lot::RwLock;

/// Store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_batch(
        &self,
        batch: BatchOrchestration,
    ) -> Result<BatchOrchestration, StoreError> {
        self.state.write().insert_batch(batch)
    }

    async fn batch(&self, id: BatchId) -> Result<BatchOrchestration, StoreError> {
        self.state.read().batch(id)
    }

    async fn update_batch(
        &self,
        batch: BatchOrchestration,
    ) -> Result<BatchOrchestration, StoreError> {
        self.state.write().update_batch(batch)
    }

    async fn running_batches(&self) -> Result<Vec<BatchOrchestration>, StoreError> {
        Ok(self.state.read().running_batches())
    }

    async fn insert_execution(
        &self,
        execution: TaskExecution,
    ) -> Result<TaskExecution, StoreError> {
        self.state.write().insert_execution(execution)
    }

    async fn execution(&self, id: ExecutionId) -> Result<TaskExecution, StoreError> {
        self.state.read().execution(id)
    }

    async fn update_execution(
        &self,
        execution: TaskExecution,
    ) -> Result<TaskExecution, StoreError> {
        self.state.write().update_execution(execution)
    }

    async fn find_execution(
        &self,
        batch: BatchId,
        target: &str,
    ) -> Result<Option<TaskExecution>, StoreError> {
        Ok(self.state.read().find_execution(batch, target))
    }

    async fn executions_for_batch(
        &self,
        batch: BatchId,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        Ok(self.state.read().executions_for_batch(batch))
    }

    async fn insert_schema(&self, schema: OutputSchema) -> Result<(), StoreError> {
        self.state.write().insert_schema(schema)
    }

    async fn schema(&self, id: SchemaId) -> Result<OutputSchema, StoreError> {
        self.state.read().schema(id)
    }

    async fn insert_rubric(&self, rubric: Rubric) -> Result<(), StoreError> {
        self.state.write().insert_rubric(rubric)
    }

    async fn rubric(&self, id: RubricId) -> Result<Rubric, StoreError> {
        self.state.read().rubric(id)
    }

    async fn insert_row(&self, row: ResultRow) -> Result<(), StoreError> {
        self.state.write().insert_row(row)
    }

    async fn row(&self, id: RowId) -> Result<ResultRow, StoreError> {
        self.state.read().row(id)
    }

    async fn row_for_execution(
        &self,
        execution: ExecutionId,
    ) -> Result<Option<ResultRow>, StoreError> {
        Ok(self.state.read().row_for_execution(execution))
    }

    async fn update_cell(
        &self,
        row: RowId,
        field: &str,
        value: serde_json::Value,
    ) -> Result<ResultRow, StoreError> {
        self.state.write().update_cell(row, field, value)
    }
}
