//! Record tables shared by the store backends

use super::{OutputSchema, ResultRow};
use crate::error::StoreError;
use crate::review::Rubric;
use crate::types::{
    BatchId, BatchOrchestration, ExecutionId, RowId, RubricId, SchemaId, TaskExecution,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// In-memory tables; backends wrap this in a lock
#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    batches: BTreeMap<BatchId, BatchOrchestration>,
    executions: BTreeMap<ExecutionId, TaskExecution>,
    schemas: BTreeMap<SchemaId, OutputSchema>,
    rubrics: BTreeMap<RubricId, Rubric>,
    rows: BTreeMap<RowId, ResultRow>,
}

/// On-disk form: plain record lists, keyed again on load
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    batches: Vec<BatchOrchestration>,
    executions: Vec<TaskExecution>,
    schemas: Vec<OutputSchema>,
    rubrics: Vec<Rubric>,
    rows: Vec<ResultRow>,
}

impl StoreState {
    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            batches: snapshot.batches.into_iter().map(|b| (b.id, b)).collect(),
            executions: snapshot.executions.into_iter().map(|e| (e.id, e)).collect(),
            schemas: snapshot.schemas.into_iter().map(|s| (s.id, s)).collect(),
            rubrics: snapshot.rubrics.into_iter().map(|r| (r.id, r)).collect(),
            rows: snapshot.rows.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    pub(crate) fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            batches: self.batches.values().cloned().collect(),
            executions: self.executions.values().cloned().collect(),
            schemas: self.schemas.values().cloned().collect(),
            rubrics: self.rubrics.values().cloned().collect(),
            rows: self.rows.values().cloned().collect(),
        }
    }

    pub(crate) fn insert_batch(
        &mut self,
        mut batch: BatchOrchestration,
    ) -> Result<BatchOrchestration, StoreError> {
        if self.batches.contains_key(&batch.id) {
            return Err(StoreError::AlreadyExists(format!("batch {}", batch.id)));
        }
        batch.revision = 0;
        self.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    pub(crate) fn batch(&self, id: BatchId) -> Result<BatchOrchestration, StoreError> {
        self.batches
            .get(&id)
            .cloned()
            .ok_or(StoreError::BatchNotFound(id))
    }

    pub(crate) fn update_batch(
        &mut self,
        mut batch: BatchOrchestration,
    ) -> Result<BatchOrchestration, StoreError> {
        let current = self
            .batches
            .get_mut(&batch.id)
            .ok_or(StoreError::BatchNotFound(batch.id))?;
        if current.revision != batch.revision {
            return Err(StoreError::RevisionConflict {
                expected: batch.revision,
                actual: current.revision,
            });
        }
        if current.status.is_terminal() {
            return Err(StoreError::BatchFinalized(batch.id));
        }
        batch.revision += 1;
        *current = batch.clone();
        Ok(batch)
    }

    pub(crate) fn running_batches(&self) -> Vec<BatchOrchestration> {
        self.batches
            .values()
            .filter(|b| !b.status.is_terminal())
            .cloned()
            .collect()
    }

    pub(crate) fn insert_execution(
        &mut self,
        mut execution: TaskExecution,
    ) -> Result<TaskExecution, StoreError> {
        if self.executions.contains_key(&execution.id) {
            return Err(StoreError::AlreadyExists(format!(
                "execution {}",
                execution.id
            )));
        }
        if let (Some(batch), Some(target)) = (execution.batch_id, execution.target.as_deref()) {
            if self.find_execution(batch, target).is_some() {
                return Err(StoreError::AlreadyExists(format!(
                    "execution for {target} in batch {batch}"
                )));
            }
        }
        execution.revision = 0;
        self.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    pub(crate) fn execution(&self, id: ExecutionId) -> Result<TaskExecution, StoreError> {
        self.executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    pub(crate) fn update_execution(
        &mut self,
        mut execution: TaskExecution,
    ) -> Result<TaskExecution, StoreError> {
        let current = self
            .executions
            .get_mut(&execution.id)
            .ok_or(StoreError::ExecutionNotFound(execution.id))?;
        if current.revision != execution.revision {
            return Err(StoreError::RevisionConflict {
                expected: execution.revision,
                actual: current.revision,
            });
        }
        if current.status != execution.status && !current.status.can_transition_to(execution.status)
        {
            return Err(StoreError::InvalidTransition {
                from: current.status,
                to: execution.status,
            });
        }
        execution.revision += 1;
        *current = execution.clone();
        Ok(execution)
    }

    pub(crate) fn find_execution(&self, batch: BatchId, target: &str) -> Option<TaskExecution> {
        self.executions
            .values()
            .find(|e| e.batch_id == Some(batch) && e.target.as_deref() == Some(target))
            .cloned()
    }

    pub(crate) fn executions_for_batch(&self, batch: BatchId) -> Vec<TaskExecution> {
        // ULID order, creation time to the millisecond
        self.executions
            .values()
            .filter(|e| e.batch_id == Some(batch))
            .cloned()
            .collect()
    }

    pub(crate) fn insert_schema(&mut self, schema: OutputSchema) -> Result<(), StoreError> {
        if self.schemas.contains_key(&schema.id) {
            return Err(StoreError::AlreadyExists(format!("schema {}", schema.id)));
        }
        self.schemas.insert(schema.id, schema);
        Ok(())
    }

    pub(crate) fn schema(&self, id: SchemaId) -> Result<OutputSchema, StoreError> {
        self.schemas
            .get(&id)
            .cloned()
            .ok_or(StoreError::SchemaNotFound(id))
    }

    pub(crate) fn insert_rubric(&mut self, rubric: Rubric) -> Result<(), StoreError> {
        if self.rubrics.contains_key(&rubric.id) {
            return Err(StoreError::AlreadyExists(format!("rubric {}", rubric.id)));
        }
        self.rubrics.insert(rubric.id, rubric);
        Ok(())
    }

    pub(crate) fn rubric(&self, id: RubricId) -> Result<Rubric, StoreError> {
        self.rubrics
            .get(&id)
            .cloned()
            .ok_or(StoreError::RubricNotFound(id))
    }

    pub(crate) fn insert_row(&mut self, row: ResultRow) -> Result<(), StoreError> {
        if self.rows.contains_key(&row.id) {
            return Err(StoreError::AlreadyExists(format!("row {}", row.id)));
        }
        self.rows.insert(row.id, row);
        Ok(())
    }

    pub(crate) fn row(&self, id: RowId) -> Result<ResultRow, StoreError> {
        self.rows.get(&id).cloned().ok_or(StoreError::RowNotFound(id))
    }

    pub(crate) fn row_for_execution(&self, execution: ExecutionId) -> Option<ResultRow> {
        self.rows
            .values()
            .find(|r| r.execution_id == execution)
            .cloned()
    }

    pub(crate) fn update_cell(
        &mut self,
        id: RowId,
        field: &str,
        value: serde_json::Value,
    ) -> Result<ResultRow, StoreError> {
        let row = self.rows.get_mut(&id).ok_or(StoreError::RowNotFound(id))?;
        let cell = row
            .cells
            .get_mut(field)
            .ok_or_else(|| StoreError::UnknownField {
                row: id,
                field: field.to_string(),
            })?;
        *cell = Some(value);
        Ok(row.clone())
    }
}
