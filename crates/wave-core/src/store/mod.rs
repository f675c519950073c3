//! Persistence
//!
//! Batches and executions carry a `revision`; every write is a
//! compare-and-swap against the stored revision, so concurrent writers
//! re-read and retry instead of overwriting each other. Terminal batches are
//! frozen by the store itself.

mod file;
mod memory;
mod state;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::review::{FieldValues, Rubric};
use crate::types::{
    BatchId, BatchOrchestration, ExecutionId, RowId, RubricId, SchemaId, TaskExecution,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Attempts before a contended compare-and-swap gives up
pub const MAX_CAS_RETRIES: usize = 64;

/// One structured-output field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Field name (cell key)
    pub name: String,
    /// What the field should contain
    pub description: String,
}

/// Structured-output schema for dataset mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSchema {
    /// Schema identifier
    pub id: SchemaId,
    /// Display name
    pub name: String,
    /// Ordered fields
    pub fields: Vec<SchemaField>,
}

impl OutputSchema {
    /// Create an empty schema
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: SchemaId::new(),
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.fields.push(SchemaField {
            name: name.into(),
            description: description.into(),
        });
        self
    }

    /// Field names in order
    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }
}

/// Result-row placeholder for one (batch, target)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Row identifier
    pub id: RowId,
    /// Owning batch
    pub batch_id: BatchId,
    /// Target the row describes
    pub target: String,
    /// Schema the cells follow
    pub schema_id: SchemaId,
    /// Execution filling the row
    pub execution_id: ExecutionId,
    /// One cell per schema field, `None` until captured
    pub cells: FieldValues,
}

impl ResultRow {
    /// Placeholder with one empty cell per schema field
    #[must_use]
    pub fn placeholder(
        schema: &OutputSchema,
        batch_id: BatchId,
        target: impl Into<String>,
        execution_id: ExecutionId,
    ) -> Self {
        Self {
            id: RowId::new(),
            batch_id,
            target: target.into(),
            schema_id: schema.id,
            execution_id,
            cells: schema.fields.iter().map(|f| (f.name.clone(), None)).collect(),
        }
    }

    /// Number of cells holding a value
    #[must_use]
    pub fn filled(&self) -> usize {
        self.cells.values().filter(|v| v.is_some()).count()
    }
}

/// Durable record store
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new batch at revision 0
    async fn insert_batch(&self, batch: BatchOrchestration)
        -> Result<BatchOrchestration, StoreError>;

    /// Load a batch
    async fn batch(&self, id: BatchId) -> Result<BatchOrchestration, StoreError>;

    /// Write `batch` if its revision still matches, returning the stored copy
    async fn update_batch(&self, batch: BatchOrchestration)
        -> Result<BatchOrchestration, StoreError>;

    /// Batches not yet in a terminal status
    async fn running_batches(&self) -> Result<Vec<BatchOrchestration>, StoreError>;

    /// Insert a new execution at revision 0
    async fn insert_execution(&self, execution: TaskExecution)
        -> Result<TaskExecution, StoreError>;

    /// Load an execution
    async fn execution(&self, id: ExecutionId) -> Result<TaskExecution, StoreError>;

    /// Write `execution` if its revision still matches
    async fn update_execution(&self, execution: TaskExecution)
        -> Result<TaskExecution, StoreError>;

    /// Execution for a batch target, if one was created
    async fn find_execution(
        &self,
        batch: BatchId,
        target: &str,
    ) -> Result<Option<TaskExecution>, StoreError>;

    /// All executions of a batch, in creation order
    async fn executions_for_batch(&self, batch: BatchId)
        -> Result<Vec<TaskExecution>, StoreError>;

    /// Register a schema
    async fn insert_schema(&self, schema: OutputSchema) -> Result<(), StoreError>;

    /// Load a schema
    async fn schema(&self, id: SchemaId) -> Result<OutputSchema, StoreError>;

    /// Register a rubric
    async fn insert_rubric(&self, rubric: Rubric) -> Result<(), StoreError>;

    /// Load a rubric
    async fn rubric(&self, id: RubricId) -> Result<Rubric, StoreError>;

    /// Insert a result row
    async fn insert_row(&self, row: ResultRow) -> Result<(), StoreError>;

    /// Load a result row
    async fn row(&self, id: RowId) -> Result<ResultRow, StoreError>;

    /// Result row linked to an execution
    async fn row_for_execution(
        &self,
        execution: ExecutionId,
    ) -> Result<Option<ResultRow>, StoreError>;

    /// Write one cell of a result row
    async fn update_cell(
        &self,
        row: RowId,
        field: &str,
        value: serde_json::Value,
    ) -> Result<ResultRow, StoreError>;
}

/// Decision returned by a read-modify-write closure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modify<T> {
    /// Persist the mutated record
    Write(T),
    /// Leave the stored record untouched
    Skip(T),
}

/// Read-modify-write a batch, retrying on revision conflicts
///
/// `apply` may run several times; it must derive everything from the record
/// it is handed. Returns the stored batch after the final attempt together
/// with the closure's output.
///
/// # Errors
/// Any non-conflict store error, or the last conflict once
/// [`MAX_CAS_RETRIES`] attempts are exhausted.
pub async fn modify_batch<T, F>(
    store: &dyn Store,
    id: BatchId,
    mut apply: F,
) -> Result<(BatchOrchestration, T), StoreError>
where
    T: Send,
    F: FnMut(&mut BatchOrchestration) -> Modify<T> + Send,
{
    let mut last_conflict = None;
    for _ in 0..MAX_CAS_RETRIES {
        let mut batch = store.batch(id).await?;
        match apply(&mut batch) {
            Modify::Skip(out) => return Ok((batch, out)),
            Modify::Write(out) => match store.update_batch(batch).await {
                Ok(stored) => return Ok((stored, out)),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(batch_id = %id, error = %e, "batch write conflict, retrying");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            },
        }
    }
    Err(last_conflict.unwrap_or(StoreError::RevisionConflict {
        expected: 0,
        actual: 0,
    }))
}

/// Read-modify-write an execution, retrying on revision conflicts
///
/// # Errors
/// Same as [`modify_batch`].
pub async fn modify_execution<T, F>(
    store: &dyn Store,
    id: ExecutionId,
    mut apply: F,
) -> Result<(TaskExecution, T), StoreError>
where
    T: Send,
    F: FnMut(&mut TaskExecution) -> Result<Modify<T>, StoreError> + Send,
{
    let mut last_conflict = None;
    for _ in 0..MAX_CAS_RETRIES {
        let mut execution = store.execution(id).await?;
        match apply(&mut execution)? {
            Modify::Skip(out) => return Ok((execution, out)),
            Modify::Write(out) => match store.update_execution(execution).await {
                Ok(stored) => return Ok((stored, out)),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(execution_id = %id, error = %e, "execution write conflict, retrying");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            },
        }
    }
    Err(last_conflict.unwrap_or(StoreError::RevisionConflict {
        expected: 0,
        actual: 0,
    }))
}
