use async_trait::async_trait;
use thiserror::Error;

use crate::table_view::{TableView, ViewId};
use crate::value::{Row, TableSchema, Value};

/// Sanity bound on composite keys, not an architectural limit.
pub const MAX_KEY_COLUMNS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct MutationBackendError {
    message: String,
}

impl MutationBackendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("table `{table}` declares no primary key; refusing to mutate")]
    NoPrimaryKey { table: String },
    #[error(
        "table `{table}` declares {count} primary-key columns; at most {MAX_KEY_COLUMNS} are supported"
    )]
    TooManyKeyColumns { table: String, count: usize },
    #[error("row {row} is outside the loaded window")]
    RowNotLoaded { row: u64 },
    #[error("column index {column} is out of range")]
    ColumnOutOfRange { column: usize },
    #[error("nothing to insert")]
    EmptyInsert,
}

/// Write side of the driver layer. Statements are always keyed on
/// primary-key values, never on row offsets.
#[async_trait]
pub trait MutationBackend: Send + Sync {
    async fn update_cell(
        &self,
        database: Option<&str>,
        table: &str,
        key: &[(String, Value)],
        column: &str,
        value: &Value,
    ) -> Result<(), MutationBackendError>;

    async fn delete_row(
        &self,
        database: Option<&str>,
        table: &str,
        key: &[(String, Value)],
    ) -> Result<(), MutationBackendError>;

    async fn insert_row(
        &self,
        database: Option<&str>,
        table: &str,
        values: &[(String, Value)],
    ) -> Result<(), MutationBackendError>;
}

/// Point-in-time owned copy of a row's primary-key columns and values.
///
/// Captured from the in-memory row before the driver call goes out, so the
/// statement still targets the right row even if the resident page gets
/// reloaded or re-offset while the call is in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct KeySnapshot {
    pairs: Vec<(String, Value)>,
    indices: Vec<usize>,
}

impl KeySnapshot {
    pub fn capture(table: &str, schema: &TableSchema, row: &Row) -> Result<Self, MutationError> {
        let indices = schema.primary_key_indices();
        if indices.is_empty() {
            return Err(MutationError::NoPrimaryKey {
                table: table.to_string(),
            });
        }
        if indices.len() > MAX_KEY_COLUMNS {
            return Err(MutationError::TooManyKeyColumns {
                table: table.to_string(),
                count: indices.len(),
            });
        }

        let mut pairs = Vec::with_capacity(indices.len());
        for index in &indices {
            let value = row
                .values
                .get(*index)
                .ok_or(MutationError::ColumnOutOfRange { column: *index })?;
            pairs.push((schema.columns[*index].name.clone(), value.clone()));
        }
        Ok(Self { pairs, indices })
    }

    #[must_use]
    pub fn pairs(&self) -> &[(String, Value)] {
        &self.pairs
    }

    /// (column index, value) pairs for relocating the row inside a page.
    #[must_use]
    pub fn index_pairs(&self) -> Vec<(usize, Value)> {
        self.indices
            .iter()
            .zip(&self.pairs)
            .map(|(index, (_, value))| (*index, value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreparedMutation {
    UpdateCell {
        key: KeySnapshot,
        column: usize,
        column_name: String,
        value: Value,
    },
    DeleteRows {
        targets: Vec<(u64, KeySnapshot)>,
        skipped_off_window: usize,
    },
    InsertRow {
        values: Vec<(String, Value)>,
    },
}

/// A mutation with its preconditions checked and every input snapshotted,
/// ready to hand to a worker task.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationJob {
    pub view: ViewId,
    pub database: Option<String>,
    pub table: String,
    pub mutation: PreparedMutation,
}

impl MutationJob {
    fn new(view: &TableView, mutation: PreparedMutation) -> Self {
        Self {
            view: view.id(),
            database: view.spec().database.clone(),
            table: view.spec().table.clone(),
            mutation,
        }
    }
}

/// Validate an edit and snapshot its key. Fails before any driver call
/// when the schema declares no usable primary key, when the row is not
/// resident, or when the column does not exist.
pub fn prepare_update(
    view: &TableView,
    row: u64,
    column: usize,
    value: Value,
) -> Result<MutationJob, MutationError> {
    let table = &view.spec().table;
    let column_name = view
        .schema()
        .columns
        .get(column)
        .map(|definition| definition.name.clone())
        .ok_or(MutationError::ColumnOutOfRange { column })?;
    let resident = view
        .page()
        .row(row)
        .ok_or(MutationError::RowNotLoaded { row })?;
    let key = KeySnapshot::capture(table, view.schema(), resident)?;

    Ok(MutationJob::new(
        view,
        PreparedMutation::UpdateCell {
            key,
            column,
            column_name,
            value,
        },
    ))
}

/// Snapshot keys for every requested row that is resident. Rows outside
/// the loaded window are skipped, not loaded on demand; the completion
/// reports how many were skipped.
pub fn prepare_delete(view: &TableView, rows: &[u64]) -> Result<MutationJob, MutationError> {
    let table = &view.spec().table;
    if !view.schema().has_primary_key() {
        return Err(MutationError::NoPrimaryKey {
            table: table.clone(),
        });
    }

    let mut targets = Vec::new();
    let mut skipped_off_window = 0;
    for row in rows {
        match view.page().row(*row) {
            Some(resident) => {
                targets.push((*row, KeySnapshot::capture(table, view.schema(), resident)?));
            }
            None => skipped_off_window += 1,
        }
    }

    Ok(MutationJob::new(
        view,
        PreparedMutation::DeleteRows {
            targets,
            skipped_off_window,
        },
    ))
}

pub fn prepare_insert(
    view: &TableView,
    values: Vec<(String, Value)>,
) -> Result<MutationJob, MutationError> {
    if values.is_empty() {
        return Err(MutationError::EmptyInsert);
    }
    Ok(MutationJob::new(view, PreparedMutation::InsertRow { values }))
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    CellUpdated {
        key: KeySnapshot,
        column: usize,
        value: Value,
    },
    RowsDeleted {
        deleted: usize,
        failed: usize,
        skipped_off_window: usize,
    },
    RowInserted,
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationCompletion {
    pub view: ViewId,
    pub outcome: MutationOutcome,
}

/// Execute a prepared mutation on a worker task. Bulk deletes keep going
/// past individual failures and report the failed count.
pub async fn run_mutation<B: MutationBackend + ?Sized>(
    backend: &B,
    job: MutationJob,
) -> MutationCompletion {
    let database = job.database.as_deref();
    let outcome = match job.mutation {
        PreparedMutation::UpdateCell {
            key,
            column,
            column_name,
            value,
        } => match backend
            .update_cell(database, &job.table, key.pairs(), &column_name, &value)
            .await
        {
            Ok(()) => MutationOutcome::CellUpdated { key, column, value },
            Err(error) => MutationOutcome::Failed {
                message: error.to_string(),
            },
        },
        PreparedMutation::DeleteRows {
            targets,
            skipped_off_window,
        } => {
            let mut deleted = 0;
            let mut failed = 0;
            for (_, key) in &targets {
                match backend.delete_row(database, &job.table, key.pairs()).await {
                    Ok(()) => deleted += 1,
                    Err(_) => failed += 1,
                }
            }
            MutationOutcome::RowsDeleted {
                deleted,
                failed,
                skipped_off_window,
            }
        }
        PreparedMutation::InsertRow { values } => {
            match backend.insert_row(database, &job.table, &values).await {
                Ok(()) => MutationOutcome::RowInserted,
                Err(error) => MutationOutcome::Failed {
                    message: error.to_string(),
                },
            }
        }
    };

    MutationCompletion {
        view: job.view,
        outcome,
    }
}

/// What the UI loop should do after a completion was folded into the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedMutation {
    /// Local state was patched; peer views of the same table are stale.
    Changed,
    /// Nothing changed anywhere (refused, failed, or nothing deleted).
    Unchanged,
}

/// Fold a mutation completion into the owning view, on the UI loop.
///
/// Updates patch the resident cell in place, relocating the row by its
/// key snapshot since the page may have re-offset while the call was in
/// flight. Deletes adjust the local total and reload through the normal
/// load path at an offset that keeps the cursor near its pre-delete
/// position. Inserts bump the total and reload the current window.
pub fn apply_completion(view: &mut TableView, completion: MutationCompletion) -> AppliedMutation {
    if completion.view != view.id() {
        return AppliedMutation::Unchanged;
    }

    match completion.outcome {
        MutationOutcome::CellUpdated { key, column, value } => {
            if let Some(row) = view.locate_by_key(&key.index_pairs()) {
                view.patch_cell(row, column, value);
            }
            view.set_status("updated 1 row");
            AppliedMutation::Changed
        }
        MutationOutcome::RowsDeleted {
            deleted,
            failed,
            skipped_off_window,
        } => {
            let mut message = format!("deleted {deleted} row(s)");
            if failed > 0 {
                message.push_str(&format!(", {failed} failed"));
            }
            if skipped_off_window > 0 {
                message.push_str(&format!(", {skipped_off_window} outside the loaded window"));
            }
            view.set_status(message);

            if deleted == 0 {
                return AppliedMutation::Unchanged;
            }
            let (cursor_row, cursor_col) = view.cursor();
            for _ in 0..deleted {
                view.note_row_deleted();
            }
            // Clamp to the post-delete valid range; an approximate total
            // stays advisory and does not pull the cursor around.
            let target = if view.is_approximate() {
                cursor_row
            } else {
                cursor_row.min(view.total_rows().saturating_sub(1))
            };
            view.set_cursor(target, cursor_col);
            view.request_reload();
            AppliedMutation::Changed
        }
        MutationOutcome::RowInserted => {
            view.note_row_inserted();
            view.set_status("inserted 1 row");
            view.request_reload();
            AppliedMutation::Changed
        }
        MutationOutcome::Failed { message } => {
            view.set_status(format!("mutation failed: {message}"));
            AppliedMutation::Unchanged
        }
    }
}
