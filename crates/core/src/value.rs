use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A single cell value as returned by the driver layer.
///
/// Values are owned by the [`Row`] holding them; cloning one for
/// primary-key targeting yields an independent copy that outlives the
/// page it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::Bytes(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub default_literal: Option<String>,
}

impl Column {
    #[must_use]
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: true,
            primary_key: false,
            auto_increment: false,
            default_literal: None,
        }
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }
}

/// Ordered column metadata shared by every row of a page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    #[must_use]
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    #[must_use]
    pub fn primary_key_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, column)| column.primary_key)
            .map(|(index, _)| index)
            .collect()
    }

    #[must_use]
    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|column| column.primary_key)
    }
}

/// One result row; cell count always equals the owning page's column count.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }
}

/// Best current estimate of a query's total row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowCount {
    pub total: u64,
    /// False when the count budget was exhausted and `total` is only a
    /// lower bound.
    pub exact: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageError {
    #[error("row {row_index} holds {actual} cells but the schema declares {expected} columns")]
    RowWidthMismatch {
        row_index: usize,
        expected: usize,
        actual: usize,
    },
}

/// A contiguous, ordered slice of a query's rows at a known absolute offset.
///
/// Row `i` of the page corresponds to absolute index `loaded_offset + i`;
/// there are never gaps. A page is replaced wholesale on every completed
/// load and patched in place only through [`Page::set_cell`] and
/// [`Page::remove_row`].
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    schema: Arc<TableSchema>,
    rows: Vec<Row>,
    loaded_offset: u64,
}

impl Page {
    pub fn new(
        schema: Arc<TableSchema>,
        loaded_offset: u64,
        rows: Vec<Row>,
    ) -> Result<Self, PageError> {
        let expected = schema.column_count();
        for (row_index, row) in rows.iter().enumerate() {
            if row.values.len() != expected {
                return Err(PageError::RowWidthMismatch {
                    row_index,
                    expected,
                    actual: row.values.len(),
                });
            }
        }
        Ok(Self {
            schema,
            rows,
            loaded_offset,
        })
    }

    #[must_use]
    pub fn empty(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            loaded_offset: 0,
        }
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    #[must_use]
    pub fn loaded_offset(&self) -> u64 {
        self.loaded_offset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Absolute index one past the last resident row.
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.loaded_offset + self.rows.len() as u64
    }

    #[must_use]
    pub fn contains_row(&self, absolute_row: u64) -> bool {
        absolute_row >= self.loaded_offset && absolute_row < self.end_offset()
    }

    #[must_use]
    pub fn row(&self, absolute_row: u64) -> Option<&Row> {
        if !self.contains_row(absolute_row) {
            return None;
        }
        let relative = usize::try_from(absolute_row - self.loaded_offset).ok()?;
        self.rows.get(relative)
    }

    #[must_use]
    pub fn cell(&self, absolute_row: u64, column: usize) -> Option<&Value> {
        self.row(absolute_row)?.values.get(column)
    }

    /// Patch a resident cell in place. Returns false when the coordinates
    /// fall outside the window.
    pub fn set_cell(&mut self, absolute_row: u64, column: usize, value: Value) -> bool {
        if !self.contains_row(absolute_row) {
            return false;
        }
        let Ok(relative) = usize::try_from(absolute_row - self.loaded_offset) else {
            return false;
        };
        match self.rows.get_mut(relative).and_then(|row| row.values.get_mut(column)) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    /// Remove a resident row, shifting later rows one slot down so the
    /// contiguity invariant keeps holding.
    pub fn remove_row(&mut self, absolute_row: u64) -> Option<Row> {
        if !self.contains_row(absolute_row) {
            return None;
        }
        let relative = usize::try_from(absolute_row - self.loaded_offset).ok()?;
        Some(self.rows.remove(relative))
    }

    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}
