//! Result sets handed out for statements that return rows

use std::collections::VecDeque;
use std::sync::Arc;

use crate::row::Row;
use crate::value::Value;

/// A scarce, releasable result-set resource.
///
/// Whoever holds a result set must call [`ResultSet::release`] when done
/// with it. Releasing more than once is a no-op.
pub trait ResultSet {
    /// Column names, in select-list order.
    fn columns(&self) -> &[String];

    /// Number of rows the statement produced, fetched or not.
    fn row_count(&self) -> usize;

    /// Fetch the next row, or `None` when exhausted or released.
    fn fetch_row(&mut self) -> Option<Row>;

    /// Free the underlying resource.
    fn release(&mut self);

    /// Whether [`ResultSet::release`] has been called.
    fn is_released(&self) -> bool;
}

/// A result set fully buffered in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedResultSet {
    columns: Arc<[String]>,
    rows: VecDeque<Vec<Value>>,
    row_count: usize,
    released: bool,
}

impl BufferedResultSet {
    /// Create a result set from column names and row values.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: columns.into(),
            row_count: rows.len(),
            rows: rows.into(),
            released: false,
        }
    }

    /// Rows not yet fetched.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    /// Fetch every remaining row.
    pub fn fetch_all(&mut self) -> Vec<Row> {
        let mut out = Vec::with_capacity(self.rows.len());
        while let Some(row) = self.fetch_row() {
            out.push(row);
        }
        out
    }
}

impl ResultSet for BufferedResultSet {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn row_count(&self) -> usize {
        self.row_count
    }

    fn fetch_row(&mut self) -> Option<Row> {
        if self.released {
            return None;
        }
        self.rows
            .pop_front()
            .map(|values| Row::new(Arc::clone(&self.columns), values))
    }

    fn release(&mut self) {
        if !self.released {
            self.rows.clear();
            self.released = true;
        }
    }

    fn is_released(&self) -> bool {
        self.released
    }
}
