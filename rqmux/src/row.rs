//! Rows of reaped result sets

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::traits::FromValue;
use crate::value::Value;

/// One row of a result set.
///
/// Column names are shared between all rows of the same result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row from shared column names and its values.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Column names, in select-list order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values, in select-list order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Take ownership of the values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column name.
    ///
    /// With duplicate column names the first match wins.
    pub fn get_value(&self, column: &str) -> Result<Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
            .cloned()
            .ok_or_else(|| Error::ColumnNotFound(column.to_string()))
    }

    /// Get a value by position.
    pub fn get_index(&self, index: usize) -> Result<Value> {
        self.values
            .get(index)
            .cloned()
            .ok_or_else(|| Error::ColumnNotFound(format!("#{}", index)))
    }

    /// Get a typed value by column name.
    ///
    /// A NULL cell only converts into `Option<T>`; for any other target it
    /// is reported as [`Error::UnexpectedNull`].
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        let value = self.get_value(column)?;
        let was_null = value.is_null();
        T::from_value(value).map_err(|e| match e {
            Error::TypeConversion { .. } if was_null => Error::UnexpectedNull(column.to_string()),
            e => e,
        })
    }
}
