//! Query modes and the settled outcome of one query

use crate::error::Result;
use crate::row::Row;
use crate::traits::{ExecuteResult, FromValue, RawValue, ResultSet};
use crate::value::Value;

/// How a completed query's payload is post-processed before its future settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryMode {
    /// Hand the result set to the caller, who must release it.
    #[default]
    Normal,
    /// Discard the payload; the result set is released immediately.
    ExecOnly,
    /// Keep only the first row; the result set is released.
    FirstRowOnly,
    /// Keep only the first column of the first row; the result set is released.
    FirstValueOnly,
}

/// The post-processed value of a settled query.
#[derive(Debug)]
pub enum Payload<R> {
    /// Nothing to hand out: ExecOnly, a statement without rows, zero rows,
    /// or a result set that has been released.
    None,
    /// The open result set (Normal mode).
    ResultSet(R),
    /// The first row (FirstRowOnly).
    Row(Row),
    /// The first column of the first row (FirstValueOnly).
    Value(Value),
}

impl<R> Payload<R> {
    pub fn is_none(&self) -> bool {
        matches!(self, Payload::None)
    }
}

/// What the client returned when the query was reaped, independent of mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOutcome {
    /// The statement produced a result set.
    ResultSet,
    /// The statement completed without a result set.
    Affected(ExecuteResult),
}

/// The outcome of one successfully completed query.
///
/// In [`QueryMode::Normal`] the open result set belongs to the caller: call
/// [`QueryResult::release`] (or take it with [`QueryResult::into_result_set`])
/// when done. Every other mode has already released it.
#[derive(Debug)]
pub struct QueryResult<R> {
    sql: String,
    payload: Payload<R>,
    raw: RawOutcome,
}

impl<R: ResultSet> QueryResult<R> {
    /// Apply `mode` to a reaped value.
    pub(crate) fn from_raw(sql: String, mode: QueryMode, raw: RawValue<R>) -> Self {
        let (payload, raw) = match raw {
            RawValue::Affected(done) => (Payload::None, RawOutcome::Affected(done)),
            RawValue::ResultSet(rows) => (post_process(mode, rows), RawOutcome::ResultSet),
        };
        Self { sql, payload, raw }
    }

    /// Executed SQL statement.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The post-processed value.
    pub fn value(&self) -> &Payload<R> {
        &self.payload
    }

    /// Mutable access to the post-processed value, e.g. to fetch rows.
    pub fn value_mut(&mut self) -> &mut Payload<R> {
        &mut self.payload
    }

    /// What the client returned, before mode post-processing.
    pub fn raw_value(&self) -> RawOutcome {
        self.raw
    }

    /// Affected-row counts of a statement without a result set.
    pub fn rows_affected(&self) -> Option<ExecuteResult> {
        match self.raw {
            RawOutcome::Affected(done) => Some(done),
            RawOutcome::ResultSet => None,
        }
    }

    /// The first row, in FirstRowOnly mode.
    pub fn first_row(&self) -> Option<&Row> {
        match &self.payload {
            Payload::Row(row) => Some(row),
            _ => None,
        }
    }

    /// The first value, in FirstValueOnly mode.
    pub fn first_value(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The first value converted to `T`; `None` when there was no row.
    pub fn scalar<T: FromValue>(&self) -> Result<Option<T>> {
        self.first_value().cloned().map(T::from_value).transpose()
    }

    /// Mutable access to the open result set, in Normal mode.
    pub fn result_set(&mut self) -> Option<&mut R> {
        match &mut self.payload {
            Payload::ResultSet(rows) => Some(rows),
            _ => None,
        }
    }

    /// Take ownership of the open result set; releasing it becomes the caller's job.
    pub fn into_result_set(self) -> Option<R> {
        match self.payload {
            Payload::ResultSet(rows) => Some(rows),
            _ => None,
        }
    }

    /// Release the result set if one is still held. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Payload::ResultSet(rows) = &mut self.payload {
            rows.release();
            self.payload = Payload::None;
        }
    }
}

fn post_process<R: ResultSet>(mode: QueryMode, mut rows: R) -> Payload<R> {
    match mode {
        QueryMode::Normal => Payload::ResultSet(rows),
        QueryMode::ExecOnly => {
            rows.release();
            Payload::None
        }
        QueryMode::FirstRowOnly => {
            let first = rows.fetch_row();
            rows.release();
            first.map_or(Payload::None, Payload::Row)
        }
        QueryMode::FirstValueOnly => {
            let first = rows
                .fetch_row()
                .and_then(|row| row.into_values().into_iter().next());
            rows.release();
            first.map_or(Payload::None, Payload::Value)
        }
    }
}
