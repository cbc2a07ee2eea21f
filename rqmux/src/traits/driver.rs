//! Non-blocking query primitives the dispatcher multiplexes over

use std::fmt;

use thiserror::Error;

use crate::traits::ResultSet;

/// Error code reported for a connection the poll marked as errored without
/// the connection carrying an errno of its own.
pub const ERRORED_SENTINEL: i32 = 50001;

/// Error code reported for a connection the poll rejected without the
/// connection carrying an errno of its own.
pub const REJECTED_SENTINEL: i32 = 50002;

/// Identity of one live connection.
///
/// Two handles with the same id are the same connection; the dispatcher
/// keys its in-flight queries by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw identity value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw identity value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw error as reported by the database client: an engine code and message.
///
/// Primitives return this directly instead of raising through a side channel,
/// so classification always works on an explicit code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct DriverError {
    /// Engine error code (`errno`)
    pub code: i32,
    /// Engine error message
    pub message: String,
}

impl DriverError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Result of a statement that produced no result set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecuteResult {
    /// Number of rows affected by the query
    pub rows_affected: u64,
    /// Last insert ID (for INSERT statements)
    pub last_insert_id: Option<u64>,
}

/// What reaping a completed query yields.
#[derive(Debug)]
pub enum RawValue<R> {
    /// The statement produced a result set; whoever holds it must release it.
    ResultSet(R),
    /// The statement completed without a result set.
    Affected(ExecuteResult),
}

/// Outcome of one non-blocking readiness check across many connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Connections whose query has completed and can be reaped
    pub ready: Vec<ConnectionId>,
    /// Connections that failed while their query was running
    pub errored: Vec<ConnectionId>,
    /// Connections the client refused to poll (e.g. nothing in flight)
    pub rejected: Vec<ConnectionId>,
}

impl PollOutcome {
    /// Nothing is ready and nothing failed.
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.errored.is_empty() && self.rejected.is_empty()
    }
}

/// The non-blocking query primitives of a database client.
///
/// None of these methods may block: `start_query` only sends the statement,
/// `poll_many` only checks readiness, and `reap_result` is only called for
/// connections `poll_many` reported ready.
pub trait AsyncDriver: Send + Sync + 'static {
    /// Connection handle. Clones refer to the same connection.
    type Conn: Clone + Send + Sync + 'static;

    /// Result set handed out for statements that return rows.
    type Rows: ResultSet + Send + 'static;

    /// Identity of a connection handle.
    fn connection_id(&self, conn: &Self::Conn) -> ConnectionId;

    /// Send `sql` on `conn` without waiting for the answer.
    fn start_query(&self, conn: &Self::Conn, sql: &str) -> Result<(), DriverError>;

    /// Check all `conns` for readiness at once.
    fn poll_many(&self, conns: &[Self::Conn]) -> Result<PollOutcome, DriverError>;

    /// Retrieve the outcome of the completed query on `conn`.
    ///
    /// `Ok(None)` means the client produced no usable payload without raising
    /// an error; the caller then consults [`AsyncDriver::last_error`].
    fn reap_result(&self, conn: &Self::Conn) -> Result<Option<RawValue<Self::Rows>>, DriverError>;

    /// The last error recorded on `conn`, if any.
    fn last_error(&self, conn: &Self::Conn) -> Option<DriverError>;
}
