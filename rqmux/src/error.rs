//! Error types for rqmux

use thiserror::Error;

use crate::classify::ErrorCategory;
use crate::traits::ConnectionId;

/// Result type alias for rqmux operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dispatching queries or reading their results
#[derive(Error, Debug)]
pub enum Error {
    /// A second query was submitted on a connection that still has one in flight.
    ///
    /// This is a contract violation by the caller and is never retried.
    #[error(
        "Connection {connection} is already running a query; open another connection to run \
         queries concurrently (SQL: {sql})"
    )]
    ConnectionInUse { connection: ConnectionId, sql: String },

    /// Classified failure reported by the database client
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The dispatcher was torn down before the query settled
    #[error("Query abandoned before it settled (SQL: {sql})")]
    Abandoned { sql: String },

    /// Type conversion error
    #[error("Type conversion error: expected {expected}, got {actual}")]
    TypeConversion {
        expected: &'static str,
        actual: String,
    },

    /// Column not found in row
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Null value for non-optional field
    #[error("Unexpected null value for column: {0}")]
    UnexpectedNull(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No async runtime or scheduler available
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// MySQL driver error
    #[cfg(feature = "mysql")]
    #[error("MySQL error: {0}")]
    MySql(#[from] mysql_async::Error),
}

impl Error {
    /// The classified engine error, if this is one.
    pub fn as_engine(&self) -> Option<&EngineError> {
        match self {
            Error::Engine(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the connection that produced this error must be re-established.
    pub fn is_connection_error(&self) -> bool {
        self.as_engine().is_some_and(EngineError::is_connection_error)
    }

    /// Whether the caller should back off and retry the transaction.
    pub fn is_lock_error(&self) -> bool {
        self.as_engine().is_some_and(EngineError::is_lock_error)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// A failure raised by one of the client primitives, annotated with the
/// operation that raised it and a recovery category.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Error at {operation}(): [{code}] {message}{}", sql_suffix(.sql))]
pub struct EngineError {
    /// Operation name used as the classification key (`query`, `poll`, `reap`, `ping`, ...)
    pub operation: String,
    /// Engine error code
    pub code: i32,
    /// Engine error message
    pub message: String,
    /// SQL text of the affected query, when there is one
    pub sql: Option<String>,
    /// Recovery category looked up from the classifier
    pub category: ErrorCategory,
}

impl EngineError {
    /// The connection may be broken; a new connection is needed for the next query.
    pub fn is_connection_error(&self) -> bool {
        self.category.is_connection_error()
    }

    /// The query was involved in a lock conflict (deadlock, lock wait timeout).
    ///
    /// Under SERIALIZABLE the whole transaction should be rolled back and restarted;
    /// at weaker isolation levels sleeping briefly and retrying the statement is enough.
    pub fn is_lock_error(&self) -> bool {
        self.category.is_lock_error()
    }
}

fn sql_suffix(sql: &Option<String>) -> String {
    match sql {
        Some(sql) => format!(", SQL: {}", sql),
        None => String::new(),
    }
}
