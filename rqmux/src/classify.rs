//! Classification of engine errors into recovery categories
//!
//! Every error raised by a client primitive is looked up by the pair
//! (operation name, engine error code). The table is seeded with the MySQL
//! codes that call for a specific recovery and can be extended at runtime.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::traits::{DriverError, ERRORED_SENTINEL, REJECTED_SENTINEL};

/// Operation names used as classification keys.
pub mod op {
    /// Starting a query
    pub const QUERY: &str = "query";
    /// The multi-connection readiness check
    pub const POLL: &str = "poll";
    /// Retrieving a completed query's result
    pub const REAP: &str = "reap";
    /// Liveness check after connecting
    pub const PING: &str = "ping";
    /// Opening a connection
    pub const CONNECT: &str = "connect";
}

/// Recovery category of an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// No specific recovery is known.
    #[default]
    Unclassified,
    /// The connection is unusable; discard it and connect again.
    ConnectionFatal,
    /// Deadlock or lock wait timeout; back off and retry the transaction.
    LockContention,
}

impl ErrorCategory {
    pub fn is_connection_error(self) -> bool {
        self == ErrorCategory::ConnectionFatal
    }

    pub fn is_lock_error(self) -> bool {
        self == ErrorCategory::LockContention
    }
}

type Table = HashMap<(String, i32), ErrorCategory>;

/// Lookup table from (operation, code) to [`ErrorCategory`].
///
/// Cloning is cheap and clones share the same table, so an entry added
/// through one handle is visible to every dispatcher holding another.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    table: Arc<RwLock<Table>>,
}

impl ErrorClassifier {
    /// The process-wide table, seeded on first use.
    pub fn global() -> &'static ErrorClassifier {
        static GLOBAL: OnceLock<ErrorClassifier> = OnceLock::new();
        GLOBAL.get_or_init(ErrorClassifier::seeded)
    }

    /// A private table with the default seed.
    pub fn seeded() -> Self {
        let classifier = Self::empty();
        for &(operation, code, category) in SEED {
            classifier.add(operation, code, category);
        }
        classifier
    }

    /// A private table with no entries.
    pub fn empty() -> Self {
        Self {
            table: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register (or replace) the category of a pair.
    pub fn add(&self, operation: impl Into<String>, code: i32, category: ErrorCategory) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((operation.into(), code), category);
    }

    /// Forget a pair; later lookups yield `Unclassified`.
    pub fn remove(&self, operation: &str, code: i32) -> Option<ErrorCategory> {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(operation.to_string(), code))
    }

    /// Category of a pair; `Unclassified` when it is not registered.
    pub fn category(&self, operation: &str, code: i32) -> ErrorCategory {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(operation.to_string(), code))
            .copied()
            .unwrap_or_default()
    }

    /// Snapshot of the table, sorted by operation and code.
    pub fn entries(&self) -> Vec<(String, i32, ErrorCategory)> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = table
            .iter()
            .map(|((operation, code), category)| (operation.clone(), *code, *category))
            .collect();
        entries.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        entries
    }

    /// Turn a raw client error into a classified [`EngineError`].
    pub fn classify(&self, operation: &str, error: DriverError, sql: Option<&str>) -> EngineError {
        EngineError {
            operation: operation.to_string(),
            code: error.code,
            category: self.category(operation, error.code),
            message: error.message,
            sql: sql.map(str::to_string),
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::global().clone()
    }
}

const DEADLOCK: i32 = 1213;
const LOCK_WAIT_TIMEOUT: i32 = 1205;
const POLL_NOT_COMPLETED: i32 = -1;
const COULDNT_FETCH: i32 = 2;
const SERVER_GONE_AWAY: i32 = 2006;
const SERVER_LOST: i32 = 2013;

const SEED: &[(&str, i32, ErrorCategory)] = &[
    (op::QUERY, DEADLOCK, ErrorCategory::LockContention),
    (op::REAP, DEADLOCK, ErrorCategory::LockContention),
    (op::QUERY, LOCK_WAIT_TIMEOUT, ErrorCategory::LockContention),
    (op::REAP, LOCK_WAIT_TIMEOUT, ErrorCategory::LockContention),
    // a failed readiness check is treated as transient so callers retry
    (op::POLL, POLL_NOT_COMPLETED, ErrorCategory::LockContention),
    (op::POLL, ERRORED_SENTINEL, ErrorCategory::LockContention),
    (op::POLL, REJECTED_SENTINEL, ErrorCategory::LockContention),
    (op::QUERY, COULDNT_FETCH, ErrorCategory::ConnectionFatal),
    (op::REAP, COULDNT_FETCH, ErrorCategory::ConnectionFatal),
    (op::PING, COULDNT_FETCH, ErrorCategory::ConnectionFatal),
    (op::QUERY, SERVER_GONE_AWAY, ErrorCategory::ConnectionFatal),
    (op::REAP, SERVER_GONE_AWAY, ErrorCategory::ConnectionFatal),
    (op::PING, SERVER_GONE_AWAY, ErrorCategory::ConnectionFatal),
    (op::QUERY, SERVER_LOST, ErrorCategory::ConnectionFatal),
    (op::REAP, SERVER_LOST, ErrorCategory::ConnectionFatal),
    (op::PING, SERVER_LOST, ErrorCategory::ConnectionFatal),
];
