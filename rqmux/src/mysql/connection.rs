//! MySQL connection handle shared between the caller and the driver

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::Result;
use crate::traits::{ConnectionId, DriverError, ExecuteResult};
use crate::value::Value;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// What a finished query produced, before it is handed to the dispatcher.
pub(crate) enum Outcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Affected(ExecuteResult),
}

pub(crate) type Completion = (mysql_async::Conn, std::result::Result<Outcome, DriverError>);

#[derive(Default)]
pub(crate) struct ConnState {
    /// Idle connection; `None` while a query owns it or after a failure
    pub(crate) conn: Option<mysql_async::Conn>,
    pub(crate) inflight: Option<oneshot::Receiver<Completion>>,
    pub(crate) completed: Option<std::result::Result<Outcome, DriverError>>,
    pub(crate) last_error: Option<DriverError>,
    pub(crate) connect_error: Option<DriverError>,
}

/// A single MySQL connection usable with [`QueryDispatcher`](crate::QueryDispatcher).
///
/// Cloning is cheap: clones refer to the same underlying connection and
/// share its identity, so submitting on a clone of a busy handle is
/// rejected like submitting on the handle itself.
#[derive(Clone)]
pub struct MySqlConnection {
    id: ConnectionId,
    state: Arc<Mutex<ConnState>>,
}

impl MySqlConnection {
    /// A handle that is not connected yet.
    pub(crate) fn unconnected() -> Self {
        Self {
            id: ConnectionId::new(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            state: Arc::new(Mutex::new(ConnState::default())),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the handle holds an established connection (idle or busy).
    pub fn is_connected(&self) -> bool {
        let state = self.lock();
        state.conn.is_some() || state.inflight.is_some() || state.completed.is_some()
    }

    /// Whether a query has been started and not reaped yet.
    pub fn is_busy(&self) -> bool {
        let state = self.lock();
        state.inflight.is_some() || state.completed.is_some()
    }

    /// Error of the last failed connection attempt.
    pub fn connect_error(&self) -> Option<DriverError> {
        self.lock().connect_error.clone()
    }

    /// Error of the last failed query or command.
    pub fn last_error(&self) -> Option<DriverError> {
        self.lock().last_error.clone()
    }

    /// Close the connection if it is idle.
    pub async fn disconnect(&self) -> Result<()> {
        let conn = self.lock().conn.take();
        if let Some(conn) = conn {
            conn.disconnect().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("busy", &self.is_busy())
            .finish()
    }
}
