//! Scripted client doubles for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::ConnectionSettings;
use crate::row::Row;
use crate::traits::{
    AsyncDriver, BufferedResultSet, ConnectFlags, ConnectionId, Connector, DriverError,
    ExecuteResult, PollOutcome, RawValue, ResultSet,
};
use crate::value::Value;

/// Connection handle of [`FakeDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FakeConn(pub ConnectionId);

impl FakeConn {
    pub fn new(id: u64) -> Self {
        Self(ConnectionId::new(id))
    }
}

/// What a connection reports once its query is reaped.
#[derive(Debug, Clone)]
pub enum Completion {
    Rows(Vec<&'static str>, Vec<Vec<Value>>),
    Affected(u64),
    Fail(DriverError),
    Nothing,
}

/// Result set that counts how often it was released.
#[derive(Debug)]
pub struct TrackedRows {
    inner: BufferedResultSet,
    releases: Arc<AtomicUsize>,
}

impl ResultSet for TrackedRows {
    fn columns(&self) -> &[String] {
        self.inner.columns()
    }

    fn row_count(&self) -> usize {
        self.inner.row_count()
    }

    fn fetch_row(&mut self) -> Option<Row> {
        self.inner.fetch_row()
    }

    fn release(&mut self) {
        if !self.inner.is_released() {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.release();
    }

    fn is_released(&self) -> bool {
        self.inner.is_released()
    }
}

#[derive(Default)]
struct DriverState {
    started: Vec<(ConnectionId, String)>,
    start_errors: HashMap<ConnectionId, DriverError>,
    completed: HashMap<ConnectionId, Completion>,
    errored: HashSet<ConnectionId>,
    rejected: HashSet<ConnectionId>,
    broken: HashMap<ConnectionId, DriverError>,
    batch_error: Option<DriverError>,
    last_errors: HashMap<ConnectionId, DriverError>,
    poll_calls: usize,
}

/// In-memory [`AsyncDriver`] whose outcomes are scripted by the test.
#[derive(Clone, Default)]
pub struct FakeDriver {
    state: Arc<Mutex<DriverState>>,
    releases: Arc<AtomicUsize>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap()
    }

    /// Finish the query running on `conn`.
    pub fn complete(&self, conn: FakeConn, completion: Completion) {
        self.lock().completed.insert(conn.0, completion);
    }

    pub fn mark_errored(&self, conn: FakeConn) {
        self.lock().errored.insert(conn.0);
    }

    pub fn mark_rejected(&self, conn: FakeConn) {
        self.lock().rejected.insert(conn.0);
    }

    /// Every poll that includes `conn` fails with `error`.
    pub fn break_connection(&self, conn: FakeConn, error: DriverError) {
        self.lock().broken.insert(conn.0, error);
    }

    /// Polls over more than one connection fail with `error`.
    pub fn break_batch_polls(&self, error: DriverError) {
        self.lock().batch_error = Some(error);
    }

    pub fn fail_start(&self, conn: FakeConn, error: DriverError) {
        self.lock().start_errors.insert(conn.0, error);
    }

    pub fn set_last_error(&self, conn: FakeConn, error: DriverError) {
        self.lock().last_errors.insert(conn.0, error);
    }

    pub fn started(&self) -> Vec<(ConnectionId, String)> {
        self.lock().started.clone()
    }

    pub fn poll_calls(&self) -> usize {
        self.lock().poll_calls
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl AsyncDriver for FakeDriver {
    type Conn = FakeConn;
    type Rows = TrackedRows;

    fn connection_id(&self, conn: &FakeConn) -> ConnectionId {
        conn.0
    }

    fn start_query(&self, conn: &FakeConn, sql: &str) -> Result<(), DriverError> {
        let mut state = self.lock();
        if let Some(error) = state.start_errors.remove(&conn.0) {
            return Err(error);
        }
        state.started.push((conn.0, sql.to_string()));
        Ok(())
    }

    fn poll_many(&self, conns: &[FakeConn]) -> Result<PollOutcome, DriverError> {
        let mut state = self.lock();
        state.poll_calls += 1;
        if let Some(error) = conns.iter().find_map(|c| state.broken.get(&c.0)) {
            return Err(error.clone());
        }
        if conns.len() > 1 {
            if let Some(error) = &state.batch_error {
                return Err(error.clone());
            }
        }

        let mut outcome = PollOutcome::default();
        for conn in conns {
            if state.errored.contains(&conn.0) {
                outcome.errored.push(conn.0);
            } else if state.rejected.contains(&conn.0) {
                outcome.rejected.push(conn.0);
            } else if state.completed.contains_key(&conn.0) {
                outcome.ready.push(conn.0);
            }
        }
        Ok(outcome)
    }

    fn reap_result(&self, conn: &FakeConn) -> Result<Option<RawValue<TrackedRows>>, DriverError> {
        let completion = self.lock().completed.remove(&conn.0);
        match completion {
            Some(Completion::Rows(columns, rows)) => {
                let columns: Vec<String> = columns.into_iter().map(String::from).collect();
                Ok(Some(RawValue::ResultSet(TrackedRows {
                    inner: BufferedResultSet::new(columns, rows),
                    releases: Arc::clone(&self.releases),
                })))
            }
            Some(Completion::Affected(rows_affected)) => {
                Ok(Some(RawValue::Affected(ExecuteResult {
                    rows_affected,
                    last_insert_id: None,
                })))
            }
            Some(Completion::Fail(error)) => Err(error),
            Some(Completion::Nothing) | None => Ok(None),
        }
    }

    fn last_error(&self, conn: &FakeConn) -> Option<DriverError> {
        self.lock().last_errors.get(&conn.0).cloned()
    }
}

/// How one connection attempt of [`FakeConnector`] turns out.
#[derive(Debug, Clone)]
pub enum Attempt {
    Succeed,
    /// Validation ping fails; the handle also reports a connect error.
    PingFails(DriverError),
    /// Ping succeeds but the handle reports a connect error.
    ConnectFails(DriverError),
    /// The connect primitive returns `false` without leaving an error; the
    /// handle still answers pings.
    Refused,
}

/// Handle produced by [`FakeConnector`].
#[derive(Debug, Clone, PartialEq)]
pub struct FakeHandle {
    pub attempt: usize,
    pub connected: bool,
    pub flags: ConnectFlags,
    ping_error: Option<DriverError>,
    connect_error: Option<DriverError>,
}

#[derive(Default)]
struct ConnectorState {
    attempts: usize,
    plan: VecDeque<Attempt>,
    fallback: Option<Attempt>,
    hosts: Vec<String>,
}

/// [`Connector`] following a scripted list of attempt outcomes.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    /// Attempts follow `plan`, then repeat `fallback`.
    pub fn scripted(plan: Vec<Attempt>, fallback: Attempt) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectorState {
                plan: plan.into(),
                fallback: Some(fallback),
                ..Default::default()
            })),
        }
    }

    pub fn always(attempt: Attempt) -> Self {
        Self::scripted(Vec::new(), attempt)
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    /// Hosts every attempt connected to.
    pub fn hosts(&self) -> Vec<String> {
        self.state.lock().unwrap().hosts.clone()
    }

    fn next(&self, settings: &ConnectionSettings) -> (usize, Attempt) {
        let mut state = self.state.lock().unwrap();
        let number = state.attempts;
        state.attempts += 1;
        state.hosts.push(settings.host.clone());
        let attempt = match state.plan.pop_front() {
            Some(attempt) => attempt,
            None => state.fallback.clone().unwrap_or(Attempt::Succeed),
        };
        (number, attempt)
    }

    fn apply(handle: &mut FakeHandle, number: usize, attempt: Attempt) {
        handle.attempt = number;
        match attempt {
            Attempt::Succeed => {
                handle.connected = true;
                handle.ping_error = None;
                handle.connect_error = None;
            }
            Attempt::PingFails(error) => {
                handle.connected = false;
                handle.ping_error = Some(error.clone());
                handle.connect_error = Some(error);
            }
            Attempt::ConnectFails(error) => {
                handle.connected = false;
                handle.ping_error = None;
                handle.connect_error = Some(error);
            }
            Attempt::Refused => {
                handle.connected = false;
                handle.ping_error = None;
                handle.connect_error = None;
            }
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Conn = FakeHandle;

    fn init(&self) -> FakeHandle {
        FakeHandle {
            attempt: 0,
            connected: false,
            flags: ConnectFlags::NONE,
            ping_error: Some(DriverError::new(2006, "MySQL server has gone away")),
            connect_error: None,
        }
    }

    async fn open(&self, settings: &ConnectionSettings) -> FakeHandle {
        let mut handle = self.init();
        let (number, attempt) = self.next(settings);
        Self::apply(&mut handle, number, attempt);
        handle
    }

    async fn real_connect(
        &self,
        conn: &mut FakeHandle,
        settings: &ConnectionSettings,
        flags: ConnectFlags,
    ) -> bool {
        let (number, attempt) = self.next(settings);
        conn.flags = flags;
        Self::apply(conn, number, attempt);
        conn.connected
    }

    async fn ping(&self, conn: &mut FakeHandle) -> Result<(), DriverError> {
        match &conn.ping_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn connect_error(&self, conn: &FakeHandle) -> Option<DriverError> {
        conn.connect_error.clone()
    }
}
