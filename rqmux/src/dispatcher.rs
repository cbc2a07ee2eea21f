//! Tick-driven multiplexer for queries running on many connections
//!
//! A query is started with the client's non-blocking primitive and parked as
//! a pending entry keyed by its connection. While at least one entry exists,
//! a periodic tick polls all pending connections at once, settles the ones
//! that finished or failed, and deregisters itself once nothing is left.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::classify::{op, ErrorClassifier};
use crate::config::DispatcherSettings;
use crate::error::{Error, Result};
use crate::result::{QueryMode, QueryResult};
use crate::scheduler::{Scheduler, TimerId};
use crate::traits::{
    AsyncDriver, ConnectionId, DriverError, PollOutcome, ResultSet, ERRORED_SENTINEL,
    REJECTED_SENTINEL,
};

/// Default interval between ticks while queries are pending.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// What to do when the readiness check itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollFailurePolicy {
    /// Fail every pending query with the poll error and stop ticking.
    #[default]
    DrainAll,
    /// Re-poll each pending connection alone and fail only the ones whose
    /// own poll fails; the rest stay pending.
    Isolate,
}

type Settlement<R> = Result<QueryResult<R>>;

struct PendingQuery<D: AsyncDriver> {
    conn: D::Conn,
    sql: String,
    mode: QueryMode,
    settle: oneshot::Sender<Settlement<D::Rows>>,
}

struct State<D: AsyncDriver> {
    pending: HashMap<ConnectionId, PendingQuery<D>>,
    timer: Option<TimerId>,
}

struct Shared<D: AsyncDriver, S> {
    driver: D,
    scheduler: S,
    classifier: ErrorClassifier,
    tick_interval: Duration,
    poll_failure_policy: PollFailurePolicy,
    state: Mutex<State<D>>,
}

/// Runs one SQL statement per connection concurrently and settles each
/// statement's [`QueryFuture`] from a periodic tick.
///
/// A connection carries at most one query at a time; submitting another on a
/// busy connection fails immediately with [`Error::ConnectionInUse`]. Use one
/// connection per statement you want in flight.
///
/// Cloning is cheap; clones share the same pending set and tick.
///
/// # Example
///
/// ```ignore
/// use rqmux::{MySqlDriver, QueryDispatcher, TokioScheduler};
///
/// let driver = MySqlDriver::new();
/// let dispatcher = QueryDispatcher::new(driver.clone(), TokioScheduler::current()?);
///
/// let a = dispatcher.exec_only(&conn_a, "SELECT SLEEP(1)");
/// let b = dispatcher.exec_only(&conn_b, "SELECT SLEEP(2)");
/// let (a, b) = futures::join!(a, b); // ~2s, not ~3s
/// ```
pub struct QueryDispatcher<D: AsyncDriver, S: Scheduler> {
    shared: Arc<Shared<D, S>>,
}

impl<D: AsyncDriver, S: Scheduler> Clone for QueryDispatcher<D, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: AsyncDriver, S: Scheduler> QueryDispatcher<D, S> {
    /// Create a dispatcher with the default tick interval, the global
    /// classifier and [`PollFailurePolicy::DrainAll`].
    pub fn new(driver: D, scheduler: S) -> Self {
        Self::builder(driver, scheduler).build()
    }

    /// Create a builder for configuring the dispatcher.
    pub fn builder(driver: D, scheduler: S) -> QueryDispatcherBuilder<D, S> {
        QueryDispatcherBuilder::new(driver, scheduler)
    }

    /// Run `sql` on `conn` and post-process its outcome according to `mode`.
    pub fn submit(
        &self,
        conn: &D::Conn,
        sql: impl Into<String>,
        mode: QueryMode,
    ) -> QueryFuture<D::Rows> {
        self.shared.submit(conn, sql.into(), mode)
    }

    /// Run `sql` and hand back the open result set ([`QueryMode::Normal`]).
    pub fn query(&self, conn: &D::Conn, sql: impl Into<String>) -> QueryFuture<D::Rows> {
        self.submit(conn, sql, QueryMode::Normal)
    }

    /// Run `sql` and discard its payload ([`QueryMode::ExecOnly`]).
    pub fn exec_only(&self, conn: &D::Conn, sql: impl Into<String>) -> QueryFuture<D::Rows> {
        self.submit(conn, sql, QueryMode::ExecOnly)
    }

    /// Run `sql` and keep only its first row ([`QueryMode::FirstRowOnly`]).
    pub fn first_row_only(&self, conn: &D::Conn, sql: impl Into<String>) -> QueryFuture<D::Rows> {
        self.submit(conn, sql, QueryMode::FirstRowOnly)
    }

    /// Run `sql` and keep only the first column of its first row
    /// ([`QueryMode::FirstValueOnly`]).
    pub fn first_value_only(
        &self,
        conn: &D::Conn,
        sql: impl Into<String>,
    ) -> QueryFuture<D::Rows> {
        self.submit(conn, sql, QueryMode::FirstValueOnly)
    }

    /// Run one polling round now, independent of the periodic timer.
    pub fn tick(&self) {
        self.shared.tick();
    }

    /// Number of queries still in flight.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Whether `conn` has a query in flight.
    pub fn is_pending(&self, conn: &D::Conn) -> bool {
        let id = self.shared.driver.connection_id(conn);
        self.shared.lock().pending.contains_key(&id)
    }

    /// Whether the periodic tick is registered.
    pub fn is_ticking(&self) -> bool {
        self.shared.lock().timer.is_some()
    }

    /// The client primitives this dispatcher drives.
    pub fn driver(&self) -> &D {
        &self.shared.driver
    }

    /// The classifier used for every error this dispatcher raises.
    pub fn classifier(&self) -> &ErrorClassifier {
        &self.shared.classifier
    }

    pub fn tick_interval(&self) -> Duration {
        self.shared.tick_interval
    }

    pub fn poll_failure_policy(&self) -> PollFailurePolicy {
        self.shared.poll_failure_policy
    }
}

impl<D: AsyncDriver, S: Scheduler> Shared<D, S> {
    fn lock(&self) -> MutexGuard<'_, State<D>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(self: &Arc<Self>, conn: &D::Conn, sql: String, mode: QueryMode) -> QueryFuture<D::Rows> {
        let id = self.driver.connection_id(conn);
        let mut state = self.lock();

        if state.pending.contains_key(&id) {
            return QueryFuture::settled(Err(Error::ConnectionInUse {
                connection: id,
                sql,
            }));
        }

        if let Err(e) = self.driver.start_query(conn, &sql) {
            let err = self.classifier.classify(op::QUERY, e, Some(&sql));
            debug!(connection = %id, code = err.code, "query failed to start");
            return QueryFuture::settled(Err(err.into()));
        }

        let (settle, receiver) = oneshot::channel();
        state.pending.insert(
            id,
            PendingQuery {
                conn: conn.clone(),
                sql: sql.clone(),
                mode,
                settle,
            },
        );
        trace!(connection = %id, ?mode, pending = state.pending.len(), "query started");

        if state.timer.is_none() {
            let shared = Arc::clone(self);
            let timer = self
                .scheduler
                .register_periodic(self.tick_interval, Box::new(move || shared.tick()));
            state.timer = Some(timer);
            debug!(interval = ?self.tick_interval, "dispatcher tick registered");
        }

        QueryFuture::waiting(sql, receiver)
    }

    fn tick(&self) {
        let mut state = self.lock();
        if state.pending.is_empty() {
            self.stop_if_idle(&mut state);
            return;
        }

        let conns: Vec<D::Conn> = state.pending.values().map(|q| q.conn.clone()).collect();
        let outcome = match self.driver.poll_many(&conns) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.on_poll_failure(&mut state, e);
                self.stop_if_idle(&mut state);
                return;
            }
        };

        if outcome.is_idle() {
            return;
        }

        self.apply_outcome(&mut state, &outcome);
        self.stop_if_idle(&mut state);
    }

    fn apply_outcome(&self, state: &mut State<D>, outcome: &PollOutcome) {
        // failures first, so a connection is never both failed and reaped
        for id in &outcome.errored {
            if let Some(query) = state.pending.remove(id) {
                self.fail_polled(query, ERRORED_SENTINEL, "The query got an error");
            }
        }
        for id in &outcome.rejected {
            if let Some(query) = state.pending.remove(id) {
                self.fail_polled(query, REJECTED_SENTINEL, "The query has been rejected");
            }
        }
        for id in &outcome.ready {
            if let Some(query) = state.pending.remove(id) {
                self.reap(*id, query);
            }
        }
    }

    fn on_poll_failure(&self, state: &mut State<D>, error: DriverError) {
        match self.poll_failure_policy {
            PollFailurePolicy::DrainAll => {
                warn!(
                    code = error.code,
                    pending = state.pending.len(),
                    "poll failed; failing every pending query"
                );
                for (_, query) in state.pending.drain() {
                    let err = self
                        .classifier
                        .classify(op::POLL, error.clone(), Some(&query.sql));
                    settle(query.settle, Err(err.into()));
                }
            }
            PollFailurePolicy::Isolate => {
                warn!(
                    code = error.code,
                    pending = state.pending.len(),
                    "poll failed; re-polling connections one by one"
                );
                let ids: Vec<ConnectionId> = state.pending.keys().copied().collect();
                for id in ids {
                    let Some(query) = state.pending.get(&id) else {
                        continue;
                    };
                    match self.driver.poll_many(std::slice::from_ref(&query.conn)) {
                        Ok(outcome) => self.apply_outcome(state, &outcome),
                        Err(e) => {
                            if let Some(query) = state.pending.remove(&id) {
                                debug!(connection = %id, code = e.code, "isolated poll failure");
                                let err = self.classifier.classify(op::POLL, e, Some(&query.sql));
                                settle(query.settle, Err(err.into()));
                            }
                        }
                    }
                }
            }
        }
    }

    fn fail_polled(&self, query: PendingQuery<D>, sentinel: i32, what: &str) {
        let error = match self.driver.last_error(&query.conn) {
            Some(e) if e.code != 0 => DriverError::new(e.code, format!("{}: {}", what, e.message)),
            _ => DriverError::new(sentinel, format!("{} (poll)", what)),
        };
        let err = self.classifier.classify(op::POLL, error, Some(&query.sql));
        debug!(code = err.code, sql = %query.sql, "{}", what);
        settle(query.settle, Err(err.into()));
    }

    fn reap(&self, id: ConnectionId, query: PendingQuery<D>) {
        let PendingQuery {
            conn,
            sql,
            mode,
            settle: sender,
        } = query;

        let settlement = match self.driver.reap_result(&conn) {
            Ok(Some(raw)) => Ok(QueryResult::from_raw(sql, mode, raw)),
            Ok(None) => {
                // polled as ready but nothing usable came back
                let error = self
                    .driver
                    .last_error(&conn)
                    .unwrap_or_else(|| DriverError::new(0, "no result was returned"));
                Err(self.classifier.classify(op::REAP, error, Some(&sql)).into())
            }
            Err(e) => Err(self.classifier.classify(op::REAP, e, Some(&sql)).into()),
        };
        trace!(connection = %id, ok = settlement.is_ok(), "query settled");
        settle(sender, settlement);
    }

    fn stop_if_idle(&self, state: &mut State<D>) {
        if !state.pending.is_empty() {
            return;
        }
        if let Some(timer) = state.timer.take() {
            self.scheduler.cancel_periodic(timer);
            debug!("dispatcher tick deregistered");
        }
    }
}

fn settle<R: ResultSet>(sender: oneshot::Sender<Settlement<R>>, settlement: Settlement<R>) {
    // nobody is waiting anymore; free a result set nobody will release
    if let Err(Ok(mut orphan)) = sender.send(settlement) {
        orphan.release();
    }
}

/// Builder for [`QueryDispatcher`].
pub struct QueryDispatcherBuilder<D, S> {
    driver: D,
    scheduler: S,
    tick_interval: Duration,
    classifier: Option<ErrorClassifier>,
    poll_failure_policy: PollFailurePolicy,
}

impl<D: AsyncDriver, S: Scheduler> QueryDispatcherBuilder<D, S> {
    pub fn new(driver: D, scheduler: S) -> Self {
        Self {
            driver,
            scheduler,
            tick_interval: DEFAULT_TICK_INTERVAL,
            classifier: None,
            poll_failure_policy: PollFailurePolicy::default(),
        }
    }

    /// Interval between polling rounds while queries are pending.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Use a specific classifier instead of the global one.
    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn poll_failure_policy(mut self, policy: PollFailurePolicy) -> Self {
        self.poll_failure_policy = policy;
        self
    }

    /// Apply tick interval and poll failure policy from settings.
    pub fn settings(self, settings: &DispatcherSettings) -> Self {
        self.tick_interval(settings.tick_interval())
            .poll_failure_policy(settings.poll_failure_policy)
    }

    pub fn build(self) -> QueryDispatcher<D, S> {
        QueryDispatcher {
            shared: Arc::new(Shared {
                driver: self.driver,
                scheduler: self.scheduler,
                classifier: self.classifier.unwrap_or_default(),
                tick_interval: self.tick_interval,
                poll_failure_policy: self.poll_failure_policy,
                state: Mutex::new(State {
                    pending: HashMap::new(),
                    timer: None,
                }),
            }),
        }
    }
}

/// Future of one submitted query.
///
/// Settles exactly once: with the [`QueryResult`] when the query completed,
/// or with an [`Error`]. Dropping it does not cancel the query; a result set
/// produced for a dropped future is released by the dispatcher.
#[must_use = "the query runs regardless, but its outcome is lost unless awaited"]
pub struct QueryFuture<R> {
    inner: FutureState<R>,
}

enum FutureState<R> {
    Settled(Option<Settlement<R>>),
    Waiting {
        sql: String,
        receiver: oneshot::Receiver<Settlement<R>>,
    },
}

impl<R> QueryFuture<R> {
    fn settled(settlement: Settlement<R>) -> Self {
        Self {
            inner: FutureState::Settled(Some(settlement)),
        }
    }

    fn waiting(sql: String, receiver: oneshot::Receiver<Settlement<R>>) -> Self {
        Self {
            inner: FutureState::Waiting { sql, receiver },
        }
    }

    /// Whether the outcome was already known when the query was submitted
    /// (contract violation or a start failure).
    pub fn is_settled_early(&self) -> bool {
        matches!(self.inner, FutureState::Settled(_))
    }
}

// no field is structurally pinned
impl<R> Unpin for QueryFuture<R> {}

impl<R> Future for QueryFuture<R> {
    type Output = Settlement<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            FutureState::Settled(slot) => Poll::Ready(slot.take().unwrap_or_else(|| {
                Err(Error::Runtime("QueryFuture polled after completion".into()))
            })),
            FutureState::Waiting { sql, receiver } => Pin::new(receiver).poll(cx).map(|r| {
                r.unwrap_or_else(|_| {
                    Err(Error::Abandoned {
                        sql: std::mem::take(sql),
                    })
                })
            }),
        }
    }
}

impl<R> std::fmt::Debug for QueryFuture<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            FutureState::Settled(_) => f.write_str("QueryFuture(settled)"),
            FutureState::Waiting { sql, .. } => write!(f, "QueryFuture(waiting: {})", sql),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorCategory;
    use crate::result::Payload;
    use crate::scheduler::ManualScheduler;
    use crate::testing::{Completion, FakeConn, FakeDriver};
    use crate::value::Value;
    use futures::FutureExt;

    fn setup() -> (FakeDriver, ManualScheduler, QueryDispatcher<FakeDriver, ManualScheduler>) {
        let driver = FakeDriver::new();
        let scheduler = ManualScheduler::new();
        let dispatcher = QueryDispatcher::new(driver.clone(), scheduler.clone());
        (driver, scheduler, dispatcher)
    }

    fn engine_error<R>(outcome: Option<Settlement<R>>) -> crate::error::EngineError {
        match outcome {
            Some(Err(Error::Engine(e))) => e,
            Some(Err(other)) => panic!("expected engine error, got {:?}", other),
            Some(Ok(_)) => panic!("expected engine error, got a result"),
            None => panic!("future not settled"),
        }
    }

    #[test]
    fn test_settles_all_ready_in_one_tick() {
        let (driver, scheduler, dispatcher) = setup();
        let conns: Vec<FakeConn> = (1..=3).map(FakeConn::new).collect();
        let mut futures: Vec<_> = conns
            .iter()
            .map(|c| dispatcher.exec_only(c, "SELECT SLEEP(1)"))
            .collect();

        assert_eq!(dispatcher.pending_count(), 3);
        assert!(dispatcher.is_ticking());
        assert_eq!(scheduler.active_timers(), 1);

        scheduler.advance();
        assert_eq!(dispatcher.pending_count(), 3);
        assert!(futures.iter_mut().all(|f| f.now_or_never().is_none()));

        for conn in &conns {
            driver.complete(*conn, Completion::Affected(0));
        }
        scheduler.advance();

        for future in futures {
            let result = future.now_or_never().unwrap().unwrap();
            assert!(result.value().is_none());
        }
        assert_eq!(dispatcher.pending_count(), 0);
        assert!(!dispatcher.is_ticking());
        assert_eq!(scheduler.active_timers(), 0);
    }

    #[test]
    fn test_single_timer_for_many_queries() {
        let (_driver, scheduler, dispatcher) = setup();
        let _a = dispatcher.query(&FakeConn::new(1), "SELECT 1");
        let _b = dispatcher.query(&FakeConn::new(2), "SELECT 2");
        assert_eq!(scheduler.active_timers(), 1);
    }

    #[test]
    fn test_connection_in_use_is_rejected_synchronously() {
        let (driver, _scheduler, dispatcher) = setup();
        let conn = FakeConn::new(7);
        let first = dispatcher.first_value_only(&conn, "SELECT 1");
        let second = dispatcher.first_value_only(&conn, "SELECT 2");

        assert!(second.is_settled_early());
        match second.now_or_never() {
            Some(Err(Error::ConnectionInUse { connection, sql })) => {
                assert_eq!(connection, conn.0);
                assert_eq!(sql, "SELECT 2");
            }
            other => panic!("unexpected outcome: {:?}", other.map(|r| r.is_ok())),
        }
        assert_eq!(driver.started().len(), 1);
        assert_eq!(dispatcher.pending_count(), 1);

        driver.complete(conn, Completion::Rows(vec!["1"], vec![vec![Value::I64(1)]]));
        dispatcher.tick();
        let result = first.now_or_never().unwrap().unwrap();
        assert_eq!(result.first_value(), Some(&Value::I64(1)));
    }

    #[test]
    fn test_connection_reusable_after_settlement() {
        let (driver, _scheduler, dispatcher) = setup();
        let conn = FakeConn::new(1);
        let first = dispatcher.exec_only(&conn, "DO 1");
        driver.complete(conn, Completion::Affected(0));
        dispatcher.tick();
        assert!(first.now_or_never().unwrap().is_ok());

        let second = dispatcher.exec_only(&conn, "DO 2");
        assert!(!second.is_settled_early());
        assert!(dispatcher.is_pending(&conn));
    }

    #[test]
    fn test_start_failure_is_classified_and_not_registered() {
        let (driver, scheduler, dispatcher) = setup();
        let conn = FakeConn::new(1);
        driver.fail_start(conn, DriverError::new(2006, "MySQL server has gone away"));

        let future = dispatcher.query(&conn, "SELECT 1");
        let err = engine_error(future.now_or_never());
        assert_eq!(err.operation, op::QUERY);
        assert_eq!(err.code, 2006);
        assert_eq!(err.category, ErrorCategory::ConnectionFatal);
        assert_eq!(err.sql.as_deref(), Some("SELECT 1"));
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(scheduler.active_timers(), 0);
    }

    #[test]
    fn test_errored_connection_uses_sentinel() {
        let (driver, _scheduler, dispatcher) = setup();
        let conn = FakeConn::new(1);
        let future = dispatcher.query(&conn, "SELECT 1");
        driver.mark_errored(conn);
        dispatcher.tick();

        let err = engine_error(future.now_or_never());
        assert_eq!(err.operation, op::POLL);
        assert_eq!(err.code, ERRORED_SENTINEL);
        assert!(err.is_lock_error());
        assert!(!dispatcher.is_ticking());
    }

    #[test]
    fn test_errored_connection_prefers_client_error() {
        let (driver, _scheduler, dispatcher) = setup();
        let conn = FakeConn::new(1);
        let future = dispatcher.query(&conn, "SELECT 1");
        driver.set_last_error(conn, DriverError::new(2013, "Lost connection"));
        driver.mark_errored(conn);
        dispatcher.tick();

        let err = engine_error(future.now_or_never());
        assert_eq!(err.code, 2013);
        assert_eq!(err.operation, op::POLL);
        // 2013 is only connection-fatal for query, reap and ping
        assert_eq!(err.category, ErrorCategory::Unclassified);
    }

    #[test]
    fn test_rejected_connection_uses_sentinel() {
        let (driver, _scheduler, dispatcher) = setup();
        let ok = FakeConn::new(1);
        let rejected = FakeConn::new(2);
        let ok_future = dispatcher.exec_only(&ok, "DO 1");
        let rejected_future = dispatcher.exec_only(&rejected, "DO 2");

        driver.mark_rejected(rejected);
        driver.complete(ok, Completion::Affected(1));
        dispatcher.tick();

        let err = engine_error(rejected_future.now_or_never());
        assert_eq!(err.code, REJECTED_SENTINEL);
        assert_eq!(err.category, ErrorCategory::LockContention);
        assert!(ok_future.now_or_never().unwrap().is_ok());
    }

    #[test]
    fn test_reap_error_is_classified() {
        let (driver, _scheduler, dispatcher) = setup();
        let conn = FakeConn::new(1);
        let future = dispatcher.exec_only(&conn, "UPDATE t SET a = 1");
        driver.complete(
            conn,
            Completion::Fail(DriverError::new(1213, "Deadlock found when trying to get lock")),
        );
        dispatcher.tick();

        let err = engine_error(future.now_or_never());
        assert_eq!(err.operation, op::REAP);
        assert_eq!(err.code, 1213);
        assert!(err.is_lock_error());
        assert_eq!(
            err.to_string(),
            "Error at reap(): [1213] Deadlock found when trying to get lock, SQL: UPDATE t SET a = 1"
        );
    }

    #[test]
    fn test_reap_without_result_uses_last_error() {
        let (driver, _scheduler, dispatcher) = setup();
        let conn = FakeConn::new(1);
        let future = dispatcher.query(&conn, "SELECT * FROM missing");
        driver.set_last_error(conn, DriverError::new(1146, "Table 'db.missing' doesn't exist"));
        driver.complete(conn, Completion::Nothing);
        dispatcher.tick();

        let err = engine_error(future.now_or_never());
        assert_eq!(err.operation, op::REAP);
        assert_eq!(err.code, 1146);
        assert_eq!(err.category, ErrorCategory::Unclassified);
    }

    #[test]
    fn test_poll_failure_drains_everything() {
        let (driver, scheduler, dispatcher) = setup();
        let a = FakeConn::new(1);
        let b = FakeConn::new(2);
        let fa = dispatcher.exec_only(&a, "DO 1");
        let fb = dispatcher.exec_only(&b, "DO 2");
        driver.break_connection(a, DriverError::new(-1, "poll failed"));

        scheduler.advance();

        for future in [fa, fb] {
            let err = engine_error(future.now_or_never());
            assert_eq!(err.operation, op::POLL);
            assert_eq!(err.code, -1);
            assert!(err.is_lock_error());
        }
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(scheduler.active_timers(), 0);
    }

    #[test]
    fn test_poll_failure_isolates_broken_connection() {
        let driver = FakeDriver::new();
        let scheduler = ManualScheduler::new();
        let dispatcher = QueryDispatcher::builder(driver.clone(), scheduler.clone())
            .poll_failure_policy(PollFailurePolicy::Isolate)
            .build();

        let broken = FakeConn::new(1);
        let healthy = FakeConn::new(2);
        let broken_future = dispatcher.exec_only(&broken, "DO 1");
        let healthy_future = dispatcher.exec_only(&healthy, "DO 2");
        driver.break_connection(broken, DriverError::new(2006, "gone away"));

        scheduler.advance();
        let err = engine_error(broken_future.now_or_never());
        assert_eq!(err.code, 2006);
        assert_eq!(err.operation, op::POLL);
        assert!(dispatcher.is_pending(&healthy));
        assert!(dispatcher.is_ticking());

        driver.complete(healthy, Completion::Affected(0));
        scheduler.advance();
        assert!(healthy_future.now_or_never().unwrap().is_ok());
        assert!(!dispatcher.is_ticking());
    }

    #[test]
    fn test_isolate_settles_outcomes_of_single_polls() {
        let driver = FakeDriver::new();
        let scheduler = ManualScheduler::new();
        let dispatcher = QueryDispatcher::builder(driver.clone(), scheduler.clone())
            .poll_failure_policy(PollFailurePolicy::Isolate)
            .build();

        let failing = FakeConn::new(1);
        let finished = FakeConn::new(2);
        let failing_future = dispatcher.exec_only(&failing, "DO 1");
        let finished_future = dispatcher.first_value_only(&finished, "SELECT 2");
        driver.break_batch_polls(DriverError::new(-1, "poll failed"));
        driver.mark_errored(failing);
        driver.complete(finished, Completion::Rows(vec!["2"], vec![vec![Value::I64(2)]]));

        scheduler.advance();

        let err = engine_error(failing_future.now_or_never());
        assert_eq!(err.code, ERRORED_SENTINEL);
        assert_eq!(err.operation, op::POLL);
        let result = finished_future.now_or_never().unwrap().unwrap();
        assert_eq!(result.scalar::<i64>().unwrap(), Some(2));
        assert_eq!(dispatcher.pending_count(), 0);
        assert!(!dispatcher.is_ticking());
    }

    #[test]
    fn test_first_value_on_zero_rows_releases_once() {
        let (driver, _scheduler, dispatcher) = setup();
        let conn = FakeConn::new(1);
        let future = dispatcher.first_value_only(&conn, "SELECT a FROM empty");
        driver.complete(conn, Completion::Rows(vec!["a"], vec![]));
        dispatcher.tick();

        let mut result = future.now_or_never().unwrap().unwrap();
        assert!(result.value().is_none());
        assert_eq!(driver.releases(), 1);

        result.release();
        assert_eq!(driver.releases(), 1);
    }

    #[test]
    fn test_modes_release_result_sets() {
        let (driver, _scheduler, dispatcher) = setup();
        let rows = || {
            Completion::Rows(
                vec!["id", "name"],
                vec![
                    vec![Value::I64(1), Value::from("a")],
                    vec![Value::I64(2), Value::from("b")],
                ],
            )
        };
        let conns: Vec<FakeConn> = (1..=4).map(FakeConn::new).collect();
        let normal = dispatcher.query(&conns[0], "SELECT id, name FROM t");
        let exec = dispatcher.exec_only(&conns[1], "SELECT id, name FROM t");
        let row = dispatcher.first_row_only(&conns[2], "SELECT id, name FROM t");
        let value = dispatcher.first_value_only(&conns[3], "SELECT id, name FROM t");
        for conn in &conns {
            driver.complete(*conn, rows());
        }
        dispatcher.tick();

        assert_eq!(driver.releases(), 3);

        let mut normal = normal.now_or_never().unwrap().unwrap();
        assert!(matches!(normal.value(), Payload::ResultSet(_)));
        assert!(exec.now_or_never().unwrap().unwrap().value().is_none());
        let row = row.now_or_never().unwrap().unwrap();
        assert_eq!(row.first_row().unwrap().get::<String>("name").unwrap(), "a");
        let value = value.now_or_never().unwrap().unwrap();
        assert_eq!(value.scalar::<i64>().unwrap(), Some(1));

        normal.release();
        assert_eq!(driver.releases(), 4);
    }

    #[test]
    fn test_orphaned_result_set_is_released() {
        let (driver, _scheduler, dispatcher) = setup();
        let conn = FakeConn::new(1);
        drop(dispatcher.query(&conn, "SELECT 1"));
        driver.complete(conn, Completion::Rows(vec!["1"], vec![vec![Value::I64(1)]]));
        dispatcher.tick();
        assert_eq!(driver.releases(), 1);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_tick_without_pending_is_noop() {
        let (driver, _scheduler, dispatcher) = setup();
        dispatcher.tick();
        assert_eq!(driver.poll_calls(), 0);
        assert!(!dispatcher.is_ticking());
    }

    #[test]
    fn test_builder_settings() {
        let settings = DispatcherSettings {
            tick_interval_ms: 25,
            poll_failure_policy: PollFailurePolicy::Isolate,
        };
        let dispatcher = QueryDispatcher::builder(FakeDriver::new(), ManualScheduler::new())
            .settings(&settings)
            .build();
        assert_eq!(dispatcher.tick_interval(), Duration::from_millis(25));
        assert_eq!(dispatcher.poll_failure_policy(), PollFailurePolicy::Isolate);
    }
}
