//! `mysql_async` adapter for the dispatcher and the connection factory

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Compression, Opts, OptsBuilder, SslOpts};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::trace;

use crate::config::ConnectionSettings;
use crate::traits::{
    AsyncDriver, BufferedResultSet, ConnectFlags, ConnectionId, Connector, DriverError,
    ExecuteResult, PollOutcome, RawValue,
};

use super::connection::{Completion, MySqlConnection, Outcome};
use super::types::{
    column_names, connect_error, driver_error, row_values, CR_COMMANDS_OUT_OF_SYNC,
    CR_SERVER_GONE_ERROR, CR_SERVER_LOST, CR_UNKNOWN_ERROR,
};

/// TCP keepalive applied to persistent connections, in milliseconds
const KEEPALIVE_MS: u32 = 10_000;

/// Runs queries on [`MySqlConnection`]s without blocking the caller.
///
/// `start_query` moves the connection into a spawned tokio task; the
/// dispatcher's tick then finds the finished task with a non-blocking
/// sweep. Requires a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDriver;

impl MySqlDriver {
    pub fn new() -> Self {
        Self
    }

    /// Client options for `settings`, honoring the connect flags.
    pub fn opts(settings: &ConnectionSettings, flags: ConnectFlags) -> Opts {
        let password = (!settings.password.is_empty()).then(|| settings.password.clone());
        let mut builder = OptsBuilder::default()
            .ip_or_hostname(settings.bare_host())
            .tcp_port(settings.port)
            .user(Some(settings.user.clone()))
            .pass(password)
            .db_name(settings.database.clone())
            .socket(settings.socket.clone())
            .client_found_rows(flags.contains(ConnectFlags::FOUND_ROWS));

        if settings.persistent {
            builder = builder.tcp_keepalive(Some(KEEPALIVE_MS));
        }
        if flags.contains(ConnectFlags::COMPRESS) {
            builder = builder.compression(Compression::default());
        }
        if flags.contains(ConnectFlags::SSL) {
            builder = builder.ssl_opts(SslOpts::default());
        }
        builder.into()
    }

    async fn establish(
        &self,
        conn: &MySqlConnection,
        settings: &ConnectionSettings,
        flags: ConnectFlags,
    ) -> bool {
        let result = mysql_async::Conn::new(Self::opts(settings, flags)).await;
        let mut state = conn.lock();
        match result {
            Ok(c) => {
                state.conn = Some(c);
                state.connect_error = None;
                state.last_error = None;
                true
            }
            Err(e) => {
                state.conn = None;
                state.connect_error = Some(connect_error(&e));
                false
            }
        }
    }
}

async fn run_query(conn: &mut mysql_async::Conn, sql: &str) -> Result<Outcome, DriverError> {
    let mut result = conn.query_iter(sql).await.map_err(|e| driver_error(&e))?;
    let columns = result.columns().filter(|c| !c.is_empty());

    let outcome = match columns {
        Some(columns) => {
            let raw: Vec<mysql_async::Row> =
                result.collect().await.map_err(|e| driver_error(&e))?;
            let mut rows = Vec::with_capacity(raw.len());
            for row in raw {
                let values = row_values(row)
                    .map_err(|e| DriverError::new(CR_UNKNOWN_ERROR, e.to_string()))?;
                rows.push(values);
            }
            Outcome::Rows {
                columns: column_names(&columns),
                rows,
            }
        }
        None => Outcome::Affected(ExecuteResult {
            rows_affected: result.affected_rows(),
            last_insert_id: result.last_insert_id(),
        }),
    };

    // further result sets of a multi-statement are not reported
    result.drop_result().await.map_err(|e| driver_error(&e))?;
    Ok(outcome)
}

impl AsyncDriver for MySqlDriver {
    type Conn = MySqlConnection;
    type Rows = BufferedResultSet;

    fn connection_id(&self, conn: &MySqlConnection) -> ConnectionId {
        conn.id()
    }

    fn start_query(&self, conn: &MySqlConnection, sql: &str) -> Result<(), DriverError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| DriverError::new(CR_UNKNOWN_ERROR, e.to_string()))?;

        let mut state = conn.lock();
        if state.inflight.is_some() || state.completed.is_some() {
            return Err(DriverError::new(
                CR_COMMANDS_OUT_OF_SYNC,
                "Commands out of sync; you can't run this command now",
            ));
        }
        let Some(mut client) = state.conn.take() else {
            let error = state
                .connect_error
                .clone()
                .unwrap_or_else(|| DriverError::new(CR_SERVER_GONE_ERROR, "MySQL server has gone away"));
            return Err(error);
        };

        let (tx, rx) = oneshot::channel::<Completion>();
        let sql = sql.to_string();
        let id = conn.id();
        handle.spawn(async move {
            let outcome = run_query(&mut client, &sql).await;
            trace!(connection = %id, ok = outcome.is_ok(), "query finished");
            let _ = tx.send((client, outcome));
        });

        state.inflight = Some(rx);
        state.last_error = None;
        Ok(())
    }

    fn poll_many(&self, conns: &[MySqlConnection]) -> Result<PollOutcome, DriverError> {
        let mut outcome = PollOutcome::default();
        for conn in conns {
            let mut state = conn.lock();
            if state.completed.is_some() {
                outcome.ready.push(conn.id());
                continue;
            }
            let Some(rx) = state.inflight.as_mut() else {
                outcome.rejected.push(conn.id());
                continue;
            };
            match rx.try_recv() {
                Ok((client, result)) => {
                    state.inflight = None;
                    state.conn = Some(client);
                    state.completed = Some(result);
                    outcome.ready.push(conn.id());
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Closed) => {
                    // the query task died and took the connection with it
                    state.inflight = None;
                    state.last_error = Some(DriverError::new(
                        CR_SERVER_LOST,
                        "Lost connection to MySQL server during query",
                    ));
                    outcome.errored.push(conn.id());
                }
            }
        }
        Ok(outcome)
    }

    fn reap_result(
        &self,
        conn: &MySqlConnection,
    ) -> Result<Option<RawValue<BufferedResultSet>>, DriverError> {
        let mut state = conn.lock();
        match state.completed.take() {
            Some(Ok(Outcome::Rows { columns, rows })) => Ok(Some(RawValue::ResultSet(
                BufferedResultSet::new(columns, rows),
            ))),
            Some(Ok(Outcome::Affected(result))) => Ok(Some(RawValue::Affected(result))),
            Some(Err(e)) => {
                state.last_error = Some(e.clone());
                Err(e)
            }
            None if state.inflight.is_some() => Err(DriverError::new(
                CR_COMMANDS_OUT_OF_SYNC,
                "Commands out of sync; the query has not finished",
            )),
            None => Ok(None),
        }
    }

    fn last_error(&self, conn: &MySqlConnection) -> Option<DriverError> {
        conn.last_error()
    }
}

#[async_trait]
impl Connector for MySqlDriver {
    type Conn = MySqlConnection;

    fn init(&self) -> MySqlConnection {
        MySqlConnection::unconnected()
    }

    async fn open(&self, settings: &ConnectionSettings) -> MySqlConnection {
        let conn = MySqlConnection::unconnected();
        self.establish(&conn, settings, ConnectFlags::NONE).await;
        conn
    }

    async fn real_connect(
        &self,
        conn: &mut MySqlConnection,
        settings: &ConnectionSettings,
        flags: ConnectFlags,
    ) -> bool {
        self.establish(conn, settings, flags).await
    }

    async fn ping(&self, conn: &mut MySqlConnection) -> Result<(), DriverError> {
        let client = conn.lock().conn.take();
        let Some(mut client) = client else {
            return Err(conn
                .connect_error()
                .unwrap_or_else(|| DriverError::new(CR_SERVER_GONE_ERROR, "MySQL server has gone away")));
        };

        let result = client.ping().await;
        let mut state = conn.lock();
        match result {
            Ok(()) => {
                state.conn = Some(client);
                Ok(())
            }
            Err(e) => {
                // a connection that failed its ping is not reused
                let error = driver_error(&e);
                state.last_error = Some(error.clone());
                Err(error)
            }
        }
    }

    fn connect_error(&self, conn: &MySqlConnection) -> Option<DriverError> {
        conn.connect_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opts_from_settings() {
        let settings = ConnectionSettings::new("p:db.internal")
            .user("app")
            .password("secret")
            .database("orders")
            .port(3307);
        let opts = MySqlDriver::opts(&settings, ConnectFlags::FOUND_ROWS);

        assert_eq!(opts.ip_or_hostname(), "db.internal");
        assert_eq!(opts.tcp_port(), 3307);
        assert_eq!(opts.user(), Some("app"));
        assert_eq!(opts.pass(), Some("secret"));
        assert_eq!(opts.db_name(), Some("orders"));
        assert_eq!(opts.tcp_keepalive(), Some(KEEPALIVE_MS));
        assert!(opts.client_found_rows());
        assert!(opts.ssl_opts().is_none());
    }

    #[test]
    fn test_opts_without_password_or_keepalive() {
        let settings = ConnectionSettings::new("localhost").persistent(false);
        let opts = MySqlDriver::opts(&settings, ConnectFlags::SSL);
        assert_eq!(opts.pass(), None);
        assert_eq!(opts.tcp_keepalive(), None);
        assert!(opts.ssl_opts().is_some());
    }

    #[test]
    fn test_unconnected_handle() {
        let driver = MySqlDriver::new();
        let conn = driver.init();
        assert!(!conn.is_connected());
        assert!(!conn.is_busy());
        assert_ne!(driver.init().id(), conn.id());
        assert_eq!(
            driver.poll_many(std::slice::from_ref(&conn)).unwrap().rejected,
            vec![conn.id()]
        );
        assert!(matches!(driver.reap_result(&conn), Ok(None)));
    }

    #[tokio::test]
    async fn test_start_on_unconnected_handle_fails() {
        let driver = MySqlDriver::new();
        let conn = driver.init();
        let err = driver.start_query(&conn, "SELECT 1").unwrap_err();
        assert_eq!(err.code, CR_SERVER_GONE_ERROR);
    }

    #[tokio::test]
    async fn test_ping_on_unconnected_handle_fails() {
        let driver = MySqlDriver::new();
        let mut conn = driver.init();
        assert!(driver.ping(&mut conn).await.is_err());
    }
}
