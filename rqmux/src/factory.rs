//! Connection establishment with retry, backoff and cooperative cancellation
//!
//! Every non-cancelled run ends by returning a connection object, valid or
//! not. Exhausting retries or time is not an error: callers check the
//! handle the same way they would after a single plain connect.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classify::{op, ErrorCategory, ErrorClassifier};
use crate::config::{ConnectionSettings, RetrySettings};
use crate::error::EngineError;
use crate::scheduler::Scheduler;
use crate::traits::{ConnectFlags, Connector, DriverError};

/// Client error code used when a refused connect leaves no error behind.
const UNKNOWN_CONNECT_ERROR: i32 = 2000;

/// Progress report handed to a connect observer.
///
/// Sent once per failed attempt (with the suppressed error) and once on
/// success (with `finished_at` set). Calling [`cancel`](Self::cancel) on a
/// failure report stops the retry loop; the current connection object is
/// returned as-is.
pub struct ConnectTaskInfo<'a, C> {
    connection: &'a C,
    started_at: Instant,
    retry_count: u32,
    suppressed_error: Option<EngineError>,
    message: String,
    finished_at: Option<Instant>,
    cancel_requested: bool,
}

impl<'a, C> ConnectTaskInfo<'a, C> {
    /// The connection object of the current attempt.
    pub fn connection(&self) -> &'a C {
        self.connection
    }

    /// When the retry loop started.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Zero-based attempt number.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// The failure that is being retried, for failure reports.
    pub fn suppressed_error(&self) -> Option<&EngineError> {
        self.suppressed_error.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Set on the terminal success report.
    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    /// Time since the loop started, up to `finished_at` when set.
    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.started_at)
    }

    /// Ask the retry loop to stop after this report.
    pub fn cancel(&mut self) {
        self.cancel_requested = true;
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn is_success(&self) -> bool {
        self.suppressed_error.is_none()
    }
}

impl<C> std::fmt::Debug for ConnectTaskInfo<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectTaskInfo")
            .field("retry_count", &self.retry_count)
            .field("suppressed_error", &self.suppressed_error)
            .field("message", &self.message)
            .field("elapsed", &self.elapsed())
            .field("cancel_requested", &self.cancel_requested)
            .finish()
    }
}

type Observer<'o, C> = Option<&'o mut (dyn for<'a> FnMut(&mut ConnectTaskInfo<'a, C>) + Send)>;

#[derive(Clone, Copy)]
enum Establish {
    Open,
    RealConnect(ConnectFlags),
}

impl Establish {
    fn name(self) -> &'static str {
        match self {
            Establish::Open => "connect",
            Establish::RealConnect(_) => "real_connect",
        }
    }
}

enum Verdict {
    Connected,
    Failed(EngineError),
}

/// Opens connections through a [`Connector`], retrying per [`RetrySettings`].
pub struct ConnectionFactory<K: Connector, S: Scheduler> {
    connector: K,
    scheduler: S,
    classifier: ErrorClassifier,
    default_settings: ConnectionSettings,
    default_retry: RetrySettings,
}

impl<K: Connector, S: Scheduler> ConnectionFactory<K, S> {
    /// Factory with default connection and retry settings.
    pub fn new(connector: K, scheduler: S) -> Self {
        Self::with_defaults(
            connector,
            scheduler,
            ConnectionSettings::default(),
            RetrySettings::default(),
        )
    }

    pub fn with_defaults(
        connector: K,
        scheduler: S,
        settings: ConnectionSettings,
        retry: RetrySettings,
    ) -> Self {
        Self {
            connector,
            scheduler,
            classifier: ErrorClassifier::default(),
            default_settings: settings,
            default_retry: retry,
        }
    }

    /// Use a specific classifier instead of the global one.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    pub fn default_settings(&self) -> &ConnectionSettings {
        &self.default_settings
    }

    pub fn set_default_settings(&mut self, settings: ConnectionSettings) {
        self.default_settings = settings;
    }

    pub fn default_retry(&self) -> RetrySettings {
        self.default_retry
    }

    pub fn set_default_retry(&mut self, retry: RetrySettings) {
        self.default_retry = retry;
    }

    /// Open a new connection, retrying until it is usable or the retry
    /// settings give up. `None` falls back to the factory defaults.
    pub async fn connect(
        &self,
        settings: Option<&ConnectionSettings>,
        retry: Option<RetrySettings>,
    ) -> K::Conn {
        let conn = self.connector.init();
        self.run(conn, Establish::Open, settings, retry, None).await
    }

    /// Like [`connect`](Self::connect), reporting progress to `observer`.
    pub async fn connect_with_observer<F>(
        &self,
        settings: Option<&ConnectionSettings>,
        retry: Option<RetrySettings>,
        mut observer: F,
    ) -> K::Conn
    where
        F: FnMut(&mut ConnectTaskInfo<'_, K::Conn>) + Send,
    {
        let conn = self.connector.init();
        self.run(conn, Establish::Open, settings, retry, Some(&mut observer))
            .await
    }

    /// Drive an allocated, not yet connected handle through the low-level
    /// connect primitive with `flags`, retrying like [`connect`](Self::connect).
    pub async fn real_connect(
        &self,
        conn: K::Conn,
        flags: ConnectFlags,
        settings: Option<&ConnectionSettings>,
        retry: Option<RetrySettings>,
    ) -> K::Conn {
        self.run(conn, Establish::RealConnect(flags), settings, retry, None)
            .await
    }

    /// Like [`real_connect`](Self::real_connect), reporting progress to
    /// `observer`.
    pub async fn real_connect_with_observer<F>(
        &self,
        conn: K::Conn,
        flags: ConnectFlags,
        settings: Option<&ConnectionSettings>,
        retry: Option<RetrySettings>,
        mut observer: F,
    ) -> K::Conn
    where
        F: FnMut(&mut ConnectTaskInfo<'_, K::Conn>) + Send,
    {
        self.run(
            conn,
            Establish::RealConnect(flags),
            settings,
            retry,
            Some(&mut observer),
        )
        .await
    }

    async fn run(
        &self,
        mut conn: K::Conn,
        how: Establish,
        settings: Option<&ConnectionSettings>,
        retry: Option<RetrySettings>,
        mut observer: Observer<'_, K::Conn>,
    ) -> K::Conn {
        let retry = retry.unwrap_or(self.default_retry);
        let mut settings = settings.unwrap_or(&self.default_settings).clone();
        settings.host = settings.effective_host();

        let started_at = Instant::now();
        let timeout = retry.timeout();
        let max_retries = retry.max_retries();
        let mut retry_count: u32 = 0;

        loop {
            if retry_count > 0 {
                if let Some(timeout) = timeout {
                    if started_at.elapsed() > timeout {
                        warn!(
                            attempts = retry_count,
                            timeout_ms = retry.timeout_ms,
                            "{}(): giving up, retry timeout exceeded",
                            how.name()
                        );
                        return conn;
                    }
                }
            }

            let accepted = match how {
                Establish::Open => {
                    conn = self.connector.open(&settings).await;
                    true
                }
                Establish::RealConnect(flags) => {
                    self.connector.real_connect(&mut conn, &settings, flags).await
                }
            };

            let verdict = if accepted {
                self.verify(&mut conn).await
            } else {
                self.refused(&conn)
            };
            let error = match verdict {
                Verdict::Connected => break,
                Verdict::Failed(error) => error,
            };

            if max_retries.is_some_and(|max| retry_count >= max) {
                warn!(
                    attempts = retry_count + 1,
                    code = error.code,
                    "{}(): giving up, retries exhausted",
                    how.name()
                );
                return conn;
            }

            warn!(
                retry_count,
                code = error.code,
                category = ?error.category,
                "{}(): suppressing an error: {}",
                how.name(),
                error.message
            );

            if let Some(observer) = observer.as_deref_mut() {
                let mut report = ConnectTaskInfo {
                    connection: &conn,
                    started_at,
                    retry_count,
                    message: format!(
                        "{}(): suppressing an error (code: {}, msg: {})",
                        how.name(),
                        error.code,
                        error.message
                    ),
                    suppressed_error: Some(error),
                    finished_at: None,
                    cancel_requested: false,
                };
                observer(&mut report);
                if report.cancel_requested {
                    info!(retry_count, "{}(): cancelled by observer", how.name());
                    return conn;
                }
            }

            let backoff = retry.backoff();
            debug!(?backoff, "{}(): waiting before next attempt", how.name());
            self.scheduler.delay(backoff).await;
            retry_count += 1;
        }

        info!(
            attempts = retry_count + 1,
            elapsed = ?started_at.elapsed(),
            "{}(): connection established",
            how.name()
        );

        if let Some(observer) = observer.as_deref_mut() {
            let mut report = ConnectTaskInfo {
                connection: &conn,
                started_at,
                retry_count,
                suppressed_error: None,
                message: format!("{}(): successfully completed", how.name()),
                finished_at: Some(Instant::now()),
                cancel_requested: false,
            };
            observer(&mut report);
        }
        conn
    }

    /// The connect primitive itself reported failure.
    fn refused(&self, conn: &K::Conn) -> Verdict {
        let error = self
            .connector
            .connect_error(conn)
            .unwrap_or_else(|| DriverError::new(UNKNOWN_CONNECT_ERROR, "real_connect() failed"));
        Verdict::Failed(self.classifier.classify(op::CONNECT, error, None))
    }

    /// Ping first, then the handle's own connect error.
    async fn verify(&self, conn: &mut K::Conn) -> Verdict {
        if let Err(e) = self.connector.ping(conn).await {
            let mut error = self.classifier.classify(op::PING, e, None);
            // a failed ping always leaves the handle unusable
            if error.category == ErrorCategory::Unclassified {
                error.category = ErrorCategory::ConnectionFatal;
            }
            return Verdict::Failed(error);
        }

        if let Some(mut e) = self.connector.connect_error(conn) {
            e.message = format!("connect error after successful ping: {}", e.message);
            return Verdict::Failed(self.classifier.classify(op::CONNECT, e, None));
        }

        Verdict::Connected
    }
}
