//! rqmux - concurrent MySQL queries without a thread per query
//!
//! Starts one query per connection with a non-blocking client primitive and
//! multiplexes all of them through a single periodic tick, plus a connection
//! factory that retries with backoff until a connection is usable.
//!
//! # Features
//!
//! - **One tick for many queries**: a single timer polls every in-flight
//!   connection and deregisters itself when nothing is pending
//! - **Query modes**: keep the result set, discard it, keep the first row, or
//!   keep a single value
//! - **Error categories**: client errors are classified as connection-fatal or
//!   lock contention, so callers know whether to reconnect or retry
//! - **Retrying connect**: bounded or time-limited retries with jittered
//!   backoff, progress reports and cooperative cancellation
//!
//! # Example
//!
//! ```ignore
//! use rqmux::{ConnectionFactory, MySqlDriver, QueryDispatcher, RetrySettings, TokioScheduler};
//!
//! async fn run() -> rqmux::Result<()> {
//!     let scheduler = TokioScheduler::current()?;
//!     let factory = ConnectionFactory::new(MySqlDriver::new(), scheduler.clone());
//!     let retry = RetrySettings::new(3, 10_000, 500);
//!     let a = factory.connect(None, Some(retry)).await;
//!     let b = factory.connect(None, Some(retry)).await;
//!
//!     let dispatcher = QueryDispatcher::new(MySqlDriver::new(), scheduler);
//!     let (one, two) = futures::join!(
//!         dispatcher.first_value_only(&a, "SELECT SLEEP(1)"),
//!         dispatcher.first_value_only(&b, "SELECT SLEEP(2)"),
//!     );
//!     assert_eq!(one?.scalar::<i64>()?, Some(0));
//!     two?;
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod factory;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod result;
pub mod row;
pub mod scheduler;
pub mod traits;
pub mod value;

#[cfg(test)]
mod testing;

// Re-export main types
pub use classify::{ErrorCategory, ErrorClassifier};
pub use config::{ConnectionSettings, DispatcherSettings, MuxConfig, RetrySettings};
pub use dispatcher::{PollFailurePolicy, QueryDispatcher, QueryDispatcherBuilder, QueryFuture};
pub use error::{EngineError, Error, Result};
pub use factory::{ConnectTaskInfo, ConnectionFactory};
#[cfg(feature = "mysql")]
pub use mysql::{MySqlConnection, MySqlDriver};
pub use result::{Payload, QueryMode, QueryResult, RawOutcome};
pub use row::Row;
pub use scheduler::{ManualScheduler, Scheduler, TimerId, TokioScheduler};
pub use traits::{
    AsyncDriver, BufferedResultSet, ConnectFlags, ConnectionId, Connector, DriverError,
    ExecuteResult, FromValue, PollOutcome, RawValue, ResultSet,
};
pub use value::Value;
