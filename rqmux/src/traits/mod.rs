//! Core traits for rqmux

mod connector;
mod driver;
mod from_value;
mod result_set;

pub use connector::{ConnectFlags, Connector};
pub use driver::{
    AsyncDriver, ConnectionId, DriverError, ExecuteResult, PollOutcome, RawValue,
    ERRORED_SENTINEL, REJECTED_SENTINEL,
};
pub use from_value::FromValue;
pub use result_set::{BufferedResultSet, ResultSet};
