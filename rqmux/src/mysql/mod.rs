//! MySQL implementation for rqmux

mod connection;
mod driver;
mod types;

pub use connection::MySqlConnection;
pub use driver::MySqlDriver;
pub use types::{
    from_mysql_value, CR_COMMANDS_OUT_OF_SYNC, CR_CONNECTION_ERROR, CR_SERVER_GONE_ERROR,
    CR_SERVER_LOST, CR_UNKNOWN_ERROR,
};
