//! Value and error conversion for MySQL

use crate::error::{Error, Result};
use crate::traits::DriverError;
use crate::value::Value;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use mysql_async::Value as MySqlValue;

/// Unknown client error (CR_UNKNOWN_ERROR)
pub const CR_UNKNOWN_ERROR: i32 = 2000;
/// Can't connect (CR_CONNECTION_ERROR)
pub const CR_CONNECTION_ERROR: i32 = 2002;
/// Server has gone away (CR_SERVER_GONE_ERROR)
pub const CR_SERVER_GONE_ERROR: i32 = 2006;
/// Lost connection during query (CR_SERVER_LOST)
pub const CR_SERVER_LOST: i32 = 2013;
/// Commands out of sync (CR_COMMANDS_OUT_OF_SYNC)
pub const CR_COMMANDS_OUT_OF_SYNC: i32 = 2014;

/// Convert mysql_async Value to rqmux Value
pub fn from_mysql_value(value: MySqlValue) -> Result<Value> {
    match value {
        MySqlValue::NULL => Ok(Value::Null),
        // text protocol sends everything as bytes; keep valid UTF-8 as text
        MySqlValue::Bytes(v) => match String::from_utf8(v) {
            Ok(s) => Ok(Value::String(s)),
            Err(e) => Ok(Value::Bytes(e.into_bytes())),
        },
        MySqlValue::Int(v) => Ok(Value::I64(v)),
        MySqlValue::UInt(v) => Ok(Value::U64(v)),
        MySqlValue::Float(v) => Ok(Value::F32(v)),
        MySqlValue::Double(v) => Ok(Value::F64(v)),
        MySqlValue::Date(year, month, day, hour, min, sec, micro) => {
            let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32).ok_or_else(
                || Error::TypeConversion {
                    expected: "date",
                    actual: format!("{}-{}-{}", year, month, day),
                },
            )?;
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                return Ok(Value::Date(date));
            }
            let time = NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                .ok_or_else(|| Error::TypeConversion {
                    expected: "time",
                    actual: format!("{}:{}:{}.{}", hour, min, sec, micro),
                })?;
            Ok(Value::DateTime(NaiveDateTime::new(date, time)))
        }
        MySqlValue::Time(is_neg, days, hours, mins, secs, micro) => {
            // NaiveTime only covers a single day
            if is_neg || days > 0 || hours >= 24 {
                return Err(Error::TypeConversion {
                    expected: "time (00:00:00 to 23:59:59)",
                    actual: format!(
                        "{}{}:{:02}:{:02}",
                        if is_neg { "-" } else { "" },
                        days * 24 + hours as u32,
                        mins,
                        secs
                    ),
                });
            }
            let time = NaiveTime::from_hms_micro_opt(hours as u32, mins as u32, secs as u32, micro)
                .ok_or_else(|| Error::TypeConversion {
                    expected: "time",
                    actual: format!("{}:{}:{}.{}", hours, mins, secs, micro),
                })?;
            Ok(Value::Time(time))
        }
    }
}

/// Column names of a row set, in order.
pub fn column_names(columns: &[mysql_async::Column]) -> Vec<String> {
    columns.iter().map(|c| c.name_str().into_owned()).collect()
}

/// Convert every value of a mysql_async Row.
pub fn row_values(row: mysql_async::Row) -> Result<Vec<Value>> {
    row.unwrap().into_iter().map(from_mysql_value).collect()
}

/// Error code and message of a failed query or command.
pub fn driver_error(err: &mysql_async::Error) -> DriverError {
    match err {
        mysql_async::Error::Server(e) => DriverError::new(i32::from(e.code), e.message.clone()),
        mysql_async::Error::Io(e) => DriverError::new(CR_SERVER_LOST, e.to_string()),
        mysql_async::Error::Driver(mysql_async::DriverError::ConnectionClosed) => {
            DriverError::new(CR_SERVER_GONE_ERROR, "MySQL server has gone away")
        }
        other => DriverError::new(CR_UNKNOWN_ERROR, other.to_string()),
    }
}

/// Error code and message of a failed connection attempt.
pub fn connect_error(err: &mysql_async::Error) -> DriverError {
    match err {
        mysql_async::Error::Io(e) => DriverError::new(CR_CONNECTION_ERROR, e.to_string()),
        other => driver_error(other),
    }
}
