//! FromValue trait for reading typed values out of reaped rows

use crate::error::{Error, Result};
use crate::value::Value;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Trait for types that can be constructed from a cell [`Value`].
///
/// Implemented for the common scalar types; implement it for your own
/// types (e.g. enums stored as text) to use them with [`crate::Row::get`]
/// and [`crate::QueryResult::scalar`].
pub trait FromValue: Sized {
    /// Convert a cell value to this type.
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch(expected: &'static str, value: &Value) -> Error {
    Error::TypeConversion {
        expected,
        actual: value.type_name().to_string(),
    }
}

// Integers arrive as i64/u64, or as text when the column type is DECIMAL or
// the server sent the value through the text protocol untyped.
macro_rules! impl_from_value_int {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::I64(v) => v.try_into().map_err(|_| Error::TypeConversion {
                            expected: $name,
                            actual: format!("i64({}) out of range", v),
                        }),
                        Value::U64(v) => v.try_into().map_err(|_| Error::TypeConversion {
                            expected: $name,
                            actual: format!("u64({}) out of range", v),
                        }),
                        Value::String(ref s) => s.trim().parse().map_err(|_| Error::TypeConversion {
                            expected: $name,
                            actual: format!("string({:?})", s),
                        }),
                        other => Err(mismatch($name, &other)),
                    }
                }
            }
        )*
    };
}

impl_from_value_int!(
    i8 => "i8",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    u8 => "u8",
    u16 => "u16",
    u32 => "u32",
    u64 => "u64",
    usize => "usize",
);

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::I64(v) => Ok(v != 0),
            Value::U64(v) => Ok(v != 0),
            Value::String(ref s) => match s.trim() {
                "1" | "true" | "TRUE" => Ok(true),
                "0" | "false" | "FALSE" => Ok(false),
                _ => Err(mismatch("bool", &value)),
            },
            other => Err(mismatch("bool", &other)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::F64(v) => Ok(v),
            Value::F32(v) => Ok(v.into()),
            Value::I64(v) => Ok(v as f64),
            Value::U64(v) => Ok(v as f64),
            Value::String(ref s) => s.trim().parse().map_err(|_| mismatch("f64", &value)),
            other => Err(mismatch("f64", &other)),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::F32(v) => Ok(v),
            Value::F64(v) => Ok(v as f32),
            Value::I64(v) => Ok(v as f32),
            Value::U64(v) => Ok(v as f32),
            Value::String(ref s) => s.trim().parse().map_err(|_| mismatch("f32", &value)),
            other => Err(mismatch("f32", &other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(v) => Ok(v),
            Value::Bytes(v) => String::from_utf8(v).map_err(|e| Error::TypeConversion {
                expected: "string",
                actual: format!("invalid utf-8: {}", e),
            }),
            Value::I64(v) => Ok(v.to_string()),
            Value::U64(v) => Ok(v.to_string()),
            Value::F32(v) => Ok(v.to_string()),
            Value::F64(v) => Ok(v.to_string()),
            Value::Date(v) => Ok(v.to_string()),
            Value::DateTime(v) => Ok(v.to_string()),
            Value::Time(v) => Ok(v.to_string()),
            Value::Null => Err(mismatch("string", &Value::Null)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bytes(v) => Ok(v),
            Value::String(v) => Ok(v.into_bytes()),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Date(v) => Ok(v),
            Value::DateTime(v) => Ok(v.date()),
            Value::String(ref s) => {
                NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| mismatch("date", &value))
            }
            other => Err(mismatch("date", &other)),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::DateTime(v) => Ok(v),
            Value::Date(v) => Ok(v.and_time(NaiveTime::default())),
            Value::String(ref s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|_| mismatch("datetime", &value)),
            other => Err(mismatch("datetime", &other)),
        }
    }
}

impl FromValue for NaiveTime {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Time(v) => Ok(v),
            Value::String(ref s) => {
                NaiveTime::parse_from_str(s, "%H:%M:%S%.f").map_err(|_| mismatch("time", &value))
            }
            other => Err(mismatch("time", &other)),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            v => T::from_value(v).map(Some),
        }
    }
}
