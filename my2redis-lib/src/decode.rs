//! Decoding of raw row-image values into portable sink values
//!
//! Binlog and snapshot rows disagree about the shape of several MySQL
//! types: an ENUM arrives as a 1-based integer from the binlog but as its
//! label from a snapshot SELECT, a SET is a bitmask or a joined string, a
//! BIT is an integer or the dump byte `\x01`. [`decode_column`] normalizes
//! both shapes into one canonical representation per column type; values of
//! all other types pass through unchanged.

use crate::schema::{ColumnType, RowValue, TableColumn};
use chrono::{Local, NaiveDateTime, SecondsFormat, TimeZone};
use tracing::warn;

/// Source-native temporal text format
const MYSQL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// RFC-3339 rendering of the zero time, returned for unparseable temporals
const ZERO_TIME_RFC3339: &str = "0001-01-01T00:00:00Z";

/// A decoded, portable column value ready for the sink
#[derive(Debug, Clone, PartialEq)]
pub enum SinkValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl SinkValue {
    /// Render the value as a Redis hash field.
    ///
    /// The formatting is pinned for key/value stability across restarts:
    /// integers in decimal without separators, floats with the shortest
    /// round-trip form, booleans inside JSON as `true`/`false`, bytes as
    /// UTF-8, nil as the empty string.
    pub fn to_field_string(&self) -> String {
        match self {
            SinkValue::Null => String::new(),
            SinkValue::Int(v) => v.to_string(),
            SinkValue::UInt(v) => v.to_string(),
            SinkValue::Float(v) => v.to_string(),
            SinkValue::Str(v) => v.clone(),
            SinkValue::Bytes(v) => String::from_utf8_lossy(v).into_owned(),
            SinkValue::Json(v) => v.to_string(),
        }
    }
}

/// Decode one raw column value according to its column type.
pub fn decode_column(column: &TableColumn, raw: &RowValue) -> SinkValue {
    match column.col_type {
        ColumnType::Enum => match raw {
            RowValue::Int(v) => enum_label(column, *v),
            RowValue::UInt(v) => enum_label(column, *v as i64),
            other => passthrough(other),
        },
        ColumnType::Set => match raw {
            RowValue::Int(v) => SinkValue::Str(set_labels(column, *v as u64)),
            RowValue::UInt(v) => SinkValue::Str(set_labels(column, *v)),
            other => passthrough(other),
        },
        ColumnType::Bit => match raw {
            // dump encodes BIT(1) as "\x01" for 1 and "\0" for 0
            RowValue::String(v) => SinkValue::Int(i64::from(v.as_bytes() == b"\x01")),
            RowValue::Bytes(v) => SinkValue::Int(i64::from(v.as_slice() == b"\x01")),
            other => passthrough(other),
        },
        ColumnType::String => match raw {
            RowValue::Bytes(v) => SinkValue::Str(String::from_utf8_lossy(v).into_owned()),
            other => passthrough(other),
        },
        ColumnType::Json => {
            let parsed = match raw {
                RowValue::String(v) => serde_json::from_str(v).ok(),
                RowValue::Bytes(v) => serde_json::from_slice(v).ok(),
                _ => None,
            };
            match parsed {
                Some(value) => SinkValue::Json(value),
                None => passthrough(raw),
            }
        }
        ColumnType::DateTime | ColumnType::Timestamp => match raw {
            RowValue::String(v) => SinkValue::Str(datetime_to_rfc3339(v)),
            RowValue::Bytes(v) => {
                SinkValue::Str(datetime_to_rfc3339(&String::from_utf8_lossy(v)))
            }
            other => passthrough(other),
        },
        _ => passthrough(raw),
    }
}

fn passthrough(raw: &RowValue) -> SinkValue {
    match raw {
        RowValue::Null => SinkValue::Null,
        RowValue::Int(v) => SinkValue::Int(*v),
        RowValue::UInt(v) => SinkValue::UInt(*v),
        RowValue::Float(v) => SinkValue::Float(*v),
        RowValue::String(v) => SinkValue::Str(v.clone()),
        RowValue::Bytes(v) => SinkValue::Bytes(v.clone()),
    }
}

/// Map a 1-based ENUM ordinal to its label; out-of-range decodes to "".
fn enum_label(column: &TableColumn, raw: i64) -> SinkValue {
    let index = raw - 1;
    if index < 0 || index >= column.enum_values.len() as i64 {
        // invalid enum values can be inserted under permissive sql modes
        warn!(
            "invalid enum index {} for column {} ({:?})",
            index, column.name, column.enum_values
        );
        return SinkValue::Str(String::new());
    }
    SinkValue::Str(column.enum_values[index as usize].clone())
}

/// Expand a SET bitmask into its labels, joined in declaration order.
fn set_labels(column: &TableColumn, bitmask: u64) -> String {
    let mut labels = Vec::with_capacity(column.set_values.len());
    for (i, label) in column.set_values.iter().enumerate() {
        if bitmask & (1 << i) != 0 {
            labels.push(label.as_str());
        }
    }
    labels.join(",")
}

/// Reinterpret a source-native datetime string as RFC-3339 in local time.
///
/// Unparseable input yields the zero time; temporal garbage never aborts
/// the pipeline.
fn datetime_to_rfc3339(text: &str) -> String {
    let Ok(naive) = NaiveDateTime::parse_from_str(text, MYSQL_TIME_FORMAT) else {
        return ZERO_TIME_RFC3339.to_string();
    };

    match Local.from_local_datetime(&naive).earliest() {
        Some(local) => local.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => ZERO_TIME_RFC3339.to_string(),
    }
}
