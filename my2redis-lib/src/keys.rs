//! Destination key construction
//!
//! Every mirrored row lands in one Redis hash whose key is
//! `"<schema>:<table>:<pk1>[:<pk2>…]"`, composite primary keys concatenated
//! in key order. The per-type formatting is pinned (decimal integers, no
//! separators) so a key built after a restart is byte-identical to the key
//! built before it.

use crate::error::{Result, RiverError};
use crate::rule::Rule;
use crate::schema::RowValue;

/// Build the destination key for a row image.
///
/// Returns [`RiverError::PkMissing`] when any primary-key component is nil.
pub fn build_key(rule: &Rule, row: &[RowValue]) -> Result<String> {
    let pks = rule.table_info.pk_values(row)?;

    let mut key = String::with_capacity(rule.schema.len() + rule.table.len() + 16);
    key.push_str(&rule.schema);
    key.push(':');
    key.push_str(&rule.table);

    for (index, value) in pks.iter().enumerate() {
        let formatted = format_key_value(value)
            .ok_or_else(|| RiverError::pk_missing(index, &rule.schema, &rule.table))?;
        key.push(':');
        key.push_str(&formatted);
    }

    Ok(key)
}

/// Pinned formatting of one key component; `None` for nil.
fn format_key_value(value: &RowValue) -> Option<String> {
    match value {
        RowValue::Null => None,
        RowValue::Int(v) => Some(v.to_string()),
        RowValue::UInt(v) => Some(v.to_string()),
        RowValue::Float(v) => Some(v.to_string()),
        RowValue::String(v) => Some(v.clone()),
        RowValue::Bytes(v) => Some(String::from_utf8_lossy(v).into_owned()),
    }
}
