//! Events emitted by the binlog source
//!
//! The source translates wire-level binlog events into this tagged variant;
//! the event handler dispatches on it. Row events carry fully materialized
//! row images, position events carry the coordinate to checkpoint.

use crate::position::Position;
use crate::schema::RowValue;
use std::fmt;

/// What a row event does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsAction {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for RowsAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowsAction::Insert => write!(f, "insert"),
            RowsAction::Update => write!(f, "update"),
            RowsAction::Delete => write!(f, "delete"),
        }
    }
}

/// A batch of row images for one table
///
/// Inserts and deletes carry one image per row; updates carry flat
/// before/after pairs, so `rows.len()` must be even.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub schema: String,
    pub table: String,
    pub action: RowsAction,
    pub rows: Vec<Vec<RowValue>>,
}

/// One event out of the binlog source
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// Log file boundary; the next coordinate must be persisted promptly
    Rotate { next: Position },

    /// Schema-changing statement; triggers rule refresh via `TableChanged`
    Ddl { next: Position, query: String },

    /// A table's structure may have changed
    TableChanged { schema: String, table: String },

    /// Transaction commit marker, the natural checkpoint boundary
    Xid { next: Position },

    /// Row images for one table
    Rows(RowsEvent),

    /// Global transaction identifier (informational)
    Gtid { gtid: String },

    /// Source-side position acknowledgement (informational)
    PosSynced { pos: Position },
}
