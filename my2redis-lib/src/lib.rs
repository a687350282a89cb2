//! # MySQL → Redis replication pipeline
//!
//! A change-data-capture river that mirrors selected MySQL/MariaDB tables
//! into Redis hashes, one hash per row. On first run it bulk-loads a
//! consistent snapshot; afterwards it tails the ROW-format binary log and
//! applies inserts, updates, and deletes with low latency, durably
//! checkpointing its replication position for restart (at-least-once
//! delivery).
//!
//! ## Pipeline shape
//!
//! ```text
//! binlog source → event handler → (rows: rule → decode → key → sink)
//!                      │
//!                      └── bounded queue → sync loop → position store
//! ```
//!
//! The handler applies row events synchronously on the source-consumer
//! task, so a row reaches Redis before the source can deliver the
//! transaction's commit marker; position saves therefore never run ahead
//! of unapplied events.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use my2redis_lib::{setup_shutdown_handler, Config, River};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("river.toml").await?;
//!     let mut river = River::new(config)?;
//!     tokio::spawn(setup_shutdown_handler(river.cancellation_token()));
//!     river.run().await?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod config;
pub mod error;

// Schema-aware transformation layer
pub mod decode;
pub mod keys;
pub mod rule;
pub mod schema;

// Replication position durability
pub mod position;

// Event flow
pub mod events;
pub mod sink;
pub mod snapshot;
pub mod source;
pub mod sync;

// Counters and the stat endpoint
pub mod stats;

// The aggregate
pub mod river;

// Public API exports
pub use config::{build_table, is_valid_tables, Config, RuleConfig, SourceConfig, TomlDuration};
pub use decode::{decode_column, SinkValue};
pub use error::RiverError;
pub use events::{RowsAction, RowsEvent, SourceEvent};
pub use keys::build_key;
pub use position::{Position, PositionStore};
pub use river::{setup_shutdown_handler, River};
pub use rule::{Rule, RuleRegistry};
pub use schema::{
    ColumnType, MySqlSchemaResolver, RowValue, SchemaResolver, TableColumn, TableInfo,
};
pub use sink::{RedisSink, SinkExecutor, SinkWriter};
pub use source::{BinlogSource, MySqlBinlogSource};
pub use stats::{StatServer, Stats};
pub use sync::{sync_loop, EventHandler, SyncMsg, POS_SAVE_INTERVAL, SYNC_CHANNEL_CAPACITY};

/// Result type for pipeline operations
pub type RiverResult<T> = std::result::Result<T, RiverError>;
