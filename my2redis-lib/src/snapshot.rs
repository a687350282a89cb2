//! Consistent bulk snapshot of the mirrored tables
//!
//! On first run there is no checkpoint to resume from, so the initial state
//! is bulk-loaded: take a read lock just long enough to pin the binlog
//! coordinate, open a consistent-snapshot transaction, release the lock,
//! and stream every rule's table through the sink writer. The pinned
//! coordinate is the watermark the binlog tail starts from; rows changed
//! while the snapshot ran are replayed on top of it, which at-least-once
//! delivery allows.

use crate::config::Config;
use crate::error::{Result, RiverError};
use crate::position::Position;
use crate::rule::RuleRegistry;
use crate::schema::{mysql_opts, RowValue};
use crate::sink::SinkWriter;
use mysql_async::prelude::*;
use mysql_async::Conn;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Bulk-load all rule tables and return the snapshot watermark.
pub async fn run_snapshot(
    config: &Config,
    rules: &RuleRegistry,
    writer: &mut SinkWriter,
    token: &CancellationToken,
) -> Result<Position> {
    let opts = mysql_opts(config)?;
    let mut conn = Conn::new(opts).await?;

    conn.query_drop("FLUSH TABLES WITH READ LOCK").await?;

    let row: Option<mysql_async::Row> = conn.query_first("SHOW MASTER STATUS").await?;
    let Some(row) = row else {
        return Err(RiverError::schema_resolve(
            "SHOW MASTER STATUS returned nothing; is binary logging enabled?",
        ));
    };
    let name: String = row.get(0).unwrap_or_default();
    let pos: u64 = row.get(1).unwrap_or(4);
    let watermark = Position::new(name, pos as u32);

    conn.query_drop("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .await?;
    conn.query_drop("START TRANSACTION WITH CONSISTENT SNAPSHOT")
        .await?;
    conn.query_drop("UNLOCK TABLES").await?;

    info!("snapshot started at watermark {}", watermark);

    for rule in rules.rules() {
        if token.is_cancelled() {
            return Err(RiverError::Cancelled);
        }

        // TODO: page these SELECTs once mirrored tables outgrow memory
        let query = format!("SELECT * FROM `{}`.`{}`", rule.schema, rule.table);
        let rows: Vec<mysql_async::Row> = conn.query(&query).await?;
        let count = rows.len();

        for row in rows {
            let values: Vec<RowValue> = row
                .unwrap()
                .into_iter()
                .map(RowValue::from_mysql)
                .collect();
            writer.insert_row(&rule, &values).await?;
        }

        debug!("snapshot loaded {} rows from {}.{}", count, rule.schema, rule.table);
    }

    conn.query_drop("COMMIT").await?;
    info!("snapshot complete, tailing from {}", watermark);

    Ok(watermark)
}
