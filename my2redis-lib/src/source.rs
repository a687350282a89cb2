//! Binlog event source
//!
//! [`BinlogSource`] is the opaque-event-source boundary: the pipeline only
//! ever sees [`SourceEvent`]s. The production implementation registers as a
//! replica against MySQL/MariaDB through `mysql_async`, tails the binary
//! log from a given position, and translates wire events (rotate, query,
//! xid, table map, row images) into pipeline events. Schema-changing
//! statements additionally emit a `TableChanged` for the affected table so
//! the rule registry can refresh its cached metadata.

use crate::config::Config;
use crate::error::{Result, RiverError};
use crate::events::{RowsAction, RowsEvent, SourceEvent};
use crate::position::Position;
use crate::schema::{mysql_opts, RowValue};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use futures_util::StreamExt;
use mysql_async::binlog::events::{EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn};
use regex::Regex;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Opaque source of replication events
#[async_trait]
pub trait BinlogSource: Send {
    /// Next event, or `None` when the stream ended.
    async fn next_event(&mut self) -> Result<Option<SourceEvent>>;

    /// Close the stream.
    async fn close(&mut self);
}

/// Production source tailing a MySQL/MariaDB binary log
pub struct MySqlBinlogSource {
    stream: Option<BinlogStream>,
    current_log: String,
    pending: VecDeque<SourceEvent>,
    ddl: DdlMatcher,
}

impl MySqlBinlogSource {
    /// Register as a replica and start streaming from `from`.
    ///
    /// A zero position means "wherever the source is now"; the current
    /// master coordinate is fetched first in that case.
    pub async fn connect(config: &Config, from: Position) -> Result<Self> {
        let opts = mysql_opts(config)?;

        let from = if from.name.is_empty() {
            let current = fetch_master_position(config).await?;
            info!("no saved position, starting from master position {}", current);
            current
        } else {
            from
        };

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let conn = backoff::future::retry(policy, || async {
            Conn::new(opts.clone())
                .await
                .map_err(|e| backoff::Error::transient(RiverError::from(e)))
        })
        .await?;

        info!(
            "registering replica server_id={} flavor={} from {}",
            config.server_id, config.flavor, from
        );

        let request = BinlogStreamRequest::new(config.server_id)
            .with_filename(from.name.as_bytes())
            .with_pos(u64::from(from.pos));
        let stream = conn.get_binlog_stream(request).await?;

        Ok(Self {
            stream: Some(stream),
            current_log: from.name,
            pending: VecDeque::new(),
            ddl: DdlMatcher::new(),
        })
    }
}

#[async_trait]
impl BinlogSource for MySqlBinlogSource {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };
            let Some(packet) = stream.next().await else {
                return Ok(None);
            };
            let event = packet?;
            let next_pos = event.header().log_pos();

            let Some(data) = event.read_data()? else {
                continue;
            };

            match data {
                EventData::RotateEvent(rotate) => {
                    let next = Position::new(rotate.name().to_string(), rotate.position() as u32);
                    self.current_log = next.name.clone();
                    self.pending.push_back(SourceEvent::Rotate { next });
                }

                EventData::QueryEvent(query_event) => {
                    let query = query_event.query().trim().to_string();
                    if query.eq_ignore_ascii_case("BEGIN")
                        || query.eq_ignore_ascii_case("COMMIT")
                    {
                        continue;
                    }

                    let next = Position::new(self.current_log.clone(), next_pos);
                    let default_schema = query_event.schema().to_string();

                    if let Some((schema, table)) = self.ddl.parse(&query, &default_schema) {
                        self.pending
                            .push_back(SourceEvent::TableChanged { schema, table });
                        self.pending.push_back(SourceEvent::Ddl { next, query });
                    }
                    // non-DDL statements in statement format are not mirrored
                }

                EventData::XidEvent(_) => {
                    let next = Position::new(self.current_log.clone(), next_pos);
                    self.pending.push_back(SourceEvent::Xid { next });
                }

                EventData::GtidEvent(gtid) => {
                    let sid = gtid.sid();
                    self.pending.push_back(SourceEvent::Gtid {
                        gtid: format!("{}:{}", format_sid(&sid), gtid.gno()),
                    });
                }

                EventData::RowsEvent(rows_data) => {
                    let Some(table_map) = stream.get_tme(rows_data.table_id()) else {
                        warn!(
                            "rows event without table map (table_id={}), skipping",
                            rows_data.table_id()
                        );
                        continue;
                    };

                    let schema = table_map.database_name().to_string();
                    let table = table_map.table_name().to_string();

                    let action = match &rows_data {
                        RowsEventData::WriteRowsEvent(_)
                        | RowsEventData::WriteRowsEventV1(_) => RowsAction::Insert,
                        RowsEventData::UpdateRowsEvent(_)
                        | RowsEventData::UpdateRowsEventV1(_)
                        | RowsEventData::PartialUpdateRowsEvent(_) => RowsAction::Update,
                        RowsEventData::DeleteRowsEvent(_)
                        | RowsEventData::DeleteRowsEventV1(_) => RowsAction::Delete,
                        _ => {
                            debug!("unhandled rows event kind for {}.{}", schema, table);
                            continue;
                        }
                    };

                    let mut rows = Vec::new();
                    for row in rows_data.rows(table_map) {
                        let (before, after) = row.map_err(|e| {
                            RiverError::protocol(format!(
                                "failed to decode row image for {}.{}: {}",
                                schema, table, e
                            ))
                        })?;

                        match action {
                            RowsAction::Insert => {
                                if let Some(image) = after {
                                    rows.push(binlog_row_values(image));
                                }
                            }
                            RowsAction::Delete => {
                                if let Some(image) = before {
                                    rows.push(binlog_row_values(image));
                                }
                            }
                            RowsAction::Update => {
                                if let (Some(b), Some(a)) = (before, after) {
                                    rows.push(binlog_row_values(b));
                                    rows.push(binlog_row_values(a));
                                }
                            }
                        }
                    }

                    if !rows.is_empty() {
                        self.pending.push_back(SourceEvent::Rows(RowsEvent {
                            schema,
                            table,
                            action,
                            rows,
                        }));
                    }
                }

                // table maps are consumed by the stream itself; format
                // descriptions and heartbeats carry no work
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.close().await {
                warn!("error closing binlog stream: {}", err);
            }
        }
    }
}

/// Materialize the column values of one binlog row image.
fn binlog_row_values(row: BinlogRow) -> Vec<RowValue> {
    (0..row.len())
        .map(|i| match row.as_ref(i) {
            None => RowValue::Null,
            Some(BinlogValue::Value(value)) => RowValue::from_mysql(value.clone()),
            Some(BinlogValue::Jsonb(jsonb)) => match serde_json::Value::try_from(jsonb.clone()) {
                Ok(json) => RowValue::String(json.to_string()),
                Err(err) => {
                    warn!("undecodable JSONB value: {}", err);
                    RowValue::Null
                }
            },
            Some(BinlogValue::JsonDiff(_)) => {
                // partial JSON updates need binlog_row_value_options=''
                warn!("partial JSON diff in row image is not supported");
                RowValue::Null
            }
        })
        .collect()
}

fn format_sid(sid: &[u8; 16]) -> String {
    let hex: Vec<String> = sid.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        hex[0..4].join(""),
        hex[4..6].join(""),
        hex[6..8].join(""),
        hex[8..10].join(""),
        hex[10..16].join("")
    )
}

/// Read the current master coordinate from the source.
async fn fetch_master_position(config: &Config) -> Result<Position> {
    let opts = mysql_opts(config)?;
    let mut conn = Conn::new(opts).await?;

    let row: Option<mysql_async::Row> = conn.query_first("SHOW MASTER STATUS").await?;
    let Some(row) = row else {
        return Err(RiverError::schema_resolve(
            "SHOW MASTER STATUS returned nothing; is binary logging enabled?",
        ));
    };

    let name: String = row.get(0).unwrap_or_default();
    let pos: u64 = row.get(1).unwrap_or(4);
    Ok(Position::new(name, pos as u32))
}

/// Classifier for schema-changing statements
///
/// Extracts the affected `(schema, table)` from ALTER/CREATE/DROP/RENAME/
/// TRUNCATE statements; the schema falls back to the session default when
/// the table reference is unqualified.
struct DdlMatcher {
    patterns: Vec<Regex>,
}

impl DdlMatcher {
    fn new() -> Self {
        let table_ref = r"`?(?:(?P<schema>[^`\s.]+)`?\.`?)?(?P<table>[^`\s.(]+)`?";
        let sources = [
            format!(r"(?i)^ALTER\s+TABLE\s+{}", table_ref),
            format!(
                r"(?i)^CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?{}",
                table_ref
            ),
            format!(r"(?i)^DROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?{}", table_ref),
            format!(r"(?i)^TRUNCATE\s+(?:TABLE\s+)?{}", table_ref),
            format!(r"(?i)^RENAME\s+TABLE\s+{}", table_ref),
        ];

        let patterns = sources
            .iter()
            .map(|p| Regex::new(p).expect("static DDL pattern"))
            .collect();

        Self { patterns }
    }

    fn parse(&self, query: &str, default_schema: &str) -> Option<(String, String)> {
        for pattern in &self.patterns {
            if let Some(caps) = pattern.captures(query) {
                let schema = caps
                    .name("schema")
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| default_schema.to_string());
                let table = caps.name("table")?.as_str().to_string();
                if schema.is_empty() {
                    return None;
                }
                return Some((schema, table));
            }
        }
        None
    }
}
