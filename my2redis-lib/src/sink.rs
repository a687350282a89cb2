//! Writing row changes into Redis hashes
//!
//! [`SinkExecutor`] is the boundary to the key-value client: two hash
//! commands and a close. [`SinkWriter`] sits above it and owns the
//! translation of row images into commands: key construction, column
//! filtering, changed-column diffing, and the row-identity-change dance on
//! primary-key updates. The writer is driven by a single task; see the
//! pipeline's single-writer discipline.

use crate::decode::decode_column;
use crate::error::{Result, RiverError};
use crate::keys::build_key;
use crate::rule::Rule;
use crate::schema::RowValue;
use crate::stats::Stats;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Commands the pipeline issues against the key-value store
#[async_trait]
pub trait SinkExecutor: Send {
    /// Set several hash fields of one key in a single command.
    async fn hset_multiple(&mut self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Delete one hash field of one key.
    async fn hdel(&mut self, key: &str, field: &str) -> Result<()>;

    /// Release the connection.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Production executor backed by a Redis connection
pub struct RedisSink {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisSink {
    /// Connect to the configured Redis endpoint, retrying transient failures
    /// with exponential backoff.
    pub async fn connect(addr: &str) -> Result<Self> {
        let url = format!("redis://{}", addr);
        let client = redis::Client::open(url.as_str())?;

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let conn = backoff::future::retry(policy, || async {
            client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| backoff::Error::transient(RiverError::from(e)))
        })
        .await?;

        info!("connected to redis at {}", addr);
        Ok(Self { conn })
    }
}

#[async_trait]
impl SinkExecutor for RedisSink {
    async fn hset_multiple(&mut self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let _: () = redis::AsyncCommands::hset_multiple(&mut self.conn, key, fields).await?;
        Ok(())
    }

    async fn hdel(&mut self, key: &str, field: &str) -> Result<()> {
        let _: () = redis::AsyncCommands::hdel(&mut self.conn, key, field).await?;
        Ok(())
    }
}

/// Translates row images into sink commands and keeps the counters
pub struct SinkWriter {
    executor: Box<dyn SinkExecutor>,
    stats: Arc<Stats>,
}

impl SinkWriter {
    pub fn new(executor: Box<dyn SinkExecutor>, stats: Arc<Stats>) -> Self {
        Self { executor, stats }
    }

    /// Apply a batch of inserted rows.
    pub async fn insert_rows(&mut self, rule: &Rule, rows: &[Vec<RowValue>]) -> Result<()> {
        for row in rows {
            self.insert_row(rule, row).await?;
        }
        Ok(())
    }

    /// Apply a batch of deleted rows.
    pub async fn delete_rows(&mut self, rule: &Rule, rows: &[Vec<RowValue>]) -> Result<()> {
        for row in rows {
            self.delete_row(rule, row).await?;
        }
        Ok(())
    }

    /// Apply a batch of updates carried as flat before/after pairs.
    ///
    /// An odd number of rows is a protocol violation. A pair whose
    /// primary key changed is applied as delete-then-insert so the row
    /// moves to its new key.
    pub async fn update_rows(&mut self, rule: &Rule, rows: &[Vec<RowValue>]) -> Result<()> {
        if rows.len() % 2 != 0 {
            return Err(RiverError::protocol(format!(
                "invalid update rows event, must have 2x rows, but {}",
                rows.len()
            )));
        }

        for pair in rows.chunks(2) {
            let before = &pair[0];
            let after = &pair[1];

            let before_key = build_key(rule, before)?;
            let after_key = build_key(rule, after)?;

            if before_key != after_key {
                self.delete_row(rule, before).await?;
                self.insert_row(rule, after).await?;
            } else {
                self.update_row(rule, before, after).await?;
            }
        }

        Ok(())
    }

    /// Write one inserted row as a full hash.
    pub async fn insert_row(&mut self, rule: &Rule, row: &[RowValue]) -> Result<()> {
        let key = build_key(rule, row)?;

        let mut fields = Vec::with_capacity(rule.table_info.columns.len());
        for (i, column) in rule.table_info.columns.iter().enumerate() {
            if !rule.check_filter(&column.name) {
                continue;
            }
            let Some(raw) = row.get(i) else {
                // row image shorter than the cached schema, e.g. mid-ALTER
                debug!("row for {} is missing column {}", key, column.name);
                continue;
            };
            let value = decode_column(column, raw).to_field_string();
            fields.push((column.name.clone(), value));
        }

        self.executor.hset_multiple(&key, &fields).await?;
        self.stats.incr_insert();

        debug!("insert row {}", key);
        Ok(())
    }

    /// Rewrite only the columns whose value changed; a no-change update
    /// issues no command at all.
    async fn update_row(
        &mut self,
        rule: &Rule,
        before: &[RowValue],
        after: &[RowValue],
    ) -> Result<()> {
        let key = build_key(rule, before)?;

        let mut fields = Vec::new();
        for (i, column) in rule.table_info.columns.iter().enumerate() {
            if !rule.check_filter(&column.name) {
                continue;
            }
            let (Some(old), Some(new)) = (before.get(i), after.get(i)) else {
                continue;
            };
            if old == new {
                continue;
            }
            let value = decode_column(column, new).to_field_string();
            fields.push((column.name.clone(), value));
        }

        if !fields.is_empty() {
            self.executor.hset_multiple(&key, &fields).await?;
        }
        self.stats.incr_update();

        debug!("update row {} ({} changed columns)", key, fields.len());
        Ok(())
    }

    /// Remove one row, field by field in column order.
    ///
    /// Per-field deletes preserve hash siblings written by other producers;
    /// a whole-key DEL would not.
    pub async fn delete_row(&mut self, rule: &Rule, row: &[RowValue]) -> Result<()> {
        let key = build_key(rule, row)?;

        for column in &rule.table_info.columns {
            self.executor.hdel(&key, &column.name).await?;
        }
        self.stats.incr_delete();

        debug!("delete row {}", key);
        Ok(())
    }

    /// Close the underlying connection.
    pub async fn close(&mut self) -> Result<()> {
        self.executor.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, TableColumn, TableInfo};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    /// In-memory hash store recording every command
    #[derive(Default)]
    struct MemoryExecutor {
        hashes: Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl MemoryExecutor {
        fn handle(&self) -> Arc<Mutex<HashMap<String, BTreeMap<String, String>>>> {
            self.hashes.clone()
        }
    }

    fn injected_failure() -> RiverError {
        RiverError::generic("injected sink failure")
    }

    #[async_trait]
    impl SinkExecutor for MemoryExecutor {
        async fn hset_multiple(&mut self, key: &str, fields: &[(String, String)]) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(injected_failure());
            }
            let mut hashes = self.hashes.lock().unwrap();
            let hash = hashes.entry(key.to_string()).or_default();
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
            Ok(())
        }

        async fn hdel(&mut self, key: &str, field: &str) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(injected_failure());
            }
            let mut hashes = self.hashes.lock().unwrap();
            if let Some(hash) = hashes.get_mut(key) {
                hash.remove(field);
                if hash.is_empty() {
                    hashes.remove(key);
                }
            }
            Ok(())
        }
    }

    fn test_rule() -> Rule {
        let mut tenum = TableColumn::new("tenum", ColumnType::Enum);
        tenum.enum_values = vec!["e1".into(), "e2".into(), "e3".into()];
        let mut tset = TableColumn::new("tset", ColumnType::Set);
        tset.set_values = vec!["a".into(), "b".into(), "c".into()];

        let mut rule = Rule::new("test", "test_river");
        rule.table_info = TableInfo {
            schema: "test".into(),
            name: "test_river".into(),
            columns: vec![
                TableColumn::new("id", ColumnType::Number),
                TableColumn::new("title", ColumnType::String),
                TableColumn::new("content", ColumnType::String),
                tenum,
                tset,
                TableColumn::new("tbit", ColumnType::Bit),
            ],
            pk_indices: vec![0],
        };
        rule
    }

    fn sample_row(id: i64, title: &str) -> Vec<RowValue> {
        vec![
            RowValue::Int(id),
            RowValue::Bytes(title.as_bytes().to_vec()),
            RowValue::Bytes(b"hello go 1".to_vec()),
            RowValue::Int(1),
            RowValue::Int(0b011),
            RowValue::Int(1),
        ]
    }

    fn writer() -> (SinkWriter, Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>, Arc<Stats>) {
        let executor = MemoryExecutor::default();
        let handle = executor.handle();
        let stats = Stats::new();
        (
            SinkWriter::new(Box::new(executor), stats.clone()),
            handle,
            stats,
        )
    }

    #[tokio::test]
    async fn test_insert_row_builds_hash() {
        let (mut writer, hashes, stats) = writer();
        let rule = test_rule();

        writer.insert_row(&rule, &sample_row(1, "first")).await.unwrap();

        let hashes = hashes.lock().unwrap();
        let hash = hashes.get("test:test_river:1").unwrap();
        assert_eq!(hash.get("title").unwrap(), "first");
        assert_eq!(hash.get("tenum").unwrap(), "e1");
        assert_eq!(hash.get("tset").unwrap(), "a,b");
        assert_eq!(hash.get("tbit").unwrap(), "1");
        assert_eq!(stats.insert_num(), 1);
    }

    #[tokio::test]
    async fn test_insert_respects_filter() {
        let (mut writer, hashes, _) = writer();
        let mut rule = test_rule();
        rule.filter = vec!["id".into(), "title".into()];

        writer.insert_row(&rule, &sample_row(1, "first")).await.unwrap();

        let hashes = hashes.lock().unwrap();
        let hash = hashes.get("test:test_river:1").unwrap();
        assert_eq!(hash.len(), 2);
        assert!(hash.contains_key("id"));
        assert!(hash.contains_key("title"));
        assert!(!hash.contains_key("content"));
    }

    #[tokio::test]
    async fn test_update_rewrites_only_changed_columns() {
        let (mut writer, hashes, stats) = writer();
        let rule = test_rule();

        writer.insert_row(&rule, &sample_row(2, "second")).await.unwrap();

        let before = sample_row(2, "second");
        let mut after = sample_row(2, "second 2");
        after[3] = RowValue::Int(3); // tenum -> e3
        after[4] = RowValue::Int(0b111); // tset -> a,b,c

        writer.update_rows(&rule, &[before, after]).await.unwrap();

        let hashes = hashes.lock().unwrap();
        let hash = hashes.get("test:test_river:2").unwrap();
        assert_eq!(hash.get("title").unwrap(), "second 2");
        assert_eq!(hash.get("tenum").unwrap(), "e3");
        assert_eq!(hash.get("tset").unwrap(), "a,b,c");
        // untouched column keeps its prior value
        assert_eq!(hash.get("content").unwrap(), "hello go 1");
        assert_eq!(stats.update_num(), 1);
    }

    #[tokio::test]
    async fn test_update_with_no_changes_issues_no_command() {
        let (mut writer, hashes, stats) = writer();
        let rule = test_rule();

        let row = sample_row(3, "third");
        writer
            .update_rows(&rule, &[row.clone(), row])
            .await
            .unwrap();

        assert!(hashes.lock().unwrap().is_empty());
        assert_eq!(stats.update_num(), 1);
    }

    #[tokio::test]
    async fn test_update_with_pk_change_moves_row() {
        let (mut writer, hashes, stats) = writer();
        let rule = test_rule();

        writer.insert_row(&rule, &sample_row(2, "second")).await.unwrap();

        let before = sample_row(2, "second");
        let mut after = sample_row(30, "second 30");
        after[0] = RowValue::Int(30);

        writer.update_rows(&rule, &[before, after]).await.unwrap();

        let hashes = hashes.lock().unwrap();
        assert!(!hashes.contains_key("test:test_river:2"));
        let moved = hashes.get("test:test_river:30").unwrap();
        assert_eq!(moved.get("title").unwrap(), "second 30");
        assert_eq!(stats.insert_num(), 2);
        assert_eq!(stats.delete_num(), 1);
        assert_eq!(stats.update_num(), 0);
    }

    #[tokio::test]
    async fn test_update_rows_odd_length_is_protocol_violation() {
        let (mut writer, _, _) = writer();
        let rule = test_rule();

        let err = writer
            .update_rows(&rule, &[sample_row(1, "only")])
            .await
            .unwrap_err();
        assert!(matches!(err, RiverError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_every_field() {
        let (mut writer, hashes, stats) = writer();
        let rule = test_rule();

        writer.insert_row(&rule, &sample_row(1, "first")).await.unwrap();
        writer.delete_row(&rule, &sample_row(1, "first")).await.unwrap();

        assert!(!hashes.lock().unwrap().contains_key("test:test_river:1"));
        assert_eq!(stats.delete_num(), 1);
    }

    #[tokio::test]
    async fn test_nil_pk_surfaces_error() {
        let (mut writer, _, _) = writer();
        let rule = test_rule();

        let mut row = sample_row(1, "first");
        row[0] = RowValue::Null;

        let err = writer.insert_row(&rule, &row).await.unwrap_err();
        assert!(matches!(err, RiverError::PkMissing { .. }));
    }

    #[tokio::test]
    async fn test_sink_failure_surfaces_unchanged() {
        let executor = MemoryExecutor::default();
        *executor.fail.lock().unwrap() = true;
        let stats = Stats::new();
        let mut writer = SinkWriter::new(Box::new(executor), stats.clone());
        let rule = test_rule();

        let err = writer.insert_row(&rule, &sample_row(1, "first")).await.unwrap_err();
        assert!(matches!(err, RiverError::Generic(_)));
        assert_eq!(stats.insert_num(), 0);
    }

    #[tokio::test]
    async fn test_counter_sum_matches_operations() {
        let (mut writer, _, stats) = writer();
        let rule = test_rule();

        writer.insert_row(&rule, &sample_row(1, "a")).await.unwrap();
        writer.insert_row(&rule, &sample_row(2, "b")).await.unwrap();
        writer
            .update_rows(&rule, &[sample_row(2, "b"), sample_row(2, "b2")])
            .await
            .unwrap();
        writer.delete_row(&rule, &sample_row(1, "a")).await.unwrap();

        assert_eq!(
            stats.insert_num() + stats.update_num() + stats.delete_num(),
            4
        );
    }
}
