#![allow(dead_code)]

//! Shared fixtures for the pipeline integration tests
//!
//! The sink and the schema resolver are replaced by in-memory fakes; the
//! rest of the pipeline (registry, decoder, key builder, handler, sync
//! loop, position store) runs for real.

use async_trait::async_trait;
use my2redis_lib::{
    ColumnType, RiverError, RowValue, RowsAction, RowsEvent, Rule, RuleRegistry, SchemaResolver,
    SinkExecutor, SourceEvent, TableColumn, TableInfo,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

pub type HashStore = Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>;

/// In-memory Redis replacement recording hash state
#[derive(Default)]
pub struct MemorySink {
    hashes: HashStore,
    fail: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> HashStore {
        self.hashes.clone()
    }

    pub fn failure_flag(&self) -> Arc<Mutex<bool>> {
        self.fail.clone()
    }
}

#[async_trait]
impl SinkExecutor for MemorySink {
    async fn hset_multiple(
        &mut self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), RiverError> {
        if *self.fail.lock().unwrap() {
            return Err(RiverError::generic("injected sink failure"));
        }
        let mut hashes = self.hashes.lock().unwrap();
        let hash = hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hdel(&mut self, key: &str, field: &str) -> Result<(), RiverError> {
        if *self.fail.lock().unwrap() {
            return Err(RiverError::generic("injected sink failure"));
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

/// Static schema resolver serving pre-registered table metadata
pub struct MemoryResolver {
    tables: Mutex<HashMap<(String, String), TableInfo>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, info: TableInfo) {
        self.tables
            .lock()
            .unwrap()
            .insert((info.schema.clone(), info.name.clone()), info);
    }
}

impl Default for MemoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaResolver for MemoryResolver {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>, RiverError> {
        let tables = self.tables.lock().unwrap();
        let mut names: Vec<String> = tables
            .keys()
            .filter(|(s, _)| s == schema)
            .map(|(_, t)| t.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn table_info(&self, schema: &str, table: &str) -> Result<Option<TableInfo>, RiverError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(&(schema.to_string(), table.to_string())).cloned())
    }
}

/// Metadata of the `test.test_river` table used across the scenarios
pub fn test_river_info() -> TableInfo {
    let mut tenum = TableColumn::new("tenum", ColumnType::Enum);
    tenum.enum_values = vec!["e1".into(), "e2".into(), "e3".into()];
    let mut tset = TableColumn::new("tset", ColumnType::Set);
    tset.set_values = vec!["a".into(), "b".into(), "c".into()];

    TableInfo {
        schema: "test".into(),
        name: "test_river".into(),
        columns: vec![
            TableColumn::new("id", ColumnType::Number),
            TableColumn::new("title", ColumnType::String),
            TableColumn::new("content", ColumnType::String),
            tenum,
            tset,
            TableColumn::new("tbit", ColumnType::Bit),
            TableColumn::new("tdatetime", ColumnType::DateTime),
            TableColumn::new("ip", ColumnType::Number),
        ],
        pk_indices: vec![0],
    }
}

/// Registry with one rule for `test.test_river`
pub fn test_registry() -> Arc<RuleRegistry> {
    let resolver = Arc::new(MemoryResolver::new());
    resolver.put(test_river_info());

    let registry = Arc::new(RuleRegistry::new(resolver));
    let mut rule = Rule::new("test", "test_river");
    rule.table_info = test_river_info();
    registry.register(rule).unwrap();
    registry
}

/// Row image for `test.test_river` in table column order
#[allow(clippy::too_many_arguments)]
pub fn river_row(
    id: i64,
    title: &str,
    content: &str,
    tenum: i64,
    tset: i64,
    tbit: i64,
    tdatetime: Option<&str>,
    ip: u64,
) -> Vec<RowValue> {
    vec![
        RowValue::Int(id),
        RowValue::Bytes(title.as_bytes().to_vec()),
        RowValue::Bytes(content.as_bytes().to_vec()),
        RowValue::Int(tenum),
        RowValue::Int(tset),
        RowValue::Int(tbit),
        match tdatetime {
            Some(s) => RowValue::String(s.to_string()),
            None => RowValue::Null,
        },
        RowValue::UInt(ip),
    ]
}

pub fn rows_event(action: RowsAction, rows: Vec<Vec<RowValue>>) -> SourceEvent {
    SourceEvent::Rows(RowsEvent {
        schema: "test".into(),
        table: "test_river".into(),
        action,
        rows,
    })
}
