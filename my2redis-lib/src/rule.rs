//! Sync rules and the rule registry
//!
//! A rule maps one concrete source table to its sink write policy: which
//! columns to mirror and the cached table metadata used to decode row
//! images. Regex table patterns are expanded into concrete rules at
//! bootstrap; at runtime the registry is read on every row event and
//! written only on DDL notifications.

use crate::error::{Result, RiverError};
use crate::schema::{SchemaResolver, TableInfo};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// How to sync one source table into Redis
#[derive(Debug, Clone)]
pub struct Rule {
    pub schema: String,

    /// Concrete table name (regex patterns are expanded before registration)
    pub table: String,

    /// Only columns named here are synced; empty means all columns
    pub filter: Vec<String>,

    /// Cached source table metadata
    pub table_info: TableInfo,
}

impl Rule {
    pub fn new<S1: Into<String>, S2: Into<String>>(schema: S1, table: S2) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            filter: Vec::new(),
            table_info: TableInfo::default(),
        }
    }

    /// Whether the named column should be synced.
    pub fn check_filter(&self, name: &str) -> bool {
        self.filter.is_empty() || self.filter.iter().any(|f| f == name)
    }
}

fn rule_key(schema: &str, table: &str) -> String {
    format!("{}:{}", schema, table)
}

/// Registry of concrete rules keyed by `(schema, table)`
///
/// Reads take a shared lock and clone out an `Arc<Rule>` snapshot, so a row
/// application never observes a rule mid-swap.
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Arc<Rule>>>,
    resolver: Arc<dyn SchemaResolver>,
}

impl RuleRegistry {
    pub fn new(resolver: Arc<dyn SchemaResolver>) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            resolver,
        }
    }

    /// Register a rule; a duplicate `(schema, table)` is a configuration error.
    pub fn register(&self, rule: Rule) -> Result<()> {
        let key = rule_key(&rule.schema, &rule.table);
        let mut rules = self.rules.write().unwrap();
        if rules.contains_key(&key) {
            return Err(RiverError::config(format!(
                "duplicate rule for {}.{}",
                rule.schema, rule.table
            )));
        }
        debug!("registered rule for {}.{}", rule.schema, rule.table);
        rules.insert(key, Arc::new(rule));
        Ok(())
    }

    /// Replace a registered rule unconditionally.
    pub fn replace(&self, rule: Rule) {
        let key = rule_key(&rule.schema, &rule.table);
        self.rules.write().unwrap().insert(key, Arc::new(rule));
    }

    /// Look up the rule for a table, if any.
    pub fn resolve(&self, schema: &str, table: &str) -> Option<Arc<Rule>> {
        self.rules
            .read()
            .unwrap()
            .get(&rule_key(schema, table))
            .cloned()
    }

    /// Re-read the table metadata after a DDL notification.
    ///
    /// When the table no longer exists the entry is dropped and the
    /// rule-not-found condition is returned; callers decide whether that is
    /// fatal.
    pub async fn refresh(&self, schema: &str, table: &str) -> Result<()> {
        let Some(existing) = self.resolve(schema, table) else {
            return Err(RiverError::rule_not_found(schema, table));
        };

        match self.resolver.table_info(schema, table).await? {
            Some(info) => {
                let mut rule = (*existing).clone();
                rule.table_info = info;
                self.replace(rule);
                info!("refreshed table info for {}.{}", schema, table);
                Ok(())
            }
            None => {
                self.rules.write().unwrap().remove(&rule_key(schema, table));
                info!("dropped rule for vanished table {}.{}", schema, table);
                Err(RiverError::rule_not_found(schema, table))
            }
        }
    }

    /// Snapshot of all registered rules.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        let mut rules: Vec<Arc<Rule>> = self.rules.read().unwrap().values().cloned().collect();
        rules.sort_by(|a, b| (&a.schema, &a.table).cmp(&(&b.schema, &b.table)));
        rules
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().unwrap().is_empty()
    }

    /// The resolver this registry refreshes metadata through.
    pub fn resolver(&self) -> &Arc<dyn SchemaResolver> {
        &self.resolver
    }
}
