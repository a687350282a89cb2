//! TOML configuration for the river daemon
//!
//! The configuration names the source MySQL endpoint, the Redis sink, the
//! replica identity, and the set of tables to mirror. Tables are selected by
//! `[[source]]` bindings (literal names or regex patterns, `*` meaning all)
//! and customized by `[[rule]]` entries (per-table column filter).

use crate::error::{Result, RiverError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default interval between bulk flushes (reserved for batching)
const DEFAULT_FLUSH_BULK_TIME: Duration = Duration::from_millis(200);

/// Configuration for the river daemon
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Source MySQL endpoint, `host:port`
    pub my_addr: String,

    /// Source MySQL user
    pub my_user: String,

    /// Source MySQL password
    #[serde(default)]
    pub my_pass: String,

    /// Source connection charset
    #[serde(default = "default_charset")]
    pub my_charset: String,

    /// Redis sink endpoint, `host:port`
    pub redis_addr: String,

    /// Replica identity the source sees; must be unique among replicas
    #[serde(default = "default_server_id")]
    pub server_id: u32,

    /// Source dialect tag, `mysql` or `mariadb`
    #[serde(default = "default_flavor")]
    pub flavor: String,

    /// Directory holding the persisted replication position
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Bulk-snapshot switch; an empty value skips the snapshot phase
    #[serde(default)]
    pub dump_exec: String,

    /// HTTP endpoint for counters; empty disables the server
    #[serde(default)]
    pub stat_addr: String,

    /// Interval between bulk flushes (reserved for batching)
    #[serde(default)]
    pub flush_bulk_time: TomlDuration,

    /// Table selection per schema
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceConfig>,

    /// Per-table sync rules
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,
}

/// One `[[source]]` binding: a schema plus its table patterns
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub schema: String,
    pub tables: Vec<String>,
}

/// One `[[rule]]` entry customizing the sync of a table
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub schema: String,

    /// Literal table name or regex pattern
    pub table: String,

    /// Columns to sync; empty means all columns
    #[serde(default)]
    pub filter: Vec<String>,
}

impl Config {
    /// Parse a configuration from TOML text and validate it
    pub fn from_toml(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a configuration file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let text = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            RiverError::config(format!(
                "failed to read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&text)
    }

    /// Interval between bulk flushes
    pub fn flush_bulk_time(&self) -> Duration {
        self.flush_bulk_time.0
    }

    fn validate(&self) -> Result<()> {
        if self.my_addr.is_empty() {
            return Err(RiverError::config("my_addr is required"));
        }

        if self.redis_addr.is_empty() {
            return Err(RiverError::config("redis_addr is required"));
        }

        if self.server_id == 0 {
            return Err(RiverError::config("server_id must be non-zero"));
        }

        match self.flavor.as_str() {
            "mysql" | "mariadb" => {}
            other => {
                return Err(RiverError::config(format!(
                    "flavor must be mysql or mariadb, got {:?}",
                    other
                )))
            }
        }

        if self.sources.is_empty() {
            return Err(RiverError::config("at least one [[source]] is required"));
        }

        for source in &self.sources {
            if !is_valid_tables(&source.tables) {
                return Err(RiverError::config(format!(
                    "wildcard * is incompatible with other patterns in source {:?}",
                    source.schema
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if !seen.insert((rule.schema.clone(), rule.table.clone())) {
                return Err(RiverError::config(format!(
                    "duplicate rule for {}.{}",
                    rule.schema, rule.table
                )));
            }
        }

        Ok(())
    }
}

/// A source binding is invalid when `*` is combined with any other pattern.
pub fn is_valid_tables(tables: &[String]) -> bool {
    if tables.len() > 1 {
        return !tables.iter().any(|t| t == "*");
    }
    true
}

/// Expand the `*` token into a match-all regex; other patterns pass through.
pub fn build_table(table: &str) -> String {
    if table == "*" {
        ".*".to_string()
    } else {
        table.to_string()
    }
}

/// Whether a table pattern contains regex metacharacters.
pub fn is_regex_pattern(table: &str) -> bool {
    table
        .chars()
        .any(|c| matches!(c, '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\'))
}

/// Duration carried in TOML as a value with a unit suffix, e.g. `"200ms"`, `"3s"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TomlDuration(pub Duration);

impl Default for TomlDuration {
    fn default() -> Self {
        TomlDuration(DEFAULT_FLUSH_BULK_TIME)
    }
}

impl<'de> Deserialize<'de> for TomlDuration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse_duration(&text)
            .map(TomlDuration)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {:?}", text)))
    }
}

fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;

    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

fn default_charset() -> String {
    "utf8".to_string()
}

fn default_server_id() -> u32 {
    1001
}

fn default_flavor() -> String {
    "mysql".to_string()
}

fn default_data_dir() -> String {
    "./var".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
my_addr = "127.0.0.1:3306"
my_user = "root"
my_pass = ""
my_charset = "utf8"
redis_addr = "127.0.0.1:6379"
data_dir = "./var"

[[source]]
schema = "test"

tables = ["test_river", "test_river_[0-9]{4}", "test_river_filter"]

[[rule]]
schema = "test"
table = "test_river"


[[rule]]
schema = "test"
table = "test_river_filter"


[[rule]]
schema = "test"
table = "test_river_[0-9]{4}"

"#;

    #[test]
    fn test_config_parse() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].tables.len(), 3);
        assert_eq!(config.rules.len(), 3);
        assert_eq!(config.server_id, 1001);
        assert_eq!(config.flavor, "mysql");
    }

    #[test]
    fn test_table_validation() {
        let cases: &[(&[&str], bool)] = &[
            (&["*"], true),
            (&["table", "table2"], true),
            (&["*", "table"], false),
        ];

        for (tables, expect) in cases {
            let tables: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
            assert_eq!(
                is_valid_tables(&tables),
                *expect,
                "tables: {:?}",
                tables
            );
        }
    }

    #[test]
    fn test_build_table() {
        assert_eq!(build_table("*"), ".*");
        assert_eq!(build_table("table2"), "table2");
        assert_eq!(build_table("t"), "t");
    }

    #[test]
    fn test_regex_pattern_detection() {
        assert!(is_regex_pattern("test_river_[0-9]{4}"));
        assert!(is_regex_pattern(".*"));
        assert!(!is_regex_pattern("test_river"));
    }

    #[test]
    fn test_wildcard_mixed_with_patterns_rejected() {
        let text = r#"
my_addr = "127.0.0.1:3306"
my_user = "root"
redis_addr = "127.0.0.1:6379"

[[source]]
schema = "test"
tables = ["*", "other"]
"#;
        let err = Config::from_toml(text).unwrap_err();
        assert!(matches!(err, RiverError::Config(_)));
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let text = r#"
my_addr = "127.0.0.1:3306"
my_user = "root"
redis_addr = "127.0.0.1:6379"

[[source]]
schema = "test"
tables = ["t"]

[[rule]]
schema = "test"
table = "t"

[[rule]]
schema = "test"
table = "t"
"#;
        let err = Config::from_toml(text).unwrap_err();
        assert!(matches!(err, RiverError::Config(_)));
    }

    #[test]
    fn test_flush_bulk_time_parse() {
        let text = r#"
my_addr = "127.0.0.1:3306"
my_user = "root"
redis_addr = "127.0.0.1:6379"
flush_bulk_time = "3s"

[[source]]
schema = "test"
tables = ["t"]
"#;
        let config = Config::from_toml(text).unwrap();
        assert_eq!(config.flush_bulk_time(), Duration::from_secs(3));
    }

    #[test]
    fn test_flush_bulk_time_default() {
        let config = Config::from_toml(
            r#"
my_addr = "127.0.0.1:3306"
my_user = "root"
redis_addr = "127.0.0.1:6379"

[[source]]
schema = "test"
tables = ["t"]
"#,
        )
        .unwrap();
        assert_eq!(config.flush_bulk_time(), Duration::from_millis(200));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("200ms"), Some(Duration::from_millis(200)));
        assert_eq!(parse_duration("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("nope"), None);
        assert_eq!(parse_duration("10"), None);
    }
}
