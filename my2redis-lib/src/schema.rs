//! Source table metadata and raw row-image values
//!
//! Binlog row events carry values by column position only; the column names,
//! type tags, and primary-key layout come from `INFORMATION_SCHEMA`. The
//! [`SchemaResolver`] trait is the seam between the pipeline and the live
//! source: the production implementation queries MySQL, tests substitute an
//! in-memory resolver.

use crate::config::Config;
use crate::error::{Result, RiverError};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool};

/// Type tag of a source column, driving value decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Number,
    Float,
    Decimal,
    Enum,
    Set,
    String,
    Binary,
    Bit,
    Json,
    DateTime,
    Timestamp,
    Date,
    Time,
}

/// One column of a mirrored table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    pub name: String,
    pub col_type: ColumnType,

    /// ENUM labels in declaration order; empty for other types
    pub enum_values: Vec<String>,

    /// SET labels in declaration order; empty for other types
    pub set_values: Vec<String>,
}

impl TableColumn {
    pub fn new<S: Into<String>>(name: S, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            enum_values: Vec::new(),
            set_values: Vec::new(),
        }
    }
}

/// Resolved metadata of a mirrored table
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub columns: Vec<TableColumn>,

    /// Indices of the primary-key columns, in key order
    pub pk_indices: Vec<usize>,
}

impl TableInfo {
    /// Extract the primary-key values of a row image, in key order.
    pub fn pk_values<'a>(&self, row: &'a [RowValue]) -> Result<Vec<&'a RowValue>> {
        self.pk_indices
            .iter()
            .map(|&i| {
                row.get(i).ok_or_else(|| {
                    RiverError::protocol(format!(
                        "row image for {}.{} is missing PK column {}",
                        self.schema, self.name, i
                    ))
                })
            })
            .collect()
    }
}

/// Raw column value out of a row image, before decoding
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl RowValue {
    /// Convert a value from the binlog client into the pipeline representation.
    ///
    /// Temporal values are rendered in the source-native text format so that
    /// the column decoder sees the same shape for binlog and snapshot rows.
    pub fn from_mysql(value: mysql_async::Value) -> RowValue {
        use mysql_async::Value;

        match value {
            Value::NULL => RowValue::Null,
            Value::Int(v) => RowValue::Int(v),
            Value::UInt(v) => RowValue::UInt(v),
            Value::Float(v) => RowValue::Float(f64::from(v)),
            Value::Double(v) => RowValue::Float(v),
            Value::Bytes(v) => RowValue::Bytes(v),
            Value::Date(year, month, day, hour, minute, second, _micros) => {
                RowValue::String(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, minute, second
                ))
            }
            Value::Time(negative, days, hours, minutes, seconds, _micros) => {
                let sign = if negative { "-" } else { "" };
                let total_hours = days * 24 + u32::from(hours);
                RowValue::String(format!(
                    "{}{:02}:{:02}:{:02}",
                    sign, total_hours, minutes, seconds
                ))
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RowValue::Null)
    }
}

/// Resolution of live table metadata against the source database
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    /// List the base tables of a schema.
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>>;

    /// Resolve the metadata of one table; `None` when the table does not exist.
    async fn table_info(&self, schema: &str, table: &str) -> Result<Option<TableInfo>>;
}

/// Resolver backed by `INFORMATION_SCHEMA` queries on the source MySQL
pub struct MySqlSchemaResolver {
    pool: Pool,
}

impl MySqlSchemaResolver {
    /// Create a resolver from the daemon configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let opts = mysql_opts(config)?;
        Ok(Self {
            pool: Pool::new(opts),
        })
    }

    /// Access the underlying connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl SchemaResolver for MySqlSchemaResolver {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;

        let query = r"
            SELECT TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        ";

        let tables: Vec<String> = conn.exec(query, (schema,)).await?;
        Ok(tables)
    }

    async fn table_info(&self, schema: &str, table: &str) -> Result<Option<TableInfo>> {
        let mut conn = self.pool.get_conn().await?;

        let query = r"
            SELECT COLUMN_NAME, DATA_TYPE, COLUMN_TYPE, COLUMN_KEY
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        ";

        let rows: Vec<(String, String, String, String)> =
            conn.exec(query, (schema, table)).await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut info = TableInfo {
            schema: schema.to_string(),
            name: table.to_string(),
            columns: Vec::with_capacity(rows.len()),
            pk_indices: Vec::new(),
        };

        for (index, (name, data_type, column_type, column_key)) in rows.into_iter().enumerate() {
            let mut column = TableColumn::new(name, map_data_type(&data_type));
            match column.col_type {
                ColumnType::Enum => column.enum_values = parse_type_values(&column_type, "enum"),
                ColumnType::Set => column.set_values = parse_type_values(&column_type, "set"),
                _ => {}
            }

            if column_key == "PRI" {
                info.pk_indices.push(index);
            }
            info.columns.push(column);
        }

        Ok(Some(info))
    }
}

/// Map an `INFORMATION_SCHEMA` data type to the pipeline type tag.
fn map_data_type(data_type: &str) -> ColumnType {
    match data_type {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => {
            ColumnType::Number
        }
        "float" | "double" => ColumnType::Float,
        "decimal" | "numeric" => ColumnType::Decimal,
        "enum" => ColumnType::Enum,
        "set" => ColumnType::Set,
        "bit" => ColumnType::Bit,
        "json" => ColumnType::Json,
        "datetime" => ColumnType::DateTime,
        "timestamp" => ColumnType::Timestamp,
        "date" => ColumnType::Date,
        "time" => ColumnType::Time,
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
            ColumnType::Binary
        }
        _ => ColumnType::String,
    }
}

/// Parse the label list out of a `COLUMN_TYPE` such as `enum('e1','e2')`.
fn parse_type_values(column_type: &str, kind: &str) -> Vec<String> {
    let lower = column_type.to_ascii_lowercase();
    let Some(rest) = lower.strip_prefix(kind) else {
        return Vec::new();
    };
    let start = match rest.find('(') {
        Some(i) => kind.len() + i + 1,
        None => return Vec::new(),
    };
    let end = match column_type.rfind(')') {
        Some(i) if i > start => i,
        _ => return Vec::new(),
    };

    column_type[start..end]
        .split(',')
        .map(|v| v.trim().trim_matches('\'').replace("''", "'"))
        .collect()
}

/// Build connection options for the configured source endpoint.
pub(crate) fn mysql_opts(config: &Config) -> Result<Opts> {
    let (host, port) = match config.my_addr.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| RiverError::config(format!("invalid my_addr {:?}", config.my_addr)))?;
            (host.to_string(), port)
        }
        None => (config.my_addr.clone(), 3306),
    };

    let builder = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(port)
        .user(Some(config.my_user.clone()))
        .pass(Some(config.my_pass.clone()));

    Ok(Opts::from(builder))
}
