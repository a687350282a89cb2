use thiserror::Error;

/// Error types for the replication pipeline
#[derive(Error, Debug)]
pub enum RiverError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Table metadata could not be resolved from the source
    #[error("schema resolve failed: {0}")]
    SchemaResolve(String),

    /// No sync rule is registered for the given table
    #[error("rule not found for {schema}.{table}")]
    RuleNotFound { schema: String, table: String },

    /// A primary-key component of a row image is nil
    #[error("the {index}th PK value is nil for {schema}.{table}")]
    PkMissing {
        index: usize,
        schema: String,
        table: String,
    },

    /// Malformed event from the binlog source
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Sink command errors
    #[error("sink command failed: {0}")]
    Sink(#[from] redis::RedisError),

    /// Replication position could not be persisted
    #[error("position save failed: {0}")]
    PositionSave(String),

    /// The pipeline was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Binlog source errors
    #[error("source error: {0}")]
    Source(#[from] mysql_async::Error),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file parsing errors
    #[error("config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

impl RiverError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        RiverError::Config(msg.into())
    }

    /// Create a new schema resolve error
    pub fn schema_resolve<S: Into<String>>(msg: S) -> Self {
        RiverError::SchemaResolve(msg.into())
    }

    /// Create a new rule-not-found error
    pub fn rule_not_found<S1: Into<String>, S2: Into<String>>(schema: S1, table: S2) -> Self {
        RiverError::RuleNotFound {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Create a new missing-primary-key error
    pub fn pk_missing<S1: Into<String>, S2: Into<String>>(
        index: usize,
        schema: S1,
        table: S2,
    ) -> Self {
        RiverError::PkMissing {
            index,
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Create a new protocol violation error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        RiverError::Protocol(msg.into())
    }

    /// Create a new position save error
    pub fn position_save<S: Into<String>>(msg: S) -> Self {
        RiverError::PositionSave(msg.into())
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        RiverError::Generic(msg.into())
    }

    /// Whether this error is the cancellation marker
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RiverError::Cancelled)
    }

    /// Whether this error is the informational rule-not-found condition
    pub fn is_rule_not_found(&self) -> bool {
        matches!(self, RiverError::RuleNotFound { .. })
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, RiverError>;
