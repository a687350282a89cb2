//! The river aggregate: bootstrap, run, shutdown
//!
//! All pipeline state is owned here; there are no globals. `new` validates
//! the configuration; `run` materializes rules against the live table list,
//! opens the sink, loads (or snapshots) the starting position, then drives
//! the binlog tail and the sync loop concurrently until completion, fatal
//! error, or cancellation. Shutdown is ordered: source first, then the sync
//! loop is joined, then the sink connection, then the position store goes
//! down with the loop.

use crate::config::{build_table, is_regex_pattern, Config};
use crate::error::{Result, RiverError};
use crate::position::PositionStore;
use crate::rule::{Rule, RuleRegistry};
use crate::schema::{MySqlSchemaResolver, SchemaResolver};
use crate::sink::{RedisSink, SinkWriter};
use crate::snapshot::run_snapshot;
use crate::source::{BinlogSource, MySqlBinlogSource};
use crate::stats::{StatServer, Stats};
use crate::sync::{sync_loop, EventHandler, SYNC_CHANNEL_CAPACITY};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// One CDC pipeline instance
pub struct River {
    config: Config,
    token: CancellationToken,
    stats: Arc<Stats>,
}

impl River {
    /// Validate the configuration and build the aggregate.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            token: CancellationToken::new(),
            stats: Stats::new(),
        })
    }

    /// Token cancelling every long-running part of the pipeline.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The sync counters.
    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Run the pipeline to completion.
    ///
    /// Returns `Ok` on a clean, cancellation-initiated shutdown and the
    /// first fatal error otherwise.
    pub async fn run(&mut self) -> Result<()> {
        let resolver: Arc<dyn SchemaResolver> =
            Arc::new(MySqlSchemaResolver::new(&self.config)?);
        let registry = Arc::new(RuleRegistry::new(resolver.clone()));
        materialize_rules(&self.config, &registry, resolver.as_ref()).await?;
        info!("materialized {} sync rules", registry.len());

        let sink = RedisSink::connect(&self.config.redis_addr).await?;
        let mut writer = SinkWriter::new(Box::new(sink), self.stats.clone());

        let store = PositionStore::open(Path::new(&self.config.data_dir)).await?;
        let mut position = store.load().await?;

        if position.is_zero() && !self.config.dump_exec.is_empty() {
            position = run_snapshot(&self.config, &registry, &mut writer, &self.token).await?;
            store.save(&position).await?;
        }

        let (sync_tx, sync_rx) = mpsc::channel(SYNC_CHANNEL_CAPACITY);
        let sync_handle = tokio::spawn(sync_loop(sync_rx, store, self.token.clone()));

        if !self.config.stat_addr.is_empty() {
            let server = StatServer::new(
                self.config.stat_addr.clone(),
                self.stats.clone(),
                self.token.clone(),
            );
            tokio::spawn(async move {
                if let Err(err) = server.serve().await {
                    error!("stat server failed: {}", err);
                }
            });
        }

        let mut source = MySqlBinlogSource::connect(&self.config, position.clone()).await?;
        let mut handler = EventHandler::new(
            registry.clone(),
            writer,
            sync_tx,
            self.token.clone(),
        );

        info!("start sync from position {}", position);
        let tail_result = self.tail(&mut source, &mut handler).await;

        // ordered teardown: source, sync loop, sink
        source.close().await;
        self.token.cancel();
        let sync_result = match sync_handle.await {
            Ok(result) => result,
            Err(err) => Err(RiverError::generic(format!("sync loop panicked: {}", err))),
        };
        if let Err(err) = handler.close().await {
            error!("error closing sink: {}", err);
        }

        first_fatal(tail_result, sync_result)
    }

    /// Drive the source until it ends or the pipeline is cancelled.
    async fn tail(
        &self,
        source: &mut MySqlBinlogSource,
        handler: &mut EventHandler,
    ) -> Result<()> {
        loop {
            let event = tokio::select! {
                _ = self.token.cancelled() => return Err(RiverError::Cancelled),
                event = source.next_event() => event?,
            };

            match event {
                Some(event) => handler.handle(event).await?,
                None => {
                    info!("binlog stream ended");
                    return Ok(());
                }
            }
        }
    }
}

/// Collapse the tail and sync-loop outcomes into the pipeline result,
/// treating cancellation as clean shutdown.
fn first_fatal(tail: Result<()>, sync: Result<()>) -> Result<()> {
    match (tail, sync) {
        (Err(err), _) if !err.is_cancelled() => Err(err),
        (_, Err(err)) if !err.is_cancelled() => Err(err),
        _ => Ok(()),
    }
}

/// Expand source bindings against the live table list and overlay the
/// configured rules, resolving table metadata for each concrete rule.
async fn materialize_rules(
    config: &Config,
    registry: &RuleRegistry,
    resolver: &dyn SchemaResolver,
) -> Result<()> {
    // source bindings establish which tables are mirrored at all
    for source in &config.sources {
        for pattern in &source.tables {
            let pattern = build_table(pattern);

            let tables = if is_regex_pattern(&pattern) {
                let matcher = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                    RiverError::config(format!("invalid table pattern {:?}: {}", pattern, e))
                })?;
                let live = resolver.list_tables(&source.schema).await?;
                live.into_iter().filter(|t| matcher.is_match(t)).collect()
            } else {
                vec![pattern]
            };

            for table in tables {
                registry.register(Rule::new(&source.schema, &table))?;
            }
        }
    }

    if registry.is_empty() {
        return Err(RiverError::config(
            "no tables matched the configured sources",
        ));
    }

    // configured rules overlay column filters onto the matching tables
    for rule_config in &config.rules {
        let mut matched = false;

        if is_regex_pattern(&rule_config.table) {
            let matcher =
                Regex::new(&format!("^(?:{})$", build_table(&rule_config.table))).map_err(|e| {
                    RiverError::config(format!(
                        "invalid rule pattern {:?}: {}",
                        rule_config.table, e
                    ))
                })?;

            for existing in registry.rules() {
                if existing.schema == rule_config.schema && matcher.is_match(&existing.table) {
                    let mut rule = Rule::new(&existing.schema, &existing.table);
                    rule.filter = rule_config.filter.clone();
                    registry.replace(rule);
                    matched = true;
                }
            }
        } else if let Some(existing) =
            registry.resolve(&rule_config.schema, &rule_config.table)
        {
            let mut rule = Rule::new(&existing.schema, &existing.table);
            rule.filter = rule_config.filter.clone();
            registry.replace(rule);
            matched = true;
        }

        if !matched {
            return Err(RiverError::config(format!(
                "rule {}.{} matches no source table",
                rule_config.schema, rule_config.table
            )));
        }
    }

    // cache table metadata on every concrete rule
    for rule in registry.rules() {
        let info = resolver
            .table_info(&rule.schema, &rule.table)
            .await?
            .ok_or_else(|| {
                RiverError::schema_resolve(format!(
                    "table {}.{} does not exist",
                    rule.schema, rule.table
                ))
            })?;

        let mut resolved = (*rule).clone();
        resolved.table_info = info;
        registry.replace(resolved);
    }

    Ok(())
}

/// Cancel the pipeline on SIGTERM / SIGINT.
pub async fn setup_shutdown_handler(token: CancellationToken) {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, initiating graceful shutdown");
                token.cancel();
            }
            _ = sigint.recv() => {
                info!("received SIGINT, initiating graceful shutdown");
                token.cancel();
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.expect("failed to listen for ctrl-c");
        info!("received Ctrl+C, initiating graceful shutdown");
        token.cancel();
    }
}
