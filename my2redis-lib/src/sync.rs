//! Event dispatch and the position sync loop
//!
//! Two halves of the pipeline meet here. The [`EventHandler`] runs on the
//! source-consumer task: it applies row events to the sink synchronously,
//! so a row is in Redis before the source is unblocked to deliver the
//! following commit marker, and enqueues position saves onto a bounded
//! queue. The [`sync_loop`] is the queue's single consumer and the sole
//! owner of the position store; it throttles routine saves and persists
//! forced ones (rotate, DDL) immediately.

use crate::error::{Result, RiverError};
use crate::events::{RowsAction, RowsEvent, SourceEvent};
use crate::position::{Position, PositionStore};
use crate::rule::RuleRegistry;
use crate::sink::SinkWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the work queue between handler and sync loop; enqueueing
/// blocks when full, which is the back-pressure signal into the source.
pub const SYNC_CHANNEL_CAPACITY: usize = 4096;

/// Minimum spacing of unforced position saves
pub const POS_SAVE_INTERVAL: Duration = Duration::from_secs(3);

/// Work queued for the sync loop
#[derive(Debug, Clone)]
pub enum SyncMsg {
    SavePosition { pos: Position, force: bool },
}

/// Receives source events, applies rows, enqueues position work
pub struct EventHandler {
    rules: Arc<RuleRegistry>,
    writer: SinkWriter,
    sync_tx: mpsc::Sender<SyncMsg>,
    token: CancellationToken,
}

impl EventHandler {
    pub fn new(
        rules: Arc<RuleRegistry>,
        writer: SinkWriter,
        sync_tx: mpsc::Sender<SyncMsg>,
        token: CancellationToken,
    ) -> Self {
        Self {
            rules,
            writer,
            sync_tx,
            token,
        }
    }

    /// Dispatch one source event.
    pub async fn handle(&mut self, event: SourceEvent) -> Result<()> {
        match event {
            SourceEvent::Rotate { next } => self.on_rotate(next).await,
            SourceEvent::Ddl { next, query } => self.on_ddl(next, &query).await,
            SourceEvent::TableChanged { schema, table } => {
                self.on_table_changed(&schema, &table).await
            }
            SourceEvent::Xid { next } => self.on_xid(next).await,
            SourceEvent::Rows(rows) => self.on_rows(rows).await,
            SourceEvent::Gtid { .. } | SourceEvent::PosSynced { .. } => Ok(()),
        }
    }

    async fn on_rotate(&self, next: Position) -> Result<()> {
        debug!("rotate scheduled, next position {}", next);
        self.enqueue(next, true).await
    }

    async fn on_ddl(&self, next: Position, query: &str) -> Result<()> {
        debug!("ddl scheduled at {}: {}", next, query);
        self.enqueue(next, true).await
    }

    async fn on_xid(&self, next: Position) -> Result<()> {
        debug!("xid scheduled, next position {}", next);
        self.enqueue(next, false).await
    }

    async fn on_table_changed(&self, schema: &str, table: &str) -> Result<()> {
        info!("table changed: {}.{}", schema, table);
        match self.rules.refresh(schema, table).await {
            Ok(()) => Ok(()),
            // tables outside the rule set change too; not our concern
            Err(err) if err.is_rule_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn on_rows(&mut self, event: RowsEvent) -> Result<()> {
        let Some(rule) = self.rules.resolve(&event.schema, &event.table) else {
            warn!(
                "rule not found, ignore rows event for {}.{}",
                event.schema, event.table
            );
            return Ok(());
        };

        let result = match event.action {
            RowsAction::Insert => self.writer.insert_rows(&rule, &event.rows).await,
            RowsAction::Update => self.writer.update_rows(&rule, &event.rows).await,
            RowsAction::Delete => self.writer.delete_rows(&rule, &event.rows).await,
        };

        if let Err(err) = result {
            error!(
                "{} on {}.{} failed: {}, closing sync",
                event.action, event.schema, event.table, err
            );
            self.token.cancel();
            return Err(err);
        }

        if self.token.is_cancelled() {
            return Err(RiverError::Cancelled);
        }
        Ok(())
    }

    /// Enqueue a position save; blocks when the queue is full and bails out
    /// on cancellation.
    async fn enqueue(&self, pos: Position, force: bool) -> Result<()> {
        tokio::select! {
            _ = self.token.cancelled() => Err(RiverError::Cancelled),
            sent = self.sync_tx.send(SyncMsg::SavePosition { pos, force }) => {
                sent.map_err(|_| RiverError::Cancelled)
            }
        }
    }

    /// Tear down the sink connection after the pipeline stops.
    pub async fn close(mut self) -> Result<()> {
        self.writer.close().await
    }
}

/// Drain the work queue, persisting positions with throttle/force semantics.
///
/// Exits when the queue closes or the token fires; a failed save cancels
/// the whole pipeline and returns the error.
pub async fn sync_loop(
    mut rx: mpsc::Receiver<SyncMsg>,
    store: PositionStore,
    token: CancellationToken,
) -> Result<()> {
    let mut last_saved = Instant::now();

    loop {
        let msg = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => return Ok(()),
            },
            _ = token.cancelled() => return Ok(()),
        };

        let SyncMsg::SavePosition { pos, force } = msg;

        if force || last_saved.elapsed() > POS_SAVE_INTERVAL {
            last_saved = Instant::now();
            if let Err(err) = store.save(&pos).await {
                error!("save sync position {} err {}, close sync", pos, err);
                token.cancel();
                return Err(err);
            }
            debug!("saved position {}", pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> PositionStore {
        PositionStore::open(dir.path()).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_save_is_immediate() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);

        let handle = tokio::spawn(sync_loop(rx, store, token.clone()));

        tx.send(SyncMsg::SavePosition {
            pos: Position::new("mysql-bin.000001", 100),
            force: true,
        })
        .await
        .unwrap();

        drop(tx);
        handle.await.unwrap().unwrap();

        let store = open_store(&dir).await;
        assert_eq!(
            store.load().await.unwrap(),
            Position::new("mysql-bin.000001", 100)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unforced_saves_are_throttled() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);

        let handle = tokio::spawn(sync_loop(rx, store, token.clone()));

        // within the throttle window right after startup: skipped
        tx.send(SyncMsg::SavePosition {
            pos: Position::new("mysql-bin.000001", 100),
            force: false,
        })
        .await
        .unwrap();
        tokio::task::yield_now().await;

        // past the window: persisted
        tokio::time::advance(Duration::from_secs(4)).await;
        tx.send(SyncMsg::SavePosition {
            pos: Position::new("mysql-bin.000001", 200),
            force: false,
        })
        .await
        .unwrap();

        drop(tx);
        handle.await.unwrap().unwrap();

        let store = open_store(&dir).await;
        assert_eq!(
            store.load().await.unwrap(),
            Position::new("mysql-bin.000001", 200)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_loop() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let token = CancellationToken::new();
        let (_tx, rx) = mpsc::channel::<SyncMsg>(8);

        let handle = tokio::spawn(sync_loop(rx, store, token.clone()));
        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
