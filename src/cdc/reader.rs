// ABOUTME: TableReader - the per-table CDC control loop
// ABOUTME: Ticks, reads [watermark, snapshot) changes, feeds the sinker, advances the watermark

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

use super::atomic_batch::AtomicBatch;
use super::output::{ChangeRange, DecoderOutput};
use super::registry::ReaderRegistry;
use super::routine::{ActiveRoutine, StopSignal};
use super::sinker::Sinker;
use super::source::{
    is_stale_read, ChangeFragment, ChangeHandle, ChangeSource, Hint, SnapshotTxn, TxnEngine,
};
use super::table::{ColumnLayout, TableDef, TableKey};
use super::timestamp::Timestamp;
use super::watermark::WatermarkStore;

/// Where a stale-read recovery rewinds the watermark to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Replicate the full history: rewind to the configured start.
    #[default]
    Full,
    /// Only changes from now on: rewind to the current snapshot.
    Incremental,
}

/// Whether snapshot outputs are wrapped in a sink transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotTxnPolicy {
    /// Snapshot pages are sent without begin/commit.
    #[default]
    Split,
    /// A begin is sent before the first snapshot page of a round.
    Wrapped,
}

/// Configuration of one table reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Interval between rounds
    pub tick: Duration,
    pub mode: ReplicationMode,
    pub snapshot_txn: SnapshotTxnPolicy,
    /// Explicit replay start. When set, a stale read is fatal.
    pub start_ts: Option<Timestamp>,
    /// Replication stops once the watermark reaches this timestamp.
    pub end_ts: Option<Timestamp>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            mode: ReplicationMode::Full,
            snapshot_txn: SnapshotTxnPolicy::Split,
            start_ts: None,
            end_ts: None,
        }
    }
}

impl ReaderConfig {
    /// First timestamp to replay from when no watermark exists.
    pub fn origin(&self) -> Timestamp {
        self.start_ts.unwrap_or(Timestamp::ZERO)
    }
}

/// Why [`TableReader::run`] returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// Another reader already replicates the table.
    AlreadyRunning,
    Paused,
    Cancelled,
    /// The watermark reached the configured end timestamp.
    WindowExhausted,
}

impl From<StopSignal> for ReaderExit {
    fn from(signal: StopSignal) -> Self {
        match signal {
            StopSignal::Pause => ReaderExit::Paused,
            StopSignal::Cancel => ReaderExit::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundStatus {
    Completed,
    Stopped(StopSignal),
    WindowExhausted,
}

/// Sink-side state at the end of a round; the cleanup step decides from it alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    /// A begin was sent during the round.
    pub sink_txn_open: bool,
    /// The round was confirmed by the sink and the watermark advanced.
    pub committed: bool,
}

impl RoundOutcome {
    pub fn needs_rollback(&self) -> bool {
        self.sink_txn_open && !self.committed
    }
}

#[derive(Debug, Default)]
struct RoundStats {
    fragments: usize,
    rows: usize,
    outputs: usize,
}

/// The round's insert/delete accumulators, allocated on the first tail fragment.
struct TailAccumulator {
    inserts: Option<AtomicBatch>,
    deletes: Option<AtomicBatch>,
    insert_layout: ColumnLayout,
    delete_layout: ColumnLayout,
}

impl TailAccumulator {
    fn new(insert_layout: ColumnLayout, delete_layout: ColumnLayout) -> Self {
        Self {
            inserts: None,
            deletes: None,
            insert_layout,
            delete_layout,
        }
    }

    fn append(&mut self, fragment: ChangeFragment) -> Result<()> {
        self.inserts
            .get_or_insert_with(AtomicBatch::new)
            .append_opt(
                fragment.inserts,
                self.insert_layout.ts_index,
                self.insert_layout.pk_index,
            )
            .context("Failed to accumulate inserted rows")?;
        self.deletes
            .get_or_insert_with(AtomicBatch::new)
            .append_opt(
                fragment.deletes,
                self.delete_layout.ts_index,
                self.delete_layout.pk_index,
            )
            .context("Failed to accumulate deleted rows")?;
        Ok(())
    }

    /// Hand the accumulated pair over and start the next run clean.
    fn take(&mut self) -> (AtomicBatch, AtomicBatch) {
        (
            self.inserts.take().unwrap_or_default(),
            self.deletes.take().unwrap_or_default(),
        )
    }

    fn is_empty(&self) -> bool {
        [self.inserts.as_ref(), self.deletes.as_ref()]
            .into_iter()
            .flatten()
            .all(AtomicBatch::is_empty)
    }

    fn close(&mut self) {
        for batch in [self.inserts.as_mut(), self.deletes.as_mut()].into_iter().flatten() {
            batch.close();
        }
        self.inserts = None;
        self.deletes = None;
    }
}

/// Replicates one source table until paused, cancelled or failed.
///
/// Each round:
/// 1. Opens a read transaction; its snapshot bounds the round
/// 2. Reads the changes in `[watermark, snapshot)` fragment by fragment
/// 3. Sinks snapshot pages directly and merges tail pages into one output
/// 4. Confirms the sink transaction and only then advances the watermark
pub struct TableReader {
    table: TableDef,
    config: ReaderConfig,
    engine: Arc<dyn TxnEngine>,
    source: Arc<dyn ChangeSource>,
    sinker: Box<dyn Sinker>,
    watermarks: Arc<dyn WatermarkStore>,
    registry: ReaderRegistry,
}

impl TableReader {
    pub fn new(
        table: TableDef,
        config: ReaderConfig,
        engine: Arc<dyn TxnEngine>,
        source: Arc<dyn ChangeSource>,
        sinker: Box<dyn Sinker>,
        watermarks: Arc<dyn WatermarkStore>,
        registry: ReaderRegistry,
    ) -> Self {
        Self {
            table,
            config,
            engine,
            source,
            sinker,
            watermarks,
            registry,
        }
    }

    pub fn table(&self) -> &TableKey {
        &self.table.key
    }

    /// Run the reader loop.
    ///
    /// Returns immediately with [`ReaderExit::AlreadyRunning`] if another reader
    /// owns the table. On error, the error message is saved to the watermark
    /// store before returning. The sinker is closed on every path.
    pub async fn run(mut self, routine: ActiveRoutine) -> Result<ReaderExit> {
        let key = self.table.key.clone();
        let Some(registration) = self.registry.register(&key) else {
            tracing::warn!("Reader for {} is already running, not starting another", key);
            self.sinker.close().await;
            return Ok(ReaderExit::AlreadyRunning);
        };

        tracing::info!(
            "Starting table reader for {} with tick={:?}, mode={:?}, start={:?}, end={:?}",
            key,
            self.config.tick,
            self.config.mode,
            self.config.start_ts,
            self.config.end_ts
        );

        let result = self.run_loop(&routine).await;
        match &result {
            Ok(exit) => tracing::info!("Table reader for {} exited: {:?}", key, exit),
            Err(e) => {
                tracing::error!("Table reader for {} failed: {:#}", key, e);
                if let Err(save_err) = self.watermarks.save_error_message(&key, &format!("{:#}", e)) {
                    tracing::error!("Failed to save error message for {}: {:#}", key, save_err);
                }
            }
        }

        self.sinker.close().await;
        drop(registration);
        result
    }

    async fn run_loop(&mut self, routine: &ActiveRoutine) -> Result<ReaderExit> {
        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                signal = routine.stopped() => return Ok(signal.into()),
                _ = ticker.tick() => {}
            }

            match self.read_table(routine).await? {
                RoundStatus::Completed => {}
                RoundStatus::Stopped(signal) => return Ok(signal.into()),
                RoundStatus::WindowExhausted => return Ok(ReaderExit::WindowExhausted),
            }
        }
    }

    /// One round: transaction, range, fetch, cleanup and stale-read recovery.
    async fn read_table(&mut self, routine: &ActiveRoutine) -> Result<RoundStatus> {
        let txn = self
            .engine
            .begin()
            .await
            .with_context(|| format!("Failed to open read transaction for {}", self.table.key))?;
        let snapshot_ts = txn.snapshot_ts();

        let mut outcome = RoundOutcome::default();
        let result = self
            .read_table_with_txn(txn.as_ref(), routine, &mut outcome)
            .await;

        if outcome.needs_rollback() {
            self.rollback_sink().await;
        }

        let finished = if matches!(
            result,
            Ok(RoundStatus::Completed) | Ok(RoundStatus::WindowExhausted)
        ) {
            txn.commit().await
        } else {
            txn.rollback().await
        };
        if let Err(e) = finished {
            tracing::warn!(
                "Failed to finish read transaction for {}: {:#}",
                self.table.key,
                e
            );
        }

        match result {
            Err(e) if is_stale_read(&e) => self.recover_stale_read(e, snapshot_ts).await,
            other => other,
        }
    }

    async fn read_table_with_txn(
        &mut self,
        txn: &dyn SnapshotTxn,
        routine: &ActiveRoutine,
        outcome: &mut RoundOutcome,
    ) -> Result<RoundStatus> {
        let from_ts = self
            .watermarks
            .get_from_memory(&self.table.key)
            .unwrap_or_else(|| self.config.origin());

        let mut to_ts = txn.snapshot_ts();
        if let Some(end_ts) = self.config.end_ts {
            if from_ts >= end_ts {
                tracing::info!(
                    "Watermark {} of {} reached end timestamp {}",
                    from_ts,
                    self.table.key,
                    end_ts
                );
                return Ok(RoundStatus::WindowExhausted);
            }
            to_ts = to_ts.min(end_ts);
        }

        if from_ts > to_ts {
            tracing::warn!(
                "Watermark {} of {} is ahead of snapshot {}, skipping round",
                from_ts,
                self.table.key,
                to_ts
            );
            return Ok(RoundStatus::Completed);
        }
        let range = ChangeRange::new(from_ts, to_ts)?;

        let mut handle = self
            .source
            .open(txn, &self.table, range)
            .await
            .with_context(|| format!("Failed to read changes of {} in {}", self.table.key, range))?;

        let mut tail = TailAccumulator::new(self.table.insert_layout(), self.table.delete_layout());
        let result = self
            .consume_changes(handle.as_mut(), routine, range, &mut tail, outcome)
            .await;
        tail.close();
        handle.close().await;
        result
    }

    async fn consume_changes(
        &mut self,
        handle: &mut dyn ChangeHandle,
        routine: &ActiveRoutine,
        range: ChangeRange,
        tail: &mut TailAccumulator,
        outcome: &mut RoundOutcome,
    ) -> Result<RoundStatus> {
        let started = Instant::now();
        let mut stats = RoundStats::default();

        loop {
            if let Some(signal) = routine.stop_signal() {
                return Ok(RoundStatus::Stopped(signal));
            }
            let next = tokio::select! {
                biased;
                signal = routine.stopped() => return Ok(RoundStatus::Stopped(signal)),
                next = handle.next() => next,
            };
            let fragment = next.with_context(|| {
                format!("Failed to read changes of {} in {}", self.table.key, range)
            })?;

            let Some(fragment) = fragment else {
                // A tail run cut off by the end of the range still belongs to this round.
                if !tail.is_empty() {
                    tracing::debug!(
                        "Flushing unterminated tail run of {} in {}",
                        self.table.key,
                        range
                    );
                    self.sink_tail(tail, range, outcome).await?;
                    stats.outputs += 1;
                }
                self.finish_range(range, outcome).await?;
                if stats.rows > 0 {
                    tracing::info!(
                        "Replicated {} in {}: {} rows in {} fragments, {} outputs, {}ms",
                        self.table.key,
                        range,
                        stats.rows,
                        stats.fragments,
                        stats.outputs,
                        started.elapsed().as_millis()
                    );
                } else {
                    tracing::debug!("No changes in {} for {}", self.table.key, range);
                }
                return Ok(RoundStatus::Completed);
            };

            stats.fragments += 1;
            stats.rows += fragment.row_count();

            match fragment.hint {
                Hint::Snapshot => {
                    if !outcome.sink_txn_open
                        && self.config.snapshot_txn == SnapshotTxnPolicy::Wrapped
                    {
                        self.sinker.send_begin().await?;
                        outcome.sink_txn_open = true;
                    }
                    if let Some(batch) = fragment.inserts {
                        self.sinker
                            .sink(DecoderOutput::Snapshot { batch, range })
                            .await?;
                        stats.outputs += 1;
                    }
                }
                Hint::TailPartial => tail.append(fragment)?,
                Hint::TailFinal => {
                    tail.append(fragment)?;
                    self.sink_tail(tail, range, outcome).await?;
                    stats.outputs += 1;
                }
            }
        }
    }

    async fn sink_tail(
        &mut self,
        tail: &mut TailAccumulator,
        range: ChangeRange,
        outcome: &mut RoundOutcome,
    ) -> Result<()> {
        if !outcome.sink_txn_open {
            self.sinker.send_begin().await?;
            outcome.sink_txn_open = true;
        }
        let (inserts, deletes) = tail.take();
        self.sinker
            .sink(DecoderOutput::Tail {
                inserts,
                deletes,
                range,
            })
            .await
    }

    /// End of range: heartbeat, barrier, commit, barrier, then advance the watermark.
    async fn finish_range(&mut self, range: ChangeRange, outcome: &mut RoundOutcome) -> Result<()> {
        self.sinker.sink(DecoderOutput::Heartbeat { range }).await?;
        self.sinker.send_dummy().await?;
        self.check_sink_error()?;

        if outcome.sink_txn_open {
            self.sinker.send_commit().await?;
            self.sinker.send_dummy().await?;
            self.check_sink_error()
                .context("Sink transaction was not committed")?;
        }

        self.watermarks.update_memory(&self.table.key, range.to);
        outcome.committed = true;
        Ok(())
    }

    fn check_sink_error(&self) -> Result<()> {
        match self.sinker.error() {
            Some(e) => Err(anyhow::Error::new(e))
                .with_context(|| format!("Failed to sink changes of {}", self.table.key)),
            None => Ok(()),
        }
    }

    /// Best-effort rollback of the sink transaction; failures are only logged.
    async fn rollback_sink(&mut self) {
        self.sinker.clear_error();
        if let Err(e) = self.sinker.send_rollback().await {
            tracing::warn!("Failed to send rollback for {}: {:#}", self.table.key, e);
            return;
        }
        if let Err(e) = self.sinker.send_dummy().await {
            tracing::warn!("Failed to confirm rollback for {}: {:#}", self.table.key, e);
            return;
        }
        if let Some(e) = self.sinker.error() {
            tracing::warn!("Rollback failed for {}: {}", self.table.key, e);
        }
    }

    async fn recover_stale_read(
        &mut self,
        err: anyhow::Error,
        snapshot_ts: Timestamp,
    ) -> Result<RoundStatus> {
        if let Some(start_ts) = self.config.start_ts {
            return Err(err.context(format!(
                "Cannot skip history of {}: replay was requested from {}",
                self.table.key, start_ts
            )));
        }

        self.sinker.reset().await;
        let rewind_to = match self.config.mode {
            ReplicationMode::Incremental => snapshot_ts,
            ReplicationMode::Full => self.config.origin(),
        };
        tracing::warn!(
            "Stale read on {} ({:#}), rewinding watermark to {}",
            self.table.key,
            err,
            rewind_to
        );
        self.watermarks.update_memory(&self.table.key, rewind_to);
        Ok(RoundStatus::Completed)
    }
}
