// ABOUTME: Sinker contract plus AsyncSinker, which applies outputs on a background task
// ABOUTME: Errors surface asynchronously; a dummy barrier forces them to become visible

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::output::DecoderOutput;
use super::table::TableKey;

/// Error recorded by a sinker while applying commands in the background.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sink error: {0}")]
pub struct SinkError(pub String);

/// Transactional output adapter fed by the table reader.
///
/// `sink` and the `send_*` calls only fail when the command cannot be handed
/// over at all; failures while applying show up later through [`Sinker::error`].
#[async_trait]
pub trait Sinker: Send {
    async fn sink(&mut self, output: DecoderOutput) -> Result<()>;

    async fn send_begin(&mut self) -> Result<()>;

    async fn send_commit(&mut self) -> Result<()>;

    async fn send_rollback(&mut self) -> Result<()>;

    /// Barrier: returns once every earlier command has been applied.
    async fn send_dummy(&mut self) -> Result<()>;

    /// Last error observed while applying commands.
    fn error(&self) -> Option<SinkError>;

    fn clear_error(&mut self);

    /// Drop partial state (open target transaction, buffered rows) and the recorded error.
    async fn reset(&mut self);

    async fn close(&mut self);
}

/// Target-side effects of the sink protocol, driven by [`AsyncSinker`].
#[async_trait]
pub trait SinkWriter: Send {
    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn apply(&mut self, output: DecoderOutput) -> Result<()>;

    async fn reset(&mut self) -> Result<()>;
}

enum SinkCommand {
    Begin,
    Commit,
    Rollback,
    Output(DecoderOutput),
    Reset,
    Barrier(oneshot::Sender<()>),
}

impl SinkCommand {
    fn name(&self) -> &'static str {
        match self {
            SinkCommand::Begin => "begin",
            SinkCommand::Commit => "commit",
            SinkCommand::Rollback => "rollback",
            SinkCommand::Output(_) => "output",
            SinkCommand::Reset => "reset",
            SinkCommand::Barrier(_) => "barrier",
        }
    }
}

type ErrorSlot = Arc<Mutex<Option<SinkError>>>;

/// Sinker that runs a [`SinkWriter`] on its own tokio task.
///
/// Commands are queued on a bounded channel and applied in order. Once a
/// writer call fails, begin/commit/output commands are skipped until the
/// error is cleared; rollback and reset always run.
pub struct AsyncSinker {
    table: TableKey,
    tx: Option<mpsc::Sender<SinkCommand>>,
    error: ErrorSlot,
    worker: Option<JoinHandle<()>>,
}

impl AsyncSinker {
    pub fn spawn<W>(table: TableKey, writer: W, capacity: usize) -> Self
    where
        W: SinkWriter + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let error: ErrorSlot = Arc::new(Mutex::new(None));
        let worker = tokio::spawn(run_writer(table.clone(), writer, rx, Arc::clone(&error)));
        Self {
            table,
            tx: Some(tx),
            error,
            worker: Some(worker),
        }
    }

    pub fn table(&self) -> &TableKey {
        &self.table
    }

    async fn send(&self, cmd: SinkCommand) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("sinker for {} is closed", self.table))?;
        let name = cmd.name();
        tx.send(cmd).await.map_err(|_| {
            anyhow!(
                "sinker for {} stopped before accepting {}",
                self.table,
                name
            )
        })
    }
}

#[async_trait]
impl Sinker for AsyncSinker {
    async fn sink(&mut self, output: DecoderOutput) -> Result<()> {
        self.send(SinkCommand::Output(output)).await
    }

    async fn send_begin(&mut self) -> Result<()> {
        self.send(SinkCommand::Begin).await
    }

    async fn send_commit(&mut self) -> Result<()> {
        self.send(SinkCommand::Commit).await
    }

    async fn send_rollback(&mut self) -> Result<()> {
        self.send(SinkCommand::Rollback).await
    }

    async fn send_dummy(&mut self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(SinkCommand::Barrier(ack_tx)).await?;
        ack_rx
            .await
            .map_err(|_| anyhow!("sinker for {} stopped before the barrier", self.table))
    }

    fn error(&self) -> Option<SinkError> {
        lock_slot(&self.error).clone()
    }

    fn clear_error(&mut self) {
        *lock_slot(&self.error) = None;
    }

    async fn reset(&mut self) {
        if let Err(e) = self.send(SinkCommand::Reset).await {
            tracing::warn!("Failed to reset sinker for {}: {}", self.table, e);
        }
        self.clear_error();
    }

    async fn close(&mut self) {
        // Dropping the sender ends the worker loop once the queue drains.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                tracing::error!("Sinker task for {} panicked: {}", self.table, e);
            }
        }
    }
}

fn lock_slot(slot: &ErrorSlot) -> std::sync::MutexGuard<'_, Option<SinkError>> {
    // A poisoned slot still holds a valid Option.
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_writer<W: SinkWriter>(
    table: TableKey,
    mut writer: W,
    mut rx: mpsc::Receiver<SinkCommand>,
    error: ErrorSlot,
) {
    while let Some(cmd) = rx.recv().await {
        let failed = lock_slot(&error).is_some();
        let name = cmd.name();
        let result = match cmd {
            SinkCommand::Barrier(ack) => {
                let _ = ack.send(());
                continue;
            }
            SinkCommand::Rollback => writer.rollback().await,
            SinkCommand::Reset => writer.reset().await,
            _ if failed => {
                tracing::debug!("Skipping {} for {}: sinker has a pending error", name, table);
                continue;
            }
            SinkCommand::Begin => writer.begin().await,
            SinkCommand::Commit => writer.commit().await,
            SinkCommand::Output(output) => writer.apply(output).await,
        };

        if let Err(e) = result {
            tracing::warn!("Sink {} failed for {}: {:#}", name, table, e);
            *lock_slot(&error) = Some(SinkError(format!("{} failed: {:#}", name, e)));
        }
    }
    tracing::debug!("Sinker task for {} finished", table);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::output::ChangeRange;
    use crate::cdc::timestamp::Timestamp;

    #[derive(Default)]
    struct Journal {
        events: Vec<String>,
    }

    struct JournalWriter {
        journal: Arc<Mutex<Journal>>,
        fail_on: Option<&'static str>,
    }

    impl JournalWriter {
        fn record(&self, event: &str) -> Result<()> {
            self.journal.lock().unwrap().events.push(event.to_string());
            if self.fail_on == Some(event) {
                return Err(anyhow!("{} rejected", event));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SinkWriter for JournalWriter {
        async fn begin(&mut self) -> Result<()> {
            self.record("begin")
        }

        async fn commit(&mut self) -> Result<()> {
            self.record("commit")
        }

        async fn rollback(&mut self) -> Result<()> {
            self.record("rollback")
        }

        async fn apply(&mut self, output: DecoderOutput) -> Result<()> {
            match output {
                DecoderOutput::Heartbeat { .. } => self.record("heartbeat"),
                _ => self.record("output"),
            }
        }

        async fn reset(&mut self) -> Result<()> {
            self.record("reset")
        }
    }

    fn heartbeat() -> DecoderOutput {
        DecoderOutput::Heartbeat {
            range: ChangeRange::new(Timestamp::ZERO, Timestamp::from_physical(1)).unwrap(),
        }
    }

    fn events(journal: &Arc<Mutex<Journal>>) -> Vec<String> {
        journal.lock().unwrap().events.clone()
    }

    #[tokio::test]
    async fn test_dummy_waits_for_earlier_commands() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let writer = JournalWriter {
            journal: Arc::clone(&journal),
            fail_on: None,
        };
        let mut sinker = AsyncSinker::spawn(TableKey::new("db", "t"), writer, 4);

        sinker.send_begin().await.unwrap();
        sinker.sink(heartbeat()).await.unwrap();
        sinker.send_commit().await.unwrap();
        sinker.send_dummy().await.unwrap();

        assert_eq!(events(&journal), vec!["begin", "heartbeat", "commit"]);
        assert!(sinker.error().is_none());
        sinker.close().await;
    }

    #[tokio::test]
    async fn test_error_skips_until_cleared() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let writer = JournalWriter {
            journal: Arc::clone(&journal),
            fail_on: Some("heartbeat"),
        };
        let mut sinker = AsyncSinker::spawn(TableKey::new("db", "t"), writer, 4);

        sinker.send_begin().await.unwrap();
        sinker.sink(heartbeat()).await.unwrap();
        sinker.send_commit().await.unwrap();
        sinker.send_dummy().await.unwrap();
        let err = sinker.error().expect("error recorded");
        assert!(err.0.contains("heartbeat rejected"));

        sinker.clear_error();
        sinker.send_rollback().await.unwrap();
        sinker.send_dummy().await.unwrap();

        assert_eq!(events(&journal), vec!["begin", "heartbeat", "rollback"]);
        assert!(sinker.error().is_none());
        sinker.close().await;
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let writer = JournalWriter {
            journal,
            fail_on: None,
        };
        let mut sinker = AsyncSinker::spawn(TableKey::new("db", "t"), writer, 1);
        sinker.close().await;
        assert!(sinker.send_begin().await.is_err());
        assert!(sinker.send_dummy().await.is_err());
        // closing twice is harmless
        sinker.close().await;
    }

    #[tokio::test]
    async fn test_reset_clears_error_and_resets_writer() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let writer = JournalWriter {
            journal: Arc::clone(&journal),
            fail_on: Some("begin"),
        };
        let mut sinker = AsyncSinker::spawn(TableKey::new("db", "t"), writer, 4);
        sinker.send_begin().await.unwrap();
        sinker.send_dummy().await.unwrap();
        assert!(sinker.error().is_some());

        sinker.reset().await;
        sinker.send_dummy().await.unwrap();
        assert!(sinker.error().is_none());
        assert_eq!(events(&journal), vec!["begin", "reset"]);
        sinker.close().await;
    }
}
