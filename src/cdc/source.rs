// ABOUTME: Contracts of the engine-side collaborators: read transactions and change handles
// ABOUTME: Fragments are tagged with a Hint; a StaleRead error marks history that is gone

use anyhow::Result;
use async_trait::async_trait;

use super::batch::Batch;
use super::output::ChangeRange;
use super::table::TableDef;
use super::timestamp::Timestamp;

/// Role of a change fragment inside a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hint {
    /// Consistent full state at the range end; can be sunk directly.
    Snapshot,
    /// Incremental changes that must be merged with the following fragments.
    TailPartial,
    /// Last fragment of a tail run; the merged run is ready to be sunk.
    TailFinal,
}

/// One page of insert rows and one page of delete rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFragment {
    pub inserts: Option<Batch>,
    pub deletes: Option<Batch>,
    pub hint: Hint,
}

impl ChangeFragment {
    pub fn snapshot(inserts: Batch) -> Self {
        Self {
            inserts: Some(inserts),
            deletes: None,
            hint: Hint::Snapshot,
        }
    }

    pub fn tail(inserts: Option<Batch>, deletes: Option<Batch>, last: bool) -> Self {
        Self {
            inserts,
            deletes,
            hint: if last { Hint::TailFinal } else { Hint::TailPartial },
        }
    }

    pub fn row_count(&self) -> usize {
        self.inserts.as_ref().map_or(0, |b| b.len()) + self.deletes.as_ref().map_or(0, |b| b.len())
    }
}

/// Read transaction that pins the snapshot a round reads at.
#[async_trait]
pub trait SnapshotTxn: Send + Sync {
    fn snapshot_ts(&self) -> Timestamp;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Opens read transactions against the source engine.
#[async_trait]
pub trait TxnEngine: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn SnapshotTxn>>;
}

/// Produces the committed changes of one table over a timestamp range.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn open(
        &self,
        txn: &dyn SnapshotTxn,
        table: &TableDef,
        range: ChangeRange,
    ) -> Result<Box<dyn ChangeHandle>>;
}

/// Cursor over the fragments of one range.
#[async_trait]
pub trait ChangeHandle: Send {
    /// Next fragment in delivery order; `None` once the range is exhausted.
    async fn next(&mut self) -> Result<Option<ChangeFragment>>;

    async fn close(&mut self);
}

/// The engine can no longer serve changes starting at the requested timestamp.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stale read on {table}: changes from {from} are no longer available (oldest {oldest})")]
pub struct StaleRead {
    pub table: String,
    pub from: Timestamp,
    pub oldest: Timestamp,
}

/// Whether any error in the chain is a [`StaleRead`].
pub fn is_stale_read(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<StaleRead>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_is_stale_read_walks_context_chain() {
        let stale = StaleRead {
            table: "shop.orders".to_string(),
            from: Timestamp::from_physical(5),
            oldest: Timestamp::from_physical(9),
        };
        let err: Result<()> = Err(anyhow::Error::new(stale));
        let err = err.context("Failed to read changes").unwrap_err();
        assert!(is_stale_read(&err));
        assert!(!is_stale_read(&anyhow::anyhow!("connection reset")));
    }

    #[test]
    fn test_fragment_constructors() {
        let batch = Batch::new(vec!["id".to_string()]);
        assert_eq!(ChangeFragment::snapshot(batch.clone()).hint, Hint::Snapshot);
        assert_eq!(
            ChangeFragment::tail(Some(batch.clone()), None, false).hint,
            Hint::TailPartial
        );
        assert_eq!(ChangeFragment::tail(None, Some(batch), true).hint, Hint::TailFinal);
    }
}
