// ABOUTME: Units handed from the table reader to a sinker
// ABOUTME: Snapshot pages, merged tail batches and the end-of-range heartbeat

use anyhow::{bail, Result};
use std::fmt;

use super::atomic_batch::AtomicBatch;
use super::batch::Batch;
use super::timestamp::Timestamp;

/// Half-open timestamp range `[from, to)` covered by one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeRange {
    pub from: Timestamp,
    pub to: Timestamp,
}

impl ChangeRange {
    pub fn new(from: Timestamp, to: Timestamp) -> Result<Self> {
        if from > to {
            bail!("invalid change range: from {} is after to {}", from, to);
        }
        Ok(Self { from, to })
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }
}

impl fmt::Display for ChangeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Snapshot,
    Tail,
    Heartbeat,
}

/// What the reader hands to a sinker.
#[derive(Debug)]
pub enum DecoderOutput {
    /// A self-contained page of rows, applied as inserts.
    Snapshot { batch: Batch, range: ChangeRange },
    /// Fully merged incremental changes of one tail run.
    Tail {
        inserts: AtomicBatch,
        deletes: AtomicBatch,
        range: ChangeRange,
    },
    /// No more data in `range`; lets the sinker flush what it buffered.
    Heartbeat { range: ChangeRange },
}

impl DecoderOutput {
    pub fn kind(&self) -> OutputKind {
        match self {
            DecoderOutput::Snapshot { .. } => OutputKind::Snapshot,
            DecoderOutput::Tail { .. } => OutputKind::Tail,
            DecoderOutput::Heartbeat { .. } => OutputKind::Heartbeat,
        }
    }

    pub fn range(&self) -> ChangeRange {
        match self {
            DecoderOutput::Snapshot { range, .. }
            | DecoderOutput::Tail { range, .. }
            | DecoderOutput::Heartbeat { range } => *range,
        }
    }

    pub fn no_more_data(&self) -> bool {
        matches!(self, DecoderOutput::Heartbeat { .. })
    }

    /// Number of rows carried (inserts plus deletes for tail output).
    pub fn row_count(&self) -> usize {
        match self {
            DecoderOutput::Snapshot { batch, .. } => batch.len(),
            DecoderOutput::Tail {
                inserts, deletes, ..
            } => inserts.len() + deletes.len(),
            DecoderOutput::Heartbeat { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_range_rejects_inverted_bounds() {
        let a = Timestamp::from_physical(5);
        let b = Timestamp::from_physical(9);
        assert!(ChangeRange::new(a, b).is_ok());
        assert!(ChangeRange::new(a, a).unwrap().is_empty());
        assert!(ChangeRange::new(b, a).is_err());
        assert_eq!(ChangeRange::new(a, b).unwrap().to_string(), "[5-0, 9-0)");
    }

    #[test]
    fn test_heartbeat_output() {
        let range = ChangeRange::new(Timestamp::ZERO, Timestamp::from_physical(3)).unwrap();
        let out = DecoderOutput::Heartbeat { range };
        assert!(out.no_more_data());
        assert_eq!(out.kind(), OutputKind::Heartbeat);
        assert_eq!(out.row_count(), 0);
        assert_eq!(out.range(), range);
    }
}
