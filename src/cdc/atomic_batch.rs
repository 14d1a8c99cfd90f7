// ABOUTME: AtomicBatch accumulates tail fragments of one round into a key-ordered row set
// ABOUTME: Rows are keyed by (commit-ts, primary-key bytes) and deduplicated on insert

use anyhow::{anyhow, Result};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use super::batch::{Batch, Value};
use super::key::encode_key;
use super::timestamp::Timestamp;

/// Composite ordering key of an accumulated row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub ts: Timestamp,
    pub pk: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RowLocation {
    batch: usize,
    offset: usize,
}

/// Merge buffer for the incremental ("tail") changes of one round.
///
/// Appended batches are kept as-is; an ordered index maps each distinct
/// `(ts, pk)` key to the row that first carried it. Iteration follows key
/// order regardless of the order fragments arrived in.
#[derive(Debug, Default)]
pub struct AtomicBatch {
    batches: Vec<Batch>,
    rows: BTreeMap<RowKey, RowLocation>,
}

impl AtomicBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every row of `batch`, keyed by its `ts_index` and `pk_index` columns.
    ///
    /// The batch is validated before anything is stored, so a malformed row
    /// leaves the accumulator untouched. A key that is already present is not
    /// added again. Returns the number of newly added rows.
    pub fn append(&mut self, batch: Batch, ts_index: usize, pk_index: usize) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let keys = batch
            .rows()
            .iter()
            .enumerate()
            .map(|(offset, row)| {
                row_key(row, ts_index, pk_index).map_err(|e| e.context(format!("row {}", offset)))
            })
            .collect::<Result<Vec<_>>>()?;

        let batch_idx = self.batches.len();
        let mut added = 0;
        for (offset, key) in keys.into_iter().enumerate() {
            if let Entry::Vacant(slot) = self.rows.entry(key) {
                slot.insert(RowLocation {
                    batch: batch_idx,
                    offset,
                });
                added += 1;
            }
        }

        if added > 0 {
            self.batches.push(batch);
        }
        Ok(added)
    }

    /// Append an optional fragment page; `None` is a no-op.
    pub fn append_opt(
        &mut self,
        batch: Option<Batch>,
        ts_index: usize,
        pk_index: usize,
    ) -> Result<usize> {
        match batch {
            Some(batch) => self.append(batch, ts_index, pk_index),
            None => Ok(0),
        }
    }

    /// Rows in `(ts, pk)` order.
    pub fn iter(&self) -> impl Iterator<Item = (&RowKey, &[Value])> + '_ {
        self.rows.iter().map(move |(key, loc)| {
            // Locations only ever point at rows that were stored with them.
            let row = self.batches[loc.batch].rows()[loc.offset].as_slice();
            (key, row)
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &RowKey> + '_ {
        self.rows.keys()
    }

    /// Column list of the accumulated rows, if any row was added.
    pub fn columns(&self) -> Option<&[String]> {
        self.batches.first().map(|b| b.columns())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Release the accumulated rows. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.rows.clear();
        self.batches.clear();
        self.batches.shrink_to_fit();
    }
}

fn row_key(row: &[Value], ts_index: usize, pk_index: usize) -> Result<RowKey> {
    let ts = row
        .get(ts_index)
        .ok_or_else(|| anyhow!("commit-ts column {} out of range", ts_index))?;
    let ts = ts.as_timestamp().ok_or_else(|| {
        anyhow!(
            "commit-ts column {} holds a {} value",
            ts_index,
            ts.type_name()
        )
    })?;
    let pk = row
        .get(pk_index)
        .ok_or_else(|| anyhow!("primary-key column {} out of range", pk_index))?;
    if pk.is_null() {
        return Err(anyhow!("primary-key column {} is null", pk_index));
    }
    Ok(RowKey {
        ts,
        pk: encode_key(std::slice::from_ref(pk)),
    })
}

/// One step of the causal apply order of a tail flush.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TailChange<'a> {
    Delete(&'a RowKey, &'a [Value]),
    Insert(&'a RowKey, &'a [Value]),
}

impl<'a> TailChange<'a> {
    pub fn key(&self) -> &'a RowKey {
        match self {
            TailChange::Delete(key, _) | TailChange::Insert(key, _) => key,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, TailChange::Delete(..))
    }
}

/// Interleave the insert and delete sets by commit timestamp.
///
/// At equal timestamps deletes come first, so an update (delete + insert in
/// one commit) lands as the new row.
pub fn merge_tail<'a>(inserts: &'a AtomicBatch, deletes: &'a AtomicBatch) -> Vec<TailChange<'a>> {
    let mut out = Vec::with_capacity(inserts.len() + deletes.len());
    let mut ins = inserts.iter().peekable();
    let mut del = deletes.iter().peekable();

    loop {
        let take_delete = match (ins.peek(), del.peek()) {
            (None, None) => break,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (Some((ik, _)), Some((dk, _))) => dk.ts <= ik.ts,
        };
        if take_delete {
            if let Some((key, row)) = del.next() {
                out.push(TailChange::Delete(key, row));
            }
        } else if let Some((key, row)) = ins.next() {
            out.push(TailChange::Insert(key, row));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(p: i64) -> Value {
        Value::Timestamp(Timestamp::from_physical(p))
    }

    fn insert_batch(rows: &[(i64, &str, i64)]) -> Batch {
        Batch::from_rows(
            vec!["id".into(), "name".into(), "__commit_ts".into()],
            rows.iter()
                .map(|(id, name, t)| vec![Value::Int(*id), Value::from(*name), ts(*t)])
                .collect(),
        )
        .unwrap()
    }

    fn delete_batch(rows: &[(i64, i64)]) -> Batch {
        Batch::from_rows(
            vec!["id".into(), "__commit_ts".into()],
            rows.iter()
                .map(|(id, t)| vec![Value::Int(*id), ts(*t)])
                .collect(),
        )
        .unwrap()
    }

    fn physical_ts(batch: &AtomicBatch) -> Vec<i64> {
        batch.keys().map(|k| k.ts.physical()).collect()
    }

    #[test]
    fn test_rows_are_ordered_across_fragments() {
        let mut acc = AtomicBatch::new();
        acc.append(insert_batch(&[(1, "a", 12), (2, "b", 10)]), 2, 0)
            .unwrap();
        acc.append(insert_batch(&[(3, "c", 11)]), 2, 0).unwrap();

        assert_eq!(physical_ts(&acc), vec![10, 11, 12]);
        let names: Vec<&Value> = acc.iter().map(|(_, row)| &row[1]).collect();
        assert_eq!(
            names,
            vec![&Value::from("b"), &Value::from("c"), &Value::from("a")]
        );
    }

    #[test]
    fn test_duplicate_keys_are_not_added_twice() {
        let mut acc = AtomicBatch::new();
        assert_eq!(
            acc.append(insert_batch(&[(1, "first", 10)]), 2, 0).unwrap(),
            1
        );
        assert_eq!(
            acc.append(insert_batch(&[(1, "second", 10), (1, "x", 11)]), 2, 0)
                .unwrap(),
            1
        );
        assert_eq!(acc.len(), 2);
        let (_, row) = acc.iter().next().unwrap();
        assert_eq!(row[1], Value::from("first"));
    }

    #[test]
    fn test_same_ts_orders_by_primary_key() {
        let mut acc = AtomicBatch::new();
        acc.append(insert_batch(&[(9, "z", 10), (-4, "y", 10), (2, "x", 10)]), 2, 0)
            .unwrap();
        let ids: Vec<&Value> = acc.iter().map(|(_, row)| &row[0]).collect();
        assert_eq!(ids, vec![&Value::Int(-4), &Value::Int(2), &Value::Int(9)]);
    }

    #[test]
    fn test_malformed_batch_leaves_accumulator_untouched() {
        let mut acc = AtomicBatch::new();
        acc.append(insert_batch(&[(1, "a", 10)]), 2, 0).unwrap();

        let bad = Batch::from_rows(
            vec!["id".into(), "name".into(), "__commit_ts".into()],
            vec![
                vec![Value::Int(2), Value::from("b"), ts(11)],
                vec![Value::Int(3), Value::from("c"), Value::Int(12)],
            ],
        )
        .unwrap();
        assert!(acc.append(bad, 2, 0).is_err());
        assert_eq!(acc.len(), 1);

        let null_pk = Batch::from_rows(
            vec!["id".into(), "__commit_ts".into()],
            vec![vec![Value::Null, ts(5)]],
        )
        .unwrap();
        assert!(acc.append(null_pk, 1, 0).is_err());
        assert!(acc.append(insert_batch(&[(1, "a", 10)]), 7, 0).is_err());
    }

    #[test]
    fn test_close_is_safe_on_empty_and_repeated() {
        let mut acc = AtomicBatch::new();
        acc.close();
        acc.append(insert_batch(&[(1, "a", 10)]), 2, 0).unwrap();
        acc.close();
        acc.close();
        assert!(acc.is_empty());
        assert!(acc.columns().is_none());
        assert_eq!(acc.append_opt(None, 2, 0).unwrap(), 0);
    }

    #[test]
    fn test_merge_tail_puts_deletes_first_at_equal_ts() {
        let mut inserts = AtomicBatch::new();
        inserts
            .append(insert_batch(&[(1, "v1", 10), (1, "v2", 13)]), 2, 0)
            .unwrap();
        let mut deletes = AtomicBatch::new();
        deletes.append(delete_batch(&[(1, 13), (2, 5)]), 1, 0).unwrap();

        let order: Vec<(bool, i64)> = merge_tail(&inserts, &deletes)
            .iter()
            .map(|c| (c.is_delete(), c.key().ts.physical()))
            .collect();
        assert_eq!(
            order,
            vec![(true, 5), (false, 10), (true, 13), (false, 13)]
        );
    }
}
