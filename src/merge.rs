// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! k-way merge of sorted record streams, honoring tombstones.
//!
//! Ties are broken by "shallowness rank": a pair `(level_depth, file_index)`
//! where smaller sorts first. Nursery records use `(0, 0)`; a level-N file
//! at index `i` within its level's file bag uses `(N + 1, i)`. The merge
//! keeps the shallowest (newest) record for a duplicated key and discards
//! the rest, which is what makes a level merge also a GC pass.

use crate::value::Record;
use interval_heap::IntervalHeap as Heap;

/// A boxed, already-sorted stream of records from one source (the nursery
/// or one level file), paired with its shallowness rank at construction.
pub type BoxedRecordIter<'a> = Box<dyn Iterator<Item = crate::Result<Record>> + 'a>;

struct HeapItem {
    source_idx: usize,
    rank: (u32, u32),
    record: Record,
}

impl Eq for HeapItem {}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.record.key == other.record.key && self.rank == other.rank
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.record.key.cmp(&other.record.key).then(self.rank.cmp(&other.rank))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges multiple sorted record streams into one, newest-wins on key
/// collision.
pub struct Merger<'a> {
    sources: Vec<BoxedRecordIter<'a>>,
    ranks: Vec<(u32, u32)>,
    heap: Heap<HeapItem>,
    initialized: bool,
    pending: Option<HeapItem>,

    /// If set, tombstones are dropped from the output instead of being
    /// forwarded — correct only when this merge has no deeper source left
    /// to shadow.
    elide_tombstones: bool,
}

impl<'a> Merger<'a> {
    /// Builds a merger over `sources`, each tagged with its shallowness
    /// rank in `ranks` (same length and order as `sources`).
    #[must_use]
    pub fn new(sources: Vec<BoxedRecordIter<'a>>, ranks: Vec<(u32, u32)>, elide_tombstones: bool) -> Self {
        assert_eq!(sources.len(), ranks.len());

        let heap = Heap::with_capacity(sources.len());

        Self {
            sources,
            ranks,
            heap,
            initialized: false,
            pending: None,
            elide_tombstones,
        }
    }

    fn advance_source(&mut self, idx: usize) -> crate::Result<()> {
        if let Some(item) = self.sources[idx].next() {
            let record = item?;
            self.heap.push(HeapItem { source_idx: idx, rank: self.ranks[idx], record });
        }

        Ok(())
    }

    fn initialize(&mut self) -> crate::Result<()> {
        for idx in 0..self.sources.len() {
            self.advance_source(idx)?;
        }

        self.initialized = true;
        Ok(())
    }

    fn pull(&mut self) -> crate::Result<Option<HeapItem>> {
        if let Some(item) = self.pending.take() {
            return Ok(Some(item));
        }

        if !self.initialized {
            self.initialize()?;
        }

        Ok(self.heap.pop_min())
    }
}

impl Iterator for Merger<'_> {
    type Item = crate::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let winner = match self.pull() {
                Ok(Some(item)) => item,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };

            if let Err(e) = self.advance_source(winner.source_idx) {
                return Some(Err(e));
            }

            // Discard every other source's value for the same key; the
            // heap's ordering guarantees the shallowest one was `winner`.
            loop {
                match self.heap.pop_min() {
                    Some(candidate) if candidate.record.key == winner.record.key => {
                        if let Err(e) = self.advance_source(candidate.source_idx) {
                            return Some(Err(e));
                        }
                    }
                    Some(candidate) => {
                        self.pending = Some(candidate);
                        break;
                    }
                    None => break,
                }
            }

            if winner.record.is_tombstone() && self.elide_tombstones {
                continue;
            }

            return Some(Ok(winner.record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Record;
    use test_log::test;

    fn iter_of(records: Vec<Record>) -> BoxedRecordIter<'static> {
        Box::new(records.into_iter().map(Ok))
    }

    #[test]
    fn merges_disjoint_sorted_sources() -> crate::Result<()> {
        let a = iter_of(vec![Record::new_value(b"a".to_vec(), b"1".to_vec()), Record::new_value(b"c".to_vec(), b"3".to_vec())]);
        let b = iter_of(vec![Record::new_value(b"b".to_vec(), b"2".to_vec()), Record::new_value(b"d".to_vec(), b"4".to_vec())]);

        let merger = Merger::new(vec![a, b], vec![(0, 0), (1, 0)], false);
        let keys: Vec<Vec<u8>> = merger.map(|r| r.map(|rec| rec.key.to_vec())).collect::<crate::Result<_>>()?;

        assert_eq!(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()], keys);
        Ok(())
    }

    #[test]
    fn shallower_source_wins_on_key_collision() -> crate::Result<()> {
        let shallow = iter_of(vec![Record::new_value(b"k".to_vec(), b"new".to_vec())]);
        let deep = iter_of(vec![Record::new_value(b"k".to_vec(), b"old".to_vec())]);

        // shallow is rank (0,0); deep is rank (1,0) -- shallow must win
        let merger = Merger::new(vec![deep, shallow], vec![(1, 0), (0, 0)], false);
        let results: Vec<Record> = merger.collect::<crate::Result<_>>()?;

        assert_eq!(1, results.len());
        assert_eq!(b"new", &*results[0].value);
        Ok(())
    }

    #[test]
    fn tombstone_shadows_older_value() -> crate::Result<()> {
        let shallow = iter_of(vec![Record::new_tombstone(b"k".to_vec())]);
        let deep = iter_of(vec![Record::new_value(b"k".to_vec(), b"old".to_vec())]);

        let merger = Merger::new(vec![shallow, deep], vec![(0, 0), (1, 0)], false);
        let results: Vec<Record> = merger.collect::<crate::Result<_>>()?;

        assert_eq!(1, results.len());
        assert!(results[0].is_tombstone());
        Ok(())
    }

    #[test]
    fn eliding_tombstones_drops_them_at_the_deepest_level() -> crate::Result<()> {
        let only = iter_of(vec![
            Record::new_tombstone(b"k".to_vec()),
            Record::new_value(b"z".to_vec(), b"1".to_vec()),
        ]);

        let merger = Merger::new(vec![only], vec![(0, 0)], true);
        let results: Vec<Record> = merger.collect::<crate::Result<_>>()?;

        assert_eq!(1, results.len());
        assert_eq!(b"z", &*results[0].key);
        Ok(())
    }
}
