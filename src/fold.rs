// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Ties the nursery and level chain into one online k-way merge for a
//! single range-fold request (§4.8). A [`FoldWorker`] is built once, at
//! subscribe time, over a snapshot of the nursery and every level's files
//! in range; it is then resumed chunk by chunk (sync fold pulls one
//! unbounded chunk, async fold pulls `ASYNC_CHUNK_SIZE` at a time), so a
//! write landing after subscription never appears in the fold, per §5's
//! "consistent snapshot" guarantee.

use crate::{
    levels::Level,
    merge::{BoxedRecordIter, Merger},
    range::{FoldStep, KeyRange},
    segment::OpenMode,
    value::Record,
};
use std::sync::Arc;

/// Reads every in-range record (TOMBSTONEs included — see
/// [`crate::segment::reader::SegmentReader::records_in_range`]) from each of
/// `level`'s files, fully materialized, tagged with this level's shallowness
/// rank. Pagination happens downstream in the merged stream, not here.
fn level_sources(level: &Arc<Level>, key_range: &KeyRange) -> crate::Result<(Vec<BoxedRecordIter<'static>>, Vec<(u32, u32)>)> {
    let mut sources: Vec<BoxedRecordIter<'static>> = Vec::new();
    let mut ranks = Vec::new();

    for (file_index, segment) in level.files_snapshot().into_iter().enumerate() {
        let mut reader = segment.reader(OpenMode::Sequential)?;
        let records = reader.records_in_range(key_range)?;

        sources.push(Box::new(records.into_iter().map(Ok)));

        #[allow(clippy::cast_possible_truncation)]
        ranks.push((level.depth() + 1, file_index as u32));
    }

    Ok((sources, ranks))
}

/// A resumable, snapshotted range fold over the nursery and every level.
pub struct FoldWorker {
    merger: Merger<'static>,
    pending: Option<Record>,
}

impl FoldWorker {
    /// Builds the worker's sources right now: `nursery_records` (already
    /// filtered to the query range by the caller) plus every level file in
    /// range, read in SEQUENTIAL mode. Nothing written after this call is
    /// observed by the resulting worker.
    pub fn new(nursery_records: Vec<Record>, top_level: Arc<Level>, key_range: &KeyRange) -> crate::Result<Self> {
        let mut sources: Vec<BoxedRecordIter<'static>> = vec![Box::new(nursery_records.into_iter().map(Ok))];
        let mut ranks = vec![(0u32, 0u32)];

        let mut level = Some(top_level);
        while let Some(current) = level {
            let (mut level_sources, mut level_ranks) = level_sources(&current, key_range)?;
            sources.append(&mut level_sources);
            ranks.append(&mut level_ranks);
            level = current.next();
        }

        Ok(Self {
            merger: Merger::new(sources, ranks, false),
            pending: None,
        })
    }

    fn next_record(&mut self) -> crate::Result<Option<Record>> {
        if let Some(record) = self.pending.take() {
            return Ok(Some(record));
        }

        self.merger.next().transpose()
    }

    /// Folds up to `limit` more non-tombstone records into `acc`, per
    /// §4.4's three terminal conditions. `limit = None` runs to `Done`.
    pub fn fold_chunk<A>(
        &mut self,
        limit: Option<usize>,
        mut acc: A,
        mut fun: impl FnMut(A, &Record) -> A,
    ) -> crate::Result<FoldStep<A>> {
        let mut remaining = limit;

        loop {
            let Some(record) = self.next_record()? else {
                return Ok(FoldStep::Done(acc));
            };

            if record.is_tombstone() {
                continue;
            }

            if let Some(0) = remaining {
                let next_key = record.key.clone();
                self.pending = Some(record);
                return Ok(FoldStep::Limit(acc, next_key));
            }

            acc = fun(acc, &record);

            if let Some(n) = &mut remaining {
                *n -= 1;
            }
        }
    }
}
