// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Point lookup, sequential leaf iteration, and paginated range fold over an
//! already-opened [`Segment`](super::Segment).

use crate::{
    block::{decode_block, read_block_header, Block, BlockHandle, InnerEntry},
    range::{FoldStep, Range},
    value::{Record, UserValue, ValueType},
};
use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    path::PathBuf,
};

/// Which access pattern a [`SegmentReader`] is opened for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Point lookups: a plain unbuffered handle, one seek per read.
    Random,

    /// Sequential scans: a `BufReader`-wrapped handle for read-ahead.
    Sequential,
}

/// The outcome of [`SegmentReader::lookup`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LookupOutcome {
    /// The key was found with a live value
    Found(UserValue),

    /// The key was found, but shadowed by a tombstone in this segment
    FoundTombstone,

    /// The bloom filter or the B-tree spine ruled the key out
    NotFound,
}

enum Handle {
    Random(File),
    Sequential(BufReader<File>),
}

impl Handle {
    fn seek_to(&mut self, offset: u64) -> std::io::Result<u64> {
        match self {
            Self::Random(f) => f.seek(SeekFrom::Start(offset)),
            Self::Sequential(f) => f.seek(SeekFrom::Start(offset)),
        }
    }

    fn stream_position(&mut self) -> std::io::Result<u64> {
        match self {
            Self::Random(f) => f.stream_position(),
            Self::Sequential(f) => f.stream_position(),
        }
    }
}

impl Read for Handle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Random(f) => f.read(buf),
            Self::Sequential(f) => f.read(buf),
        }
    }
}

/// A reader over one level file's leaf/inner region.
///
/// `lookup` descends the spine fresh each time; `first_leaf`/`next_leaf`
/// maintain a sequential cursor instead.
pub struct SegmentReader {
    handle: Handle,
    root: Block,
    root_offset: u64,
    path: PathBuf,
    cursor: u64,
}

impl SegmentReader {
    pub(super) fn open(
        path: PathBuf,
        mode: OpenMode,
        root: Block,
        root_offset: u64,
    ) -> crate::Result<Self> {
        let file = File::open(&path)?;

        let handle = match mode {
            OpenMode::Random => Handle::Random(file),
            OpenMode::Sequential => Handle::Sequential(BufReader::new(file)),
        };

        Ok(Self {
            handle,
            root,
            root_offset,
            path,
            cursor: 0,
        })
    }

    fn corrupt(&self, detail: impl Into<String>) -> crate::Error {
        crate::Error::Corrupt(self.path.clone(), detail.into())
    }

    fn read_block_at(&mut self, offset: u64) -> crate::Result<Block> {
        self.handle.seek_to(offset)?;
        decode_block(&mut self.handle)?
            .ok_or_else(|| self.corrupt("expected a block, found end-of-sequence"))
    }

    /// Picks the child whose half-open interval `[separator, next.separator)`
    /// contains `key`; the last entry is unbounded above. `entries` is
    /// sorted ascending by separator.
    fn select_child(entries: &[InnerEntry], key: &[u8]) -> &BlockHandle {
        let idx = entries
            .partition_point(|entry| &*entry.separator <= key)
            .saturating_sub(1);

        &entries[idx].child
    }

    /// Descends the B-tree spine to the leaf that would contain `key`,
    /// returning its members. Leaves the sequential cursor positioned just
    /// past the returned leaf's on-disk bytes.
    fn descend_to_leaf(&mut self, key: &[u8]) -> crate::Result<Vec<Record>> {
        // A single-leaf file has no spine to walk; `self.root` is already
        // decoded but reading it again is what moves the file cursor.
        if matches!(self.root, Block::Leaf(_)) {
            return match self.read_block_at(self.root_offset)? {
                Block::Leaf(records) => Ok(records),
                Block::Inner { .. } => unreachable!("root did not change identity"),
            };
        }

        let mut current = self.root.clone();

        loop {
            match current {
                Block::Leaf(records) => return Ok(records),
                Block::Inner { entries, .. } => {
                    if entries.is_empty() {
                        return Err(self.corrupt("inner block has no entries"));
                    }

                    let handle = Self::select_child(&entries, key);
                    current = self.read_block_at(handle.offset)?;
                }
            }
        }
    }

    /// Point lookup, per §4.4: exact binary search within the located leaf.
    pub fn lookup(&mut self, key: &[u8]) -> crate::Result<LookupOutcome> {
        let records = self.descend_to_leaf(key)?;

        match records.binary_search_by(|record| (*record.key).cmp(key)) {
            Ok(idx) => Ok(match records[idx].value_type {
                ValueType::Value => LookupOutcome::Found(records[idx].value.clone()),
                ValueType::Tombstone => LookupOutcome::FoundTombstone,
            }),
            Err(_) => Ok(LookupOutcome::NotFound),
        }
    }

    /// Reads the block at offset 0. The writer always places leaves first,
    /// so this is exactly the first leaf.
    pub fn first_leaf(&mut self) -> crate::Result<Vec<Record>> {
        self.handle.seek_to(0)?;

        let block = decode_block(&mut self.handle)?
            .ok_or_else(|| self.corrupt("file is empty, expected at least one leaf"))?;

        self.cursor = self.handle.stream_position()?;

        match block {
            Block::Leaf(records) => Ok(records),
            Block::Inner { .. } => Err(self.corrupt("expected a leaf at offset 0")),
        }
    }

    /// Advances past the current block and returns the next leaf's members,
    /// transparently skipping any inner (spine) blocks in between. Returns
    /// `None` at the `length = 0` end-of-sequence sentinel.
    pub fn next_leaf(&mut self) -> crate::Result<Option<Vec<Record>>> {
        loop {
            self.handle.seek_to(self.cursor)?;

            let Some((level, body_len)) = read_block_header(&mut self.handle)? else {
                return Ok(None);
            };

            if level == crate::block::LEAF_LEVEL {
                let block = {
                    self.handle.seek_to(self.cursor)?;
                    decode_block(&mut self.handle)?
                        .ok_or_else(|| self.corrupt("header promised a block that vanished"))?
                };

                self.cursor = self.handle.stream_position()?;

                let Block::Leaf(records) = block else {
                    return Err(self.corrupt("level=0 header did not decode to a leaf"));
                };

                return Ok(Some(records));
            }

            // Skip this inner block's body without decoding it.
            self.cursor += 4 + 2 + body_len as u64;
        }
    }

    /// Every in-range record, TOMBSTONEs included. Used by a cross-level
    /// fold (§4.8), which needs a shallower level's tombstone to shadow a
    /// deeper level's value — something `range_fold`'s own tombstone
    /// filtering would silently defeat.
    pub fn records_in_range(&mut self, key_range: &crate::range::KeyRange) -> crate::Result<Vec<Record>> {
        let mut leaf = match &key_range.from_key {
            Some(from) => self.descend_to_leaf(from)?,
            None => self.first_leaf()?,
        };

        self.cursor = self.handle.stream_position()?;

        let mut out = Vec::new();

        loop {
            for record in &leaf {
                if !key_range.contains(&record.key) {
                    if key_range.is_past_upper_bound(&record.key) {
                        return Ok(out);
                    }
                    continue;
                }

                out.push(record.clone());
            }

            match self.next_leaf()? {
                Some(next) => leaf = next,
                None => return Ok(out),
            }
        }
    }

    /// Paginated range fold, per §4.4 and §4.8: folds every in-range,
    /// non-tombstone record into `acc` via `fun`, stopping at the range's
    /// upper bound, a `limit` worth of emitted records, or end-of-file.
    pub fn range_fold<A>(
        &mut self,
        range: &Range,
        mut acc: A,
        mut fun: impl FnMut(A, &Record) -> A,
    ) -> crate::Result<FoldStep<A>> {
        let mut leaf = match &range.key_range.from_key {
            Some(from) => self.descend_to_leaf(from)?,
            None => self.first_leaf()?,
        };

        // `descend_to_leaf`/`first_leaf` both leave the handle positioned
        // just past the leaf they read; that's exactly where `next_leaf`
        // needs to resume from.
        self.cursor = self.handle.stream_position()?;

        let mut remaining = range.limit;

        loop {
            for record in &leaf {
                if !range.key_range.contains(&record.key) {
                    if range.key_range.is_past_upper_bound(&record.key) {
                        return Ok(FoldStep::Done(acc));
                    }
                    continue;
                }

                if record.is_tombstone() {
                    continue;
                }

                if let Some(0) = remaining {
                    return Ok(FoldStep::Limit(acc, record.key.clone()));
                }

                acc = fun(acc, record);

                if let Some(n) = &mut remaining {
                    *n -= 1;
                }
            }

            match self.next_leaf()? {
                Some(next) => leaf = next,
                None => return Ok(FoldStep::Done(acc)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compression::CompressionType, range::KeyRange, segment::Segment};
    use std::path::Path;
    use test_log::test;

    fn build_segment(dir: &Path, level_no: u32, n: u32) -> crate::Result<Segment> {
        let mut writer =
            crate::segment::writer::SegmentWriter::new(dir, level_no, CompressionType::None)?;

        for i in 0..n {
            writer.write(Record::new_value(
                i.to_be_bytes().to_vec(),
                i.to_be_bytes().to_vec(),
            ))?;
        }

        let path = writer.finish()?.expect("n > 0");
        Segment::open(path, level_no)
    }

    #[test]
    fn range_fold_bounded_range() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let segment = build_segment(dir.path(), 0, 300)?;
        let mut reader = segment.reader(OpenMode::Sequential)?;

        let range = Range {
            key_range: KeyRange::new(100u32.to_be_bytes().to_vec(), 200u32.to_be_bytes().to_vec()),
            limit: None,
        };

        let FoldStep::Done(results) = reader.range_fold(&range, Vec::new(), |mut acc, record| {
            acc.push(u32::from_be_bytes((*record.key)[..4].try_into().unwrap()));
            acc
        })?
        else {
            panic!("expected Done for an unbounded limit");
        };

        assert_eq!((100..200).collect::<Vec<_>>(), results);

        Ok(())
    }

    #[test]
    fn range_fold_paginates_with_limit() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let segment = build_segment(dir.path(), 0, 50)?;

        let mut collected = Vec::new();
        let mut from_key = None;

        loop {
            let mut reader = segment.reader(OpenMode::Sequential)?;
            let mut key_range = KeyRange::full();

            if let Some(key) = from_key.take() {
                key_range = key_range.resume_from(key);
            }

            let range = Range { key_range, limit: Some(10) };

            match reader.range_fold(&range, Vec::new(), |mut acc, record| {
                acc.push(record.key.clone());
                acc
            })? {
                FoldStep::Done(mut chunk) => {
                    collected.append(&mut chunk);
                    break;
                }
                FoldStep::Limit(mut chunk, next_key) => {
                    collected.append(&mut chunk);
                    from_key = Some(next_key);
                }
            }
        }

        assert_eq!(50, collected.len());
        for (i, key) in collected.iter().enumerate() {
            assert_eq!(&(i as u32).to_be_bytes()[..], &**key);
        }

        Ok(())
    }

    #[test]
    fn records_in_range_keeps_tombstones() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut writer = crate::segment::writer::SegmentWriter::new(dir.path(), 0, CompressionType::None)?;
        writer.write(Record::new_value(b"a".to_vec(), b"1".to_vec()))?;
        writer.write(Record::new_tombstone(b"b".to_vec()))?;
        writer.write(Record::new_value(b"c".to_vec(), b"3".to_vec()))?;
        let path = writer.finish()?.expect("non-empty");

        let segment = Segment::open(path, 0)?;
        let mut reader = segment.reader(OpenMode::Sequential)?;
        let records = reader.records_in_range(&KeyRange::full())?;

        assert_eq!(3, records.len());
        assert!(records[1].is_tombstone());

        Ok(())
    }
}
