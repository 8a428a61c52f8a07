// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Builds an immutable level file from a sorted, duplicate-free record
//! stream: leaves, a B-tree spine above them, a trailing compressed bloom
//! filter, and a 12-byte trailer. Committed via an atomic rename.

use super::{level_file_path, BLOOM_FP_RATE, INNER_FANOUT, LEAF_FANOUT};
use crate::{
    block::{Block, BlockHandle, InnerEntry},
    bloom::{BloomFilter, CompositeHash},
    compression::CompressionType,
    value::Record,
};
use byteorder::{BigEndian, WriteBytesExt};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

/// Streaming writer for one level file.
///
/// Call [`SegmentWriter::write`] for each record in ascending key order,
/// then [`SegmentWriter::finish`] to commit the file. Dropping the writer
/// without calling `finish` discards the partial file (the backing
/// [`tempfile::NamedTempFile`] removes itself on drop).
pub struct SegmentWriter {
    folder: PathBuf,
    level_no: u32,
    compression: CompressionType,
    bloom_fp_rate: f32,

    temp_file: tempfile::NamedTempFile,
    writer: BufWriter<File>,
    file_pos: u64,

    leaf_buf: Vec<Record>,

    /// `staging[i]` holds separator/child entries waiting to be flushed as
    /// an inner block at level `i + 1`.
    staging: Vec<Vec<InnerEntry>>,

    bloom_hashes: Vec<CompositeHash>,
    item_count: usize,
}

impl SegmentWriter {
    /// Opens a new level file under construction inside `folder`.
    pub fn new(folder: impl Into<PathBuf>, level_no: u32, compression: CompressionType) -> crate::Result<Self> {
        Self::with_bloom_fp_rate(folder, level_no, compression, BLOOM_FP_RATE)
    }

    /// Like [`SegmentWriter::new`], explicitly naming the bloom false-
    /// positive rate target.
    pub fn with_bloom_fp_rate(
        folder: impl Into<PathBuf>,
        level_no: u32,
        compression: CompressionType,
        bloom_fp_rate: f32,
    ) -> crate::Result<Self> {
        let folder = folder.into();
        std::fs::create_dir_all(&folder)?;

        let temp_file = tempfile::NamedTempFile::new_in(&folder)?;
        let writer = BufWriter::new(temp_file.as_file().try_clone()?);

        Ok(Self {
            folder,
            level_no,
            compression,
            bloom_fp_rate,
            temp_file,
            writer,
            file_pos: 0,
            leaf_buf: Vec::with_capacity(LEAF_FANOUT),
            staging: Vec::new(),
            bloom_hashes: Vec::new(),
            item_count: 0,
        })
    }

    /// Appends one record. Records must arrive in strictly ascending key
    /// order with no duplicates.
    pub fn write(&mut self, record: Record) -> crate::Result<()> {
        self.bloom_hashes.push(BloomFilter::get_hash(&record.key));
        self.item_count += 1;
        self.leaf_buf.push(record);

        if self.leaf_buf.len() >= LEAF_FANOUT {
            self.flush_leaf()?;
        }

        Ok(())
    }

    /// The number of records written so far.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    fn write_block(&mut self, block: &Block) -> crate::Result<BlockHandle> {
        let offset = self.file_pos;
        let written = block.encode_into(&mut self.writer)?;

        #[allow(clippy::cast_possible_truncation)]
        let size = written as u32;

        self.file_pos += u64::from(size);
        Ok(BlockHandle { offset, size })
    }

    fn ensure_level(&mut self, level_idx: usize) {
        while self.staging.len() <= level_idx {
            self.staging.push(Vec::new());
        }
    }

    fn push_entry(&mut self, level_idx: usize, entry: InnerEntry) {
        self.ensure_level(level_idx);
        self.staging[level_idx].push(entry);
    }

    /// Flushes the pending leaf buffer, if non-empty, staging its entry at
    /// level 0 and cascading an inner-node flush if that level is now full.
    fn flush_leaf(&mut self) -> crate::Result<()> {
        if self.leaf_buf.is_empty() {
            return Ok(());
        }

        let records = std::mem::replace(&mut self.leaf_buf, Vec::with_capacity(LEAF_FANOUT));
        let separator = records[0].key.clone();
        let handle = self.write_block(&Block::Leaf(records))?;

        self.push_entry(0, InnerEntry { separator, child: handle });
        self.maybe_flush_inner(0)
    }

    /// Flushes `staging[level_idx]` unconditionally (used by both the
    /// fanout-triggered cascade and the bottom-up collapse in `finish`).
    fn flush_inner_raw(&mut self, level_idx: usize) -> crate::Result<()> {
        let entries = std::mem::take(&mut self.staging[level_idx]);

        if entries.is_empty() {
            return Ok(());
        }

        let separator = entries[0].separator.clone();
        let level = u16::try_from(level_idx + 1).expect("spine depth fits in u16");
        let handle = self.write_block(&Block::Inner { level, entries })?;

        self.push_entry(level_idx + 1, InnerEntry { separator, child: handle });
        Ok(())
    }

    /// Flushes `staging[level_idx]` as soon as it reaches `INNER_FANOUT`,
    /// cascading upward as far as the new entry pushes the next level over
    /// its own threshold.
    fn maybe_flush_inner(&mut self, level_idx: usize) -> crate::Result<()> {
        if self.staging.get(level_idx).is_some_and(|level| level.len() >= INNER_FANOUT) {
            self.flush_inner_raw(level_idx)?;
            self.maybe_flush_inner(level_idx + 1)?;
        }

        Ok(())
    }

    /// Finishes the file: flushes any partial leaf/inner buffers bottom-up
    /// until a single root entry remains, appends the compressed bloom
    /// filter and trailer, and atomically renames the file to its level's
    /// canonical path.
    ///
    /// Returns `None` if no records were ever written (no file is created).
    pub fn finish(self) -> crate::Result<Option<PathBuf>> {
        let level_no = self.level_no;
        self.finish_inner(|folder| Some(level_file_path(folder, level_no)))
    }

    /// Like [`SegmentWriter::finish`], but leaves the output file under its
    /// (already unique) temporary name inside `folder` instead of renaming
    /// it to a canonical level path. Used when the caller -- not this
    /// writer -- decides which slot the file should occupy, e.g.
    /// [`crate::levels::Level::inject`] renaming it into whichever of its
    /// two slots happens to be free.
    pub fn finish_detached(self) -> crate::Result<Option<PathBuf>> {
        self.finish_inner(|_| None)
    }

    fn finish_inner(mut self, final_path: impl FnOnce(&std::path::Path) -> Option<PathBuf>) -> crate::Result<Option<PathBuf>> {
        self.flush_leaf()?;

        if self.item_count == 0 {
            log::debug!("no records written to level {}, discarding", self.level_no);
            return Ok(None);
        }

        let mut level_idx = 0;

        loop {
            let is_top_level = self.staging[level_idx + 1..].iter().all(Vec::is_empty);
            let entries_here = self.staging[level_idx].len();

            if is_top_level && entries_here <= 1 {
                break;
            }

            self.flush_inner_raw(level_idx)?;
            level_idx += 1;
        }

        let root_level = self
            .staging
            .iter()
            .rposition(|level| !level.is_empty())
            .expect("at least one leaf was written");

        let root_offset = self.staging[root_level]
            .pop()
            .expect("checked non-empty")
            .child
            .offset;

        let mut bloom = BloomFilter::with_fp_rate(self.item_count, self.bloom_fp_rate);
        for hash in self.bloom_hashes.drain(..) {
            bloom.set_with_hash(hash);
        }

        let bloom_bytes = bloom.serialize_compressed(self.compression);
        self.writer.write_all(&bloom_bytes)?;

        #[allow(clippy::cast_possible_truncation)]
        let bloom_size = bloom_bytes.len() as u32;

        self.writer.write_u32::<BigEndian>(bloom_size)?;
        self.writer.write_u64::<BigEndian>(root_offset)?;
        self.writer.flush()?;

        self.temp_file.as_file().sync_all()?;

        let path = match final_path(&self.folder) {
            Some(final_path) => {
                self.temp_file
                    .persist(&final_path)
                    .map_err(|e| crate::Error::Io(e.error))?;
                final_path
            }
            None => {
                let (_file, path) = self.temp_file.keep().map_err(|e| crate::Error::Io(e.error))?;
                path
            }
        };

        #[cfg(not(target_os = "windows"))]
        {
            let dir = File::open(&self.folder)?;
            dir.sync_all()?;
        }

        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{OpenMode, Segment};
    use test_log::test;

    #[test]
    fn write_single_leaf_and_read_back() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut writer = SegmentWriter::new(dir.path(), 0, CompressionType::None)?;
        for i in 0u32..10 {
            writer.write(Record::new_value(i.to_be_bytes().to_vec(), format!("v{i}").into_bytes()))?;
        }

        let path = writer.finish()?.expect("records were written");
        let segment = Segment::open(&path, 0)?;

        assert_eq!(0, segment.level_no);
        assert!(segment.may_contain(&5u32.to_be_bytes()));

        let mut reader = segment.reader(OpenMode::Random)?;
        let crate::segment::LookupOutcome::Found(value) = reader.lookup(&5u32.to_be_bytes())? else {
            panic!("expected a value");
        };
        assert_eq!(b"v5", &*value);

        Ok(())
    }

    #[test]
    fn write_many_leaves_builds_a_spine() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut writer = SegmentWriter::new(dir.path(), 3, CompressionType::None)?;
        for i in 0u32..(LEAF_FANOUT as u32 * 5 + 7) {
            writer.write(Record::new_value(i.to_be_bytes().to_vec(), i.to_le_bytes().to_vec()))?;
        }

        let path = writer.finish()?.expect("records were written");
        let segment = Segment::open(&path, 3)?;

        let mut reader = segment.reader(OpenMode::Sequential)?;
        let mut count = 0;
        let mut leaf = reader.first_leaf()?;

        loop {
            count += leaf.len();
            match reader.next_leaf()? {
                Some(next) => leaf = next,
                None => break,
            }
        }

        assert_eq!(LEAF_FANOUT * 5 + 7, count);

        let mut random_reader = segment.reader(OpenMode::Random)?;
        for i in [0u32, 1, 42, 200, 330] {
            let crate::segment::LookupOutcome::Found(value) = random_reader.lookup(&i.to_be_bytes())? else {
                panic!("expected key {i} to be found");
            };
            assert_eq!(i.to_le_bytes().to_vec(), &*value);
        }

        Ok(())
    }

    #[test]
    fn empty_writer_produces_no_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = SegmentWriter::new(dir.path(), 0, CompressionType::None)?;
        assert!(writer.finish()?.is_none());
        Ok(())
    }

    #[test]
    fn tombstones_round_trip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut writer = SegmentWriter::new(dir.path(), 0, CompressionType::None)?;
        writer.write(Record::new_value(b"a".to_vec(), b"1".to_vec()))?;
        writer.write(Record::new_tombstone(b"b".to_vec()))?;
        writer.write(Record::new_value(b"c".to_vec(), b"3".to_vec()))?;

        let path = writer.finish()?.expect("records were written");
        let segment = Segment::open(&path, 0)?;
        let mut reader = segment.reader(OpenMode::Random)?;

        assert!(matches!(
            reader.lookup(b"b")?,
            crate::segment::LookupOutcome::FoundTombstone
        ));

        Ok(())
    }
}
