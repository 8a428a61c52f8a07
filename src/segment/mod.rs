// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The immutable on-disk level file: trailer, bloom filter, B-tree spine and
//! leaves, plus the reader algorithms (point lookup, sequential scan, range
//! fold) and the writer that builds one from a sorted record stream.

pub mod reader;
pub mod writer;

use crate::{
    block::{decode_block, Block},
    bloom::BloomFilter,
    compression::CompressionType,
};
use byteorder::{BigEndian, ReadBytesExt};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

pub use reader::{LookupOutcome, OpenMode, SegmentReader};
pub use writer::SegmentWriter;

/// Size of the trailer: `bloom_size: u32 || root_offset: u64`.
pub const TRAILER_LEN: u64 = 4 + 8;

/// Maximum records per leaf block.
pub const LEAF_FANOUT: usize = 64;

/// Maximum entries per inner (spine) block.
pub const INNER_FANOUT: usize = 64;

/// Target false-positive rate for a level file's bloom filter.
pub const BLOOM_FP_RATE: f32 = 0.01;

/// A single, immutable level file (what the spec calls a "level file").
///
/// Holds just enough already-parsed metadata (the root block and the bloom
/// filter) to serve lookups and folds without re-reading the trailer on
/// every call. The file itself stays on disk; [`Segment::reader`] opens a
/// fresh file handle for whichever access pattern the caller needs.
#[derive(Debug)]
pub struct Segment {
    /// Path to the `BTree-<N>.data` file on disk
    pub path: PathBuf,

    /// The level number this segment belongs to
    pub level_no: u32,

    bloom: BloomFilter,
    root: Block,
    root_offset: u64,
    compression: CompressionType,
}

impl Segment {
    /// Opens an existing level file, parsing its trailer, bloom filter and
    /// root block.
    pub fn open(path: impl Into<PathBuf>, level_no: u32) -> crate::Result<Self> {
        Self::open_with_compression(path, level_no, CompressionType::default())
    }

    /// Like [`Segment::open`], explicitly naming the bloom compression codec
    /// (the writer stamps no compression tag of its own, so the reader must
    /// be told which codec produced the file).
    pub fn open_with_compression(
        path: impl Into<PathBuf>,
        level_no: u32,
        compression: CompressionType,
    ) -> crate::Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len < TRAILER_LEN {
            return Err(crate::Error::Corrupt(
                path,
                "file shorter than the trailer".into(),
            ));
        }

        file.seek(SeekFrom::Start(file_len - TRAILER_LEN))?;
        let bloom_size = file.read_u32::<BigEndian>()?;
        let root_offset = file.read_u64::<BigEndian>()?;

        let bloom_region_start = file_len
            .checked_sub(TRAILER_LEN + u64::from(bloom_size))
            .ok_or_else(|| {
                crate::Error::Corrupt(path.clone(), "bloom_size overruns the file".into())
            })?;

        file.seek(SeekFrom::Start(bloom_region_start))?;
        let mut bloom_bytes = vec![0u8; bloom_size as usize];
        file.read_exact(&mut bloom_bytes).map_err(|e| {
            crate::Error::Corrupt(path.clone(), format!("truncated bloom region: {e}"))
        })?;

        let bloom = BloomFilter::deserialize_compressed(&bloom_bytes, compression)
            .map_err(|_| crate::Error::Corrupt(path.clone(), "malformed bloom filter".into()))?;

        if root_offset >= bloom_region_start {
            return Err(crate::Error::Corrupt(
                path,
                "root_offset points past the leaf/inner region".into(),
            ));
        }

        file.seek(SeekFrom::Start(root_offset))?;
        let root = decode_block(&mut file)?.ok_or_else(|| {
            crate::Error::Corrupt(path.clone(), "root_offset points at end-of-sequence".into())
        })?;

        Ok(Self {
            path,
            level_no,
            bloom,
            root,
            root_offset,
            compression,
        })
    }

    /// Returns `true` if the bloom filter reports `key` as possibly present.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bloom.contains(key)
    }

    /// Opens a fresh reader over this segment's file in the given mode.
    pub fn reader(&self, mode: OpenMode) -> crate::Result<SegmentReader> {
        SegmentReader::open(self.path.clone(), mode, self.root.clone(), self.root_offset)
    }

    /// Parses the level number out of a `BTree-<N>.data` filename, matching
    /// the `^[^\d]+-(\d+)\.data$` layout literally: everything before the
    /// final `-` must be digit-free, and everything after it through
    /// `.data` must be the level number.
    #[must_use]
    pub fn parse_level_no(file_name: &str) -> Option<u32> {
        let dot_data = file_name.strip_suffix(".data")?;
        let last_dash = dot_data.rfind('-')?;

        let (prefix, digits) = (&dot_data[..last_dash], &dot_data[last_dash + 1..]);

        if prefix.is_empty() || prefix.contains(|c: char| c.is_ascii_digit()) {
            return None;
        }

        digits.parse().ok()
    }

    /// The canonical filename for a level-`level_no` file.
    #[must_use]
    pub fn file_name(level_no: u32) -> String {
        Self::file_name_for_slot(level_no, FileSlot::Primary)
    }

    /// The filename for `level_no`'s `slot`, per §4.6's "bag of up to two
    /// files". Both forms still parse via [`Segment::parse_level_no`]: the
    /// secondary form's prefix stays digit-free so it still matches the
    /// `^[^\d]+-(\d+)\.data$` layout.
    #[must_use]
    pub fn file_name_for_slot(level_no: u32, slot: FileSlot) -> String {
        match slot {
            FileSlot::Primary => format!("BTree-{level_no}.data"),
            FileSlot::Secondary => format!("BTreeB-{level_no}.data"),
        }
    }
}

/// Which of a level's (at most two) file slots a writer targets. A level
/// normally holds a single `Primary` file; a `Secondary` file exists only
/// while a merge absorbing both into the next level is in flight.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileSlot {
    /// The sole, or first, occupant of a level
    Primary,

    /// The second occupant, present only until the pending merge commits
    Secondary,
}

/// Builds the canonical path for a level file inside `dir`.
pub fn level_file_path(dir: &Path, level_no: u32) -> PathBuf {
    dir.join(Segment::file_name(level_no))
}

/// Builds the path for `level_no`'s `slot` inside `dir`.
pub fn level_file_path_for_slot(dir: &Path, level_no: u32, slot: FileSlot) -> PathBuf {
    dir.join(Segment::file_name_for_slot(level_no, slot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn parse_level_no_from_filename() {
        assert_eq!(Some(0), Segment::parse_level_no("BTree-0.data"));
        assert_eq!(Some(12), Segment::parse_level_no("BTree-12.data"));
        assert_eq!(None, Segment::parse_level_no("nursery.data"));
        assert_eq!(None, Segment::parse_level_no("BTree-abc.data"));
    }

    #[test]
    fn parse_level_no_rejects_digit_before_final_dash() {
        // A prefix containing a digit fails the `^[^\d]+-(\d+)\.data$` regex,
        // even though a naive "last non-digit before the number" scan would accept it.
        assert_eq!(None, Segment::parse_level_no("BTree2-12.data"));
    }

    #[test]
    fn file_name_round_trip() {
        let name = Segment::file_name(7);
        assert_eq!("BTree-7.data", name);
        assert_eq!(Some(7), Segment::parse_level_no(&name));
    }

    #[test]
    fn secondary_slot_name_matches_filename_regex() {
        let name = Segment::file_name_for_slot(7, FileSlot::Secondary);
        assert_eq!("BTreeB-7.data", name);
        assert_eq!(Some(7), Segment::parse_level_no(&name));
    }
}
