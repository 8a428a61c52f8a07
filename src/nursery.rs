// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The in-memory write buffer, paired with an append-only log for crash
//! recovery. Backed by a `crossbeam_skiplist::SkipMap`, the same primitive
//! a lock-free single-writer memtable uses for its record map, giving
//! concurrent reads against the single writer that mutates it.

use crate::{
    compression::CompressionType,
    segment::writer::SegmentWriter,
    value::{Record, UserKey, UserValue, ValueType},
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_skiplist::SkipMap;
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

/// Default bound on the nursery's record count before it is flushed.
pub const NURSERY_MAX: usize = 256;

const LOG_FILE_NAME: &str = "nursery.data";

fn log_path(dir: &Path) -> PathBuf {
    dir.join(LOG_FILE_NAME)
}

fn write_log_record(log: &mut File, key: &[u8], value: &[u8], value_type: ValueType) -> crate::Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    let mut buf = Vec::with_capacity(9 + key.len() + value.len());

    buf.write_u32::<BigEndian>(key.len() as u32)?;
    buf.write_all(key)?;
    buf.write_u8(value_type.into())?;
    buf.write_u32::<BigEndian>(value.len() as u32)?;
    buf.write_all(value)?;

    log.write_all(&buf)?;
    log.sync_all()?;
    Ok(())
}

/// Reads one `(key, value_type, value)` record from the log. Returns `None`
/// cleanly at EOF; a short read mid-record is treated as a torn write left
/// by a crash and also reported as `None`, since the log is append-only and
/// a torn record can only ever be the last one.
fn read_log_record(reader: &mut impl Read) -> Option<Record> {
    let mut klen_buf = [0u8; 4];
    reader.read_exact(&mut klen_buf).ok()?;
    let klen = u32::from_be_bytes(klen_buf) as usize;

    let mut key = vec![0u8; klen];
    reader.read_exact(&mut key).ok()?;

    let vtag = reader.read_u8().ok()?;
    let value_type = ValueType::try_from(vtag).ok()?;

    let vlen = reader.read_u32::<BigEndian>().ok()?;
    let mut value = vec![0u8; vlen as usize];
    reader.read_exact(&mut value).ok()?;

    Some(Record {
        key: key.into(),
        value: value.into(),
        value_type,
    })
}

/// The live value of a key inside the nursery (value or tombstone).
#[derive(Clone)]
struct NurseryValue {
    value: UserValue,
    value_type: ValueType,
}

/// The result of a nursery lookup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NurseryLookup {
    /// The key has a live value in the nursery
    Found(UserValue),

    /// The key is shadowed by a tombstone in the nursery
    FoundTombstone,

    /// The nursery holds nothing for this key
    NotFound,
}

/// The bounded, ordered in-memory write buffer.
pub struct Nursery {
    dir: PathBuf,
    items: SkipMap<UserKey, NurseryValue>,
    log: File,
    max_records: usize,
}

impl Nursery {
    /// Creates a fresh, empty nursery with a new log file.
    pub fn create_new(dir: impl Into<PathBuf>, max_records: usize) -> crate::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path(&dir))?;

        Ok(Self {
            dir,
            items: SkipMap::new(),
            log,
            max_records,
        })
    }

    /// Replays `nursery.data`, if present, into a fresh nursery. Returns
    /// `None` if there is nothing to recover.
    pub fn recover(dir: impl Into<PathBuf>, max_records: usize) -> crate::Result<Option<Self>> {
        let dir = dir.into();
        let path = log_path(&dir);

        if !path.exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(&path)?;
        let mut cursor = std::io::Cursor::new(bytes);
        let items = SkipMap::new();
        let mut replayed = 0usize;

        while let Some(record) = read_log_record(&mut cursor) {
            items.insert(
                record.key,
                NurseryValue {
                    value: record.value,
                    value_type: record.value_type,
                },
            );
            replayed += 1;
        }

        log::debug!("replayed {replayed} record(s) from {}", path.display());

        let log = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Some(Self {
            dir,
            items,
            log,
            max_records,
        }))
    }

    /// Number of records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the nursery holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns `true` once the nursery has reached its configured bound.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.max_records
    }

    /// Appends `(key, value_type)` to the write-ahead log (fsynced before
    /// returning, so the call is durable) and then to the in-memory map.
    pub fn add(&mut self, key: UserKey, value: UserValue, value_type: ValueType) -> crate::Result<()> {
        write_log_record(&mut self.log, &key, &value, value_type)?;
        self.items.insert(key, NurseryValue { value, value_type });
        Ok(())
    }

    /// Point lookup against the in-memory map only.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> NurseryLookup {
        match self.items.get(key) {
            None => NurseryLookup::NotFound,
            Some(entry) => match entry.value().value_type {
                ValueType::Value => NurseryLookup::Found(entry.value().value.clone()),
                ValueType::Tombstone => NurseryLookup::FoundTombstone,
            },
        }
    }

    /// Streams every record in key order, for both `finish` and range folds.
    fn iter_sorted(&self) -> impl Iterator<Item = Record> + '_ {
        self.items.iter().map(|entry| Record {
            key: entry.key().clone(),
            value: entry.value().value.clone(),
            value_type: entry.value().value_type,
        })
    }

    /// Every in-range, non-empty record, for [`crate::merge`] sources.
    #[must_use]
    pub fn records_in_range(&self, range: &crate::range::KeyRange) -> Vec<Record> {
        self.iter_sorted().filter(|r| range.contains(&r.key)).collect()
    }

    /// Flushes this nursery's contents to a new, as-yet-unplaced level file
    /// (the caller, [`crate::levels::Level::inject`], decides which of
    /// level 0's slots it ultimately occupies), then clears this nursery in
    /// place so it is immediately ready to accept new writes.
    ///
    /// The log is truncated only after the new segment is durably written,
    /// never before: a crash in between leaves both the (still-intact) log
    /// and the new segment on disk, and replaying the log re-inserts keys
    /// that are already present in the segment, which is harmless (the
    /// nursery is the shallower source either way, so the replayed copies
    /// simply shadow identical values until the next flush clears them).
    ///
    /// Returns `None` if the nursery held no records; the log is still
    /// truncated (it held nothing to begin with).
    pub fn finish(&mut self, compression: CompressionType) -> crate::Result<Option<PathBuf>> {
        let mut writer = SegmentWriter::new(&self.dir, 0, compression)?;
        for record in self.iter_sorted() {
            writer.write(record)?;
        }

        let output = writer.finish_detached()?;

        self.items.clear();
        self.log.set_len(0)?;
        self.log.seek(SeekFrom::Start(0))?;
        self.log.sync_all()?;

        log::debug!("nursery flushed to {output:?}, log truncated in place");

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn add_then_lookup() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut nursery = Nursery::create_new(dir.path(), NURSERY_MAX)?;

        nursery.add(b"a".to_vec().into(), b"1".to_vec().into(), ValueType::Value)?;
        nursery.add(b"b".to_vec().into(), UserValue::empty(), ValueType::Tombstone)?;

        assert_eq!(NurseryLookup::Found(b"1".to_vec().into()), nursery.lookup(b"a"));
        assert_eq!(NurseryLookup::FoundTombstone, nursery.lookup(b"b"));
        assert_eq!(NurseryLookup::NotFound, nursery.lookup(b"c"));

        Ok(())
    }

    #[test]
    fn recover_replays_log() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let mut nursery = Nursery::create_new(dir.path(), NURSERY_MAX)?;
            nursery.add(b"a".to_vec().into(), b"1".to_vec().into(), ValueType::Value)?;
            nursery.add(b"b".to_vec().into(), b"2".to_vec().into(), ValueType::Value)?;
        }

        let recovered = Nursery::recover(dir.path(), NURSERY_MAX)?.expect("log exists");
        assert_eq!(2, recovered.len());
        assert_eq!(NurseryLookup::Found(b"1".to_vec().into()), recovered.lookup(b"a"));
        assert_eq!(NurseryLookup::Found(b"2".to_vec().into()), recovered.lookup(b"b"));

        Ok(())
    }

    #[test]
    fn recover_with_no_log_returns_none() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(Nursery::recover(dir.path(), NURSERY_MAX)?.is_none());
        Ok(())
    }

    #[test]
    fn finish_writes_level_zero_and_clears_in_place() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut nursery = Nursery::create_new(dir.path(), NURSERY_MAX)?;

        for i in 0u32..20 {
            nursery.add(i.to_be_bytes().to_vec().into(), i.to_le_bytes().to_vec().into(), ValueType::Value)?;
        }

        let path = nursery.finish(CompressionType::None)?.expect("records were written");

        assert!(nursery.is_empty());
        assert_eq!(0, std::fs::metadata(log_path(dir.path()))?.len());

        let segment = crate::segment::Segment::open(&path, 0)?;
        let mut reader = segment.reader(crate::segment::OpenMode::Random)?;
        let crate::segment::LookupOutcome::Found(value) = reader.lookup(&5u32.to_be_bytes())? else {
            panic!("expected key 5 to survive the flush");
        };
        assert_eq!(5u32.to_le_bytes().to_vec(), &*value);

        // the nursery is immediately usable again
        nursery.add(b"z".to_vec().into(), b"1".to_vec().into(), ValueType::Value)?;
        assert_eq!(NurseryLookup::Found(b"1".to_vec().into()), nursery.lookup(b"z"));

        Ok(())
    }

    #[test]
    fn finish_with_empty_nursery_returns_none() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut nursery = Nursery::create_new(dir.path(), NURSERY_MAX)?;

        assert!(nursery.finish(CompressionType::None)?.is_none());
        assert!(nursery.is_empty());

        Ok(())
    }
}
