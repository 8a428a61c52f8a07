// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-level coordinator. A `Level` owns up to two on-disk files and a
//! lazily-created link to the next, deeper level. Levels form a singly
//! linked chain from shallowest (0) to deepest, matching Design Note §9's
//! "level chain" option.

use crate::{
    compression::CompressionType,
    segment::{level_file_path_for_slot, FileSlot, LookupOutcome, OpenMode, Segment},
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

/// A merge that must be executed: two (or, transiently, more) files at one
/// depth, to be combined into a single file at `output_depth`.
pub struct MergeJob {
    /// The depth the merged output belongs to
    pub output_depth: u32,

    /// The files to merge, in arbitrary order (the merger itself ranks them)
    pub inputs: Vec<Arc<Segment>>,

    /// Whether the merge output is the deepest data that will exist for
    /// these keys, so tombstones may be elided instead of carried forward
    pub elide_tombstones: bool,
}

/// One level's file bag plus a link to the next, deeper level.
pub struct Level {
    depth: u32,
    dir: PathBuf,
    compression: CompressionType,
    files: RwLock<Vec<Arc<Segment>>>,
    next: RwLock<Option<Arc<Level>>>,
}

impl Level {
    /// Creates an empty level at `depth`.
    #[must_use]
    pub fn new(depth: u32, dir: impl Into<PathBuf>, compression: CompressionType) -> Arc<Self> {
        Arc::new(Self {
            depth,
            dir: dir.into(),
            compression,
            files: RwLock::new(Vec::new()),
            next: RwLock::new(None),
        })
    }

    /// This level's depth (0 = shallowest).
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The directory every level file lives under (shared by the whole
    /// chain).
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A snapshot of the files currently resident at this level.
    #[must_use]
    pub fn files_snapshot(&self) -> Vec<Arc<Segment>> {
        self.files.read().expect("lock poisoned").clone()
    }

    /// The next, deeper level, if one has been created.
    #[must_use]
    pub fn next(&self) -> Option<Arc<Self>> {
        self.next.read().expect("lock poisoned").clone()
    }

    /// Returns the next, deeper level, creating an empty one if it doesn't
    /// exist yet ("created lazily" per §4.6).
    #[must_use]
    pub fn next_or_create(self: &Arc<Self>) -> Arc<Self> {
        if let Some(next) = self.next() {
            return next;
        }

        let mut slot = self.next.write().expect("lock poisoned");
        slot.get_or_insert_with(|| Self::new(self.depth + 1, &self.dir, self.compression))
            .clone()
    }

    /// Links an already-constructed deeper level in, used by directory
    /// recovery which builds the chain deepest-first.
    pub fn link_next(&self, next: Arc<Self>) {
        *self.next.write().expect("lock poisoned") = Some(next);
    }

    /// Returns `true` if this level and every level beneath it holds no
    /// files, i.e. a merge landing here would be discharging the deepest
    /// copy of its keys and may elide tombstones.
    fn is_empty_to_the_bottom(&self) -> bool {
        self.files.read().expect("lock poisoned").is_empty()
            && self.next().map_or(true, |next| next.is_empty_to_the_bottom())
    }

    /// Attaches `incoming_path` (an unplaced, freshly-written level file) to
    /// this level, renaming it into whichever of the two slots is free.
    ///
    /// Returns a [`MergeJob`] once the attach fills the bag to two files;
    /// the caller is responsible for running the merge (typically on a
    /// background worker) and feeding its output to
    /// `next_or_create().inject(..)`, followed by [`Level::complete_merge`]
    /// on this level once that inject durably commits.
    pub fn inject(self: &Arc<Self>, incoming_path: PathBuf) -> crate::Result<Option<MergeJob>> {
        let mut files = self.files.write().expect("lock poisoned");

        let slot = match files.len() {
            0 => FileSlot::Primary,
            1 => FileSlot::Secondary,
            _ => {
                log::warn!(
                    "level {} already has a merge in flight; deferring a third file is unsupported, dropping the lock and retrying is the caller's responsibility",
                    self.depth
                );
                return Err(crate::Error::Closed);
            }
        };

        let final_path = level_file_path_for_slot(&self.dir, self.depth, slot);
        if incoming_path != final_path {
            std::fs::rename(&incoming_path, &final_path)?;
        }

        let segment = Arc::new(Segment::open_with_compression(final_path, self.depth, self.compression)?);
        log::debug!("level {} gained a file in slot {slot:?}", self.depth);
        files.push(segment);

        if files.len() < 2 {
            return Ok(None);
        }

        let inputs = files.clone();
        let elide_tombstones = self.next().map_or(true, |next| next.is_empty_to_the_bottom());

        Ok(Some(MergeJob {
            output_depth: self.depth + 1,
            inputs,
            elide_tombstones,
        }))
    }

    /// Unlinks this level's current files and clears its bag. Call only
    /// after the merged output superseding them has been durably renamed
    /// into the next level (§4.6's "rename precedes unlink").
    pub fn complete_merge(&self) {
        let mut files = self.files.write().expect("lock poisoned");

        for segment in files.drain(..) {
            if let Err(e) = std::fs::remove_file(&segment.path) {
                log::warn!("failed to unlink superseded level file {}: {e}", segment.path.display());
            }
        }
    }

    /// Point lookup: consults this level's files newest-first, then
    /// recurses into the next deeper level on a clean miss. A tombstone
    /// answer stops the descent but is reported to the caller as "not
    /// found", per §4.6.
    pub fn lookup(&self, key: &[u8]) -> crate::Result<Option<crate::value::UserValue>> {
        let files = self.files.read().expect("lock poisoned").clone();

        for segment in files.iter().rev() {
            if !segment.may_contain(key) {
                continue;
            }

            let mut reader = segment.reader(OpenMode::Random)?;
            match reader.lookup(key)? {
                LookupOutcome::Found(value) => return Ok(Some(value)),
                LookupOutcome::FoundTombstone => return Ok(None),
                LookupOutcome::NotFound => continue,
            }
        }

        match self.next() {
            Some(next) => next.lookup(key),
            None => Ok(None),
        }
    }
}

/// Recovers the on-disk level chain under `dir`: scans for `BTree-<N>.data`
/// / `BTreeB-<N>.data` files, determines the min/max present depths, and
/// opens and links them deepest-first so each shallower level's `next`
/// pointer is valid before it is returned, per §6.
pub fn recover(dir: &Path, compression: CompressionType) -> crate::Result<Arc<Level>> {
    let mut by_depth: std::collections::BTreeMap<u32, Vec<PathBuf>> = std::collections::BTreeMap::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };

        if let Some(depth) = Segment::parse_level_no(&name) {
            by_depth.entry(depth).or_default().push(entry.path());
        }
    }

    let max_depth = by_depth.keys().next_back().copied();

    let mut next: Option<Arc<Level>> = None;

    if let Some(max_depth) = max_depth {
        for depth in (0..=max_depth).rev() {
            let level = Level::new(depth, dir, compression);

            if let Some(deeper) = next.take() {
                level.link_next(deeper);
            }

            let mut files = level.files.write().expect("lock poisoned");
            for path in by_depth.remove(&depth).unwrap_or_default() {
                files.push(Arc::new(Segment::open_with_compression(path, depth, compression)?));
            }
            drop(files);

            next = Some(level);
        }
    }

    Ok(next.unwrap_or_else(|| Level::new(0, dir, compression)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{segment::writer::SegmentWriter, value::Record};
    use test_log::test;

    fn write_level_file(dir: &Path, n: u32, from: u32, to: u32) -> crate::Result<PathBuf> {
        let mut writer = SegmentWriter::new(dir, n, CompressionType::None)?;
        for i in from..to {
            writer.write(Record::new_value(i.to_be_bytes().to_vec(), i.to_be_bytes().to_vec()))?;
        }
        Ok(writer.finish_detached()?.expect("non-empty"))
    }

    #[test]
    fn inject_fills_primary_then_secondary() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let level = Level::new(0, dir.path(), CompressionType::None);

        let a = write_level_file(dir.path(), 0, 0, 10)?;
        assert!(level.inject(a)?.is_none());
        assert_eq!(1, level.files_snapshot().len());

        let b = write_level_file(dir.path(), 0, 10, 20)?;
        let job = level.inject(b)?.expect("second file triggers a merge job");

        assert_eq!(1, job.output_depth);
        assert_eq!(2, job.inputs.len());
        assert!(job.elide_tombstones);

        Ok(())
    }

    #[test]
    fn lookup_prefers_shallower_level() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let level0 = Level::new(0, dir.path(), CompressionType::None);
        let level1 = Level::new(1, dir.path(), CompressionType::None);
        level0.link_next(level1.clone());

        let deep = write_level_file(dir.path(), 1, 0, 5)?;
        level1.inject(deep)?;

        let shallow = write_level_file(dir.path(), 0, 0, 1)?;
        level0.inject(shallow)?;

        let value = level0.lookup(&0u32.to_be_bytes())?.expect("key 0 exists at both levels");
        assert_eq!(0u32.to_be_bytes().to_vec(), &*value);

        let value = level0.lookup(&3u32.to_be_bytes())?.expect("key 3 only at level 1");
        assert_eq!(3u32.to_be_bytes().to_vec(), &*value);

        assert!(level0.lookup(&99u32.to_be_bytes())?.is_none());

        Ok(())
    }

    #[test]
    fn recover_builds_chain_from_directory() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        write_level_file(dir.path(), 0, 0, 5)?;
        write_level_file(dir.path(), 2, 5, 10)?;

        let top = recover(dir.path(), CompressionType::None)?;
        assert_eq!(0, top.depth());

        let level1 = top.next().expect("level 1 exists as a link even though it has no files");
        assert_eq!(1, level1.depth());
        assert!(level1.files_snapshot().is_empty());

        let level2 = level1.next().expect("level 2 exists");
        assert_eq!(2, level2.depth());
        assert_eq!(1, level2.files_snapshot().len());

        Ok(())
    }
}
