// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The public façade. A [`Tree`] is a cheap handle (an `Arc` around shared
//! state) onto a single-writer actor thread: every mutation is serialized
//! through one mailbox, while lookups and folds against the level chain run
//! directly against its lock-protected, immutable files, concurrently with
//! the writer. Split between a façade and its background workers.

use crate::{
    compression::CompressionType,
    config::Config,
    fold::FoldWorker,
    levels::{self, Level, MergeJob},
    merge::{BoxedRecordIter, Merger},
    nursery::{Nursery, NurseryLookup},
    range::{FoldStep, KeyRange, Range},
    segment::OpenMode,
    stop_signal::StopSignal,
    value::{Record, UserKey, UserValue},
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

/// A message sent to the writer actor's single mailbox.
enum Command {
    Put(Record, mpsc::Sender<crate::Result<()>>),
    Lookup(UserKey, mpsc::Sender<NurseryLookup>),
    RecordsInRange(KeyRange, mpsc::Sender<Vec<Record>>),
    Close(mpsc::Sender<()>),
}

/// State shared between every clone of a [`Tree`] handle.
struct Shared {
    top_level: Arc<Level>,
    command_tx: mpsc::Sender<Command>,
    stop_signal: StopSignal,
    fold_timeout: Duration,
    async_chunk_size: usize,
    closed: AtomicBool,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Idempotent: the first caller (whether `Tree::close` or the final
    /// `Arc` being dropped) actually tears the writer down; later callers
    /// no-op.
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.stop_signal.send();

        let (reply_tx, reply_rx) = mpsc::channel();
        if self.command_tx.send(Command::Close(reply_tx)).is_ok() {
            let _ = reply_rx.recv();
        }

        if let Some(handle) = self.writer_handle.lock().expect("lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// An embedded, ordered key-value store backed by an LSM-tree of immutable
/// B-tree level files. Cheaply cloneable; every clone shares one writer.
#[derive(Clone)]
pub struct Tree(Arc<Shared>);

impl Tree {
    /// Opens (or creates) a tree at `config`'s directory, recovering any
    /// existing nursery log and level files.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the directory cannot be created, an existing level
    /// file fails to parse, or the writer thread cannot be spawned.
    pub fn open(config: Config) -> crate::Result<Self> {
        std::fs::create_dir_all(&config.path)?;

        let top_level = levels::recover(&config.path, config.compression)?;

        let mut nursery = match Nursery::recover(&config.path, config.nursery_max)? {
            Some(nursery) => nursery,
            None => Nursery::create_new(&config.path, config.nursery_max)?,
        };

        let stop_signal = StopSignal::default();

        // A crash can leave a recovered nursery log at or past capacity;
        // flush it immediately rather than waiting for the next `put` to
        // notice.
        if nursery.is_full() {
            if let Some(path) = nursery.finish(config.compression)? {
                if let Some(job) = top_level.inject(path)? {
                    spawn_merge_worker(top_level.clone(), job, config.compression, stop_signal.clone());
                }
            }
        }

        let (command_tx, command_rx) = mpsc::channel();

        let actor = WriterActor {
            nursery,
            top_level: top_level.clone(),
            compression: config.compression,
            stop_signal: stop_signal.clone(),
        };

        let writer_handle = std::thread::Builder::new()
            .name("lsm-tree-writer".into())
            .spawn(move || actor.run(&command_rx))?;

        Ok(Self(Arc::new(Shared {
            top_level,
            command_tx,
            stop_signal,
            fold_timeout: config.fold_timeout,
            async_chunk_size: config.async_chunk_size,
            closed: AtomicBool::new(false),
            writer_handle: Mutex::new(Some(writer_handle)),
        })))
    }

    /// Drains in-flight writes, flushes the nursery synchronously, and
    /// refuses further operations. Idempotent; safe to call more than once
    /// or not at all (a [`Tree`]'s last handle closes itself on drop).
    pub fn close(&self) -> crate::Result<()> {
        self.0.shutdown();
        Ok(())
    }

    fn ensure_open(&self) -> crate::Result<()> {
        if self.0.closed.load(Ordering::Acquire) {
            Err(crate::Error::Closed)
        } else {
            Ok(())
        }
    }

    fn send_write(&self, record: Record) -> crate::Result<()> {
        self.ensure_open()?;

        let (reply_tx, reply_rx) = mpsc::channel();

        self.0
            .command_tx
            .send(Command::Put(record, reply_tx))
            .map_err(|_| crate::Error::Closed)?;

        reply_rx.recv().map_err(|_| crate::Error::Closed)?
    }

    /// Inserts or overwrites `key`'s value.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the tree is closed or a flush/merge this put
    /// triggers fails.
    pub fn put<K: Into<UserKey>, V: Into<UserValue>>(&self, key: K, value: V) -> crate::Result<()> {
        self.send_write(Record::new_value(key.into(), value.into()))
    }

    /// Marks `key` as deleted (writes a tombstone).
    ///
    /// # Errors
    ///
    /// Returns `Err` if the tree is closed or a flush/merge this delete
    /// triggers fails.
    pub fn delete<K: Into<UserKey>>(&self, key: K) -> crate::Result<()> {
        self.send_write(Record::new_tombstone(key.into()))
    }

    /// Looks up `key`'s current value, consulting the nursery (via the
    /// writer actor) and then the level chain (directly, lock-free against
    /// the writer).
    ///
    /// # Errors
    ///
    /// Returns `Err` if the tree is closed or a level file is corrupt.
    pub fn lookup(&self, key: impl Into<UserKey>) -> crate::Result<Option<UserValue>> {
        self.ensure_open()?;
        let key = key.into();

        let (reply_tx, reply_rx) = mpsc::channel();
        self.0
            .command_tx
            .send(Command::Lookup(key.clone(), reply_tx))
            .map_err(|_| crate::Error::Closed)?;

        match reply_rx.recv().map_err(|_| crate::Error::Closed)? {
            NurseryLookup::Found(value) => Ok(Some(value)),
            NurseryLookup::FoundTombstone => Ok(None),
            NurseryLookup::NotFound => self.0.top_level.lookup(&key),
        }
    }

    fn new_fold_worker(&self, key_range: &KeyRange) -> crate::Result<FoldWorker> {
        self.ensure_open()?;

        let (reply_tx, reply_rx) = mpsc::channel();
        self.0
            .command_tx
            .send(Command::RecordsInRange(key_range.clone(), reply_tx))
            .map_err(|_| crate::Error::Closed)?;

        let nursery_records = reply_rx.recv().map_err(|_| crate::Error::Closed)?;
        FoldWorker::new(nursery_records, self.0.top_level.clone(), key_range)
    }

    /// Synchronously materializes every `(key, value)` pair in `range`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the tree is closed or a level file is corrupt.
    pub fn range(&self, range: Range) -> crate::Result<Vec<(UserKey, UserValue)>> {
        self.fold_range(range, Vec::new(), |mut acc, key, value| {
            acc.push((key, value));
            acc
        })
    }

    /// Synchronously folds every `(key, value)` pair in `range` through
    /// `fun`. A bounded `range.limit` ends the fold early without error;
    /// unlike [`Tree::async_range`], this never transparently resumes.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the tree is closed or a level file is corrupt.
    pub fn fold_range<A>(
        &self,
        range: Range,
        acc: A,
        mut fun: impl FnMut(A, UserKey, UserValue) -> A,
    ) -> crate::Result<A> {
        let mut worker = self.new_fold_worker(&range.key_range)?;

        let step = worker.fold_chunk(range.limit, acc, |acc, record| {
            fun(acc, record.key.clone(), record.value.clone())
        })?;

        Ok(match step {
            FoldStep::Done(acc) | FoldStep::Limit(acc, _) => acc,
        })
    }

    /// Starts a resumable, chunked fold over `range`, per §4.8's pagination
    /// protocol. The returned [`AsyncFold`] runs its own worker thread so
    /// [`AsyncFold::next_chunk`] can be bounded by the configured fold
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the tree is closed or a level file is corrupt.
    pub fn async_range(&self, range: Range) -> crate::Result<AsyncFold> {
        let worker = self.new_fold_worker(&range.key_range)?;
        let chunk_size = range.limit.unwrap_or(self.0.async_chunk_size).min(self.0.async_chunk_size).max(1);

        let (request_tx, request_rx) = mpsc::channel::<()>();
        let (response_tx, response_rx) = mpsc::channel();
        let stop_signal = self.0.stop_signal.clone();

        std::thread::spawn(move || {
            let mut worker = worker;

            while request_rx.recv().is_ok() {
                if stop_signal.is_stopped() {
                    let _ = response_tx.send(Err(crate::Error::Cancelled));
                    break;
                }

                let step = worker.fold_chunk(Some(chunk_size), Vec::new(), |mut acc, record| {
                    acc.push((record.key.clone(), record.value.clone()));
                    acc
                });

                let is_done = matches!(step, Ok(FoldStep::Done(_)));
                if response_tx.send(step).is_err() || is_done {
                    break;
                }
            }
        });

        Ok(AsyncFold {
            request_tx,
            response_rx,
            timeout: self.0.fold_timeout,
            done: false,
        })
    }
}

/// A resumable, chunked range fold started by [`Tree::async_range`].
pub struct AsyncFold {
    request_tx: mpsc::Sender<()>,
    response_rx: mpsc::Receiver<crate::Result<FoldStep<Vec<(UserKey, UserValue)>>>>,
    timeout: Duration,
    done: bool,
}

impl AsyncFold {
    /// Pulls the next chunk, blocking up to the configured fold timeout.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Timeout`] if no chunk arrives within the
    /// deadline, or [`crate::Error::Cancelled`] if the tree was closed
    /// mid-fold.
    pub fn next_chunk(&mut self) -> crate::Result<FoldStep<Vec<(UserKey, UserValue)>>> {
        if self.done {
            return Ok(FoldStep::Done(Vec::new()));
        }

        self.request_tx.send(()).map_err(|_| crate::Error::Cancelled)?;

        let step = self
            .response_rx
            .recv_timeout(self.timeout)
            .map_err(|_| crate::Error::Timeout)??;

        if matches!(step, FoldStep::Done(_)) {
            self.done = true;
        }

        Ok(step)
    }
}

/// Owns the nursery exclusively and drives the single writer mailbox.
struct WriterActor {
    nursery: Nursery,
    top_level: Arc<Level>,
    compression: CompressionType,
    stop_signal: StopSignal,
}

impl WriterActor {
    fn run(mut self, commands: &mpsc::Receiver<Command>) {
        while let Ok(command) = commands.recv() {
            match command {
                Command::Put(record, reply) => {
                    let result = self.handle_put(record);
                    let _ = reply.send(result);
                }
                Command::Lookup(key, reply) => {
                    let _ = reply.send(self.nursery.lookup(&key));
                }
                Command::RecordsInRange(range, reply) => {
                    let _ = reply.send(self.nursery.records_in_range(&range));
                }
                Command::Close(reply) => {
                    self.handle_close();
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    fn handle_put(&mut self, record: Record) -> crate::Result<()> {
        self.nursery.add(record.key, record.value, record.value_type)?;

        if self.nursery.is_full() {
            if let Some(path) = self.nursery.finish(self.compression)? {
                self.absorb(0, path)?;
            }
        }

        Ok(())
    }

    fn handle_close(&mut self) {
        if !self.nursery.is_empty() {
            match self.nursery.finish(self.compression) {
                Ok(Some(path)) => {
                    if let Err(e) = self.absorb(0, path) {
                        log::error!("failed to absorb final nursery flush on close: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => log::error!("final nursery flush on close failed: {e}"),
            }
        }
    }

    fn level_at_depth(&self, depth: u32) -> Arc<Level> {
        let mut level = self.top_level.clone();

        while level.depth() < depth {
            level = level.next_or_create();
        }

        level
    }

    /// Injects `path` into the level at `depth`, spawning a background
    /// worker to run the resulting merge (and any merges it cascades into)
    /// if the injection filled that level's file bag.
    fn absorb(&self, depth: u32, path: std::path::PathBuf) -> crate::Result<()> {
        let level = self.level_at_depth(depth);

        if let Some(job) = level.inject(path)? {
            spawn_merge_worker(level, job, self.compression, self.stop_signal.clone());
        }

        Ok(())
    }
}

/// Spawns the background worker that runs `job` (and cascades into deeper
/// levels as each merge's output itself fills a file bag): a free function
/// taking the inputs it needs by value. Every state change it makes (`Level::inject`/
/// `complete_merge`) is already safe to call from any thread, so it reports
/// nothing back to the writer actor beyond log lines.
fn spawn_merge_worker(
    mut source_level: Arc<Level>,
    mut job: MergeJob,
    compression: CompressionType,
    stop_signal: StopSignal,
) {
    std::thread::spawn(move || {
        loop {
            if stop_signal.is_stopped() {
                log::debug!("stopping before merge into level {} because of stop signal", job.output_depth);
                return;
            }

            let output_depth = job.output_depth;
            let output_level = source_level.next_or_create();

            match run_merge(&job, output_depth, output_level.dir(), compression) {
                Ok(Some(output_path)) => match output_level.inject(output_path) {
                    Ok(next_job) => {
                        source_level.complete_merge();
                        log::debug!("merge into level {output_depth} committed");

                        match next_job {
                            Some(job2) => {
                                source_level = output_level;
                                job = job2;
                            }
                            None => return,
                        }
                    }
                    Err(e) => {
                        log::warn!("failed to commit merge output into level {output_depth}: {e}");
                        return;
                    }
                },
                Ok(None) => {
                    // every input record was an elided tombstone
                    source_level.complete_merge();
                    log::debug!("merge into level {output_depth} produced no surviving records");
                    return;
                }
                Err(e) => {
                    log::warn!("merge into level {output_depth} failed: {e}");
                    return;
                }
            }
        }
    });
}

/// Performs one `job`'s k-way merge and writes its (unplaced) output file.
/// Within a level's file bag, a higher index in `job.inputs` is the more
/// recently injected (and so newer) file; ties during the merge favor it.
fn run_merge(
    job: &MergeJob,
    output_depth: u32,
    dir: &std::path::Path,
    compression: CompressionType,
) -> crate::Result<Option<std::path::PathBuf>> {
    let mut sources: Vec<BoxedRecordIter<'static>> = Vec::with_capacity(job.inputs.len());
    let mut ranks = Vec::with_capacity(job.inputs.len());

    for (idx, segment) in job.inputs.iter().enumerate() {
        let mut reader = segment.reader(OpenMode::Sequential)?;
        let mut records = reader.first_leaf()?;

        loop {
            match reader.next_leaf()? {
                Some(mut next) => records.append(&mut next),
                None => break,
            }
        }

        sources.push(Box::new(records.into_iter().map(Ok)));

        #[allow(clippy::cast_possible_truncation)]
        let rank = (job.inputs.len() - 1 - idx) as u32;
        ranks.push((0u32, rank));
    }

    let merger = Merger::new(sources, ranks, job.elide_tombstones);

    let mut writer = crate::segment::SegmentWriter::new(dir, output_depth, compression)?;
    for record in merger {
        writer.write(record?)?;
    }

    writer.finish_detached()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn put_then_lookup() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let tree = Config::new(dir.path()).open()?;

        tree.put(b"a".to_vec(), b"1".to_vec())?;
        assert_eq!(Some(b"1".to_vec().into()), tree.lookup(b"a".to_vec())?);
        assert_eq!(None, tree.lookup(b"missing".to_vec())?);

        Ok(())
    }

    #[test]
    fn delete_shadows_earlier_put() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let tree = Config::new(dir.path()).open()?;

        tree.put(b"a".to_vec(), b"1".to_vec())?;
        tree.delete(b"a".to_vec())?;

        assert_eq!(None, tree.lookup(b"a".to_vec())?);

        Ok(())
    }

    #[test]
    fn nursery_flush_survives_and_is_still_readable() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let tree = Config::new(dir.path()).nursery_max(8).open()?;

        for i in 0u32..64 {
            tree.put(i.to_be_bytes().to_vec(), i.to_le_bytes().to_vec())?;
        }

        for i in 0u32..64 {
            assert_eq!(Some(i.to_le_bytes().to_vec().into()), tree.lookup(i.to_be_bytes().to_vec())?);
        }

        Ok(())
    }

    #[test]
    fn range_returns_every_pair_in_order() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let tree = Config::new(dir.path()).nursery_max(8).open()?;

        for i in 0u32..40 {
            tree.put(i.to_be_bytes().to_vec(), i.to_le_bytes().to_vec())?;
        }

        let pairs = tree.range(Range::full())?;
        assert_eq!(40, pairs.len());

        for (i, (key, value)) in pairs.iter().enumerate() {
            assert_eq!(&(i as u32).to_be_bytes()[..], &**key);
            assert_eq!(&(i as u32).to_le_bytes()[..], &**value);
        }

        Ok(())
    }

    #[test]
    fn async_range_resumes_across_chunks() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let tree = Config::new(dir.path()).nursery_max(1_000).async_chunk_size(5).open()?;

        for i in 0u32..23 {
            tree.put(i.to_be_bytes().to_vec(), i.to_le_bytes().to_vec())?;
        }

        let mut fold = tree.async_range(Range::full())?;
        let mut collected = Vec::new();

        loop {
            match fold.next_chunk()? {
                FoldStep::Done(mut chunk) => {
                    collected.append(&mut chunk);
                    break;
                }
                FoldStep::Limit(mut chunk, _) => collected.append(&mut chunk),
            }
        }

        assert_eq!(23, collected.len());

        Ok(())
    }

    #[test]
    fn closed_tree_refuses_new_writes() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let tree = Config::new(dir.path()).open()?;

        tree.put(b"a".to_vec(), b"1".to_vec())?;
        tree.close()?;

        assert!(matches!(tree.put(b"b".to_vec(), b"2".to_vec()), Err(crate::Error::Closed)));

        Ok(())
    }

    #[test]
    fn recovering_an_overfull_nursery_flushes_it_immediately() -> crate::Result<()> {
        use crate::value::ValueType;

        let dir = tempfile::tempdir()?;

        // Simulate a crash that left the nursery log at capacity without
        // ever going through the actor's `handle_put` flush check.
        let mut nursery = Nursery::create_new(dir.path(), 4)?;
        for i in 0u32..4 {
            nursery.add(i.to_be_bytes().to_vec().into(), i.to_le_bytes().to_vec().into(), ValueType::Value)?;
        }
        drop(nursery);

        let tree = Config::new(dir.path()).nursery_max(4).open()?;

        for i in 0u32..4 {
            assert_eq!(Some(i.to_le_bytes().to_vec().into()), tree.lookup(i.to_be_bytes().to_vec())?);
        }

        // Nothing left for close to flush; the overfull recovery already did it.
        tree.close()?;

        Ok(())
    }

    #[test]
    fn reopen_recovers_prior_state() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let tree = Config::new(dir.path()).nursery_max(8).open()?;
            for i in 0u32..30 {
                tree.put(i.to_be_bytes().to_vec(), i.to_le_bytes().to_vec())?;
            }
            tree.close()?;
        }

        let tree = Config::new(dir.path()).nursery_max(8).open()?;
        for i in 0u32..30 {
            assert_eq!(Some(i.to_le_bytes().to_vec().into()), tree.lookup(i.to_be_bytes().to_vec())?);
        }

        Ok(())
    }
}
