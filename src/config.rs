// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{compression::CompressionType, nursery::NURSERY_MAX, tree::Tree};
use std::{path::{Path, PathBuf}, time::Duration};

/// Default number of records folded into one chunk of an asynchronous
/// range query before control returns to the caller.
pub const ASYNC_CHUNK_SIZE: usize = 100;

/// Default time a fold worker waits for its next chunk request before
/// giving up with [`crate::Error::Timeout`].
const DEFAULT_FOLD_TIMEOUT: Duration = Duration::from_secs(3);

/// Tree configuration builder.
#[derive(Clone, Debug)]
pub struct Config {
    /// Folder path
    #[doc(hidden)]
    pub path: PathBuf,

    /// What type of compression is used for level files' bloom filters
    pub compression: CompressionType,

    /// Maximum number of records the nursery holds before it is flushed
    pub nursery_max: usize,

    /// Number of records an asynchronous range fold emits per chunk
    pub async_chunk_size: usize,

    /// How long a fold worker waits for its next chunk request
    pub fold_timeout: Duration,
}

impl Config {
    /// Initializes a new config rooted at `path`.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            compression: CompressionType::default(),
            nursery_max: NURSERY_MAX,
            async_chunk_size: ASYNC_CHUNK_SIZE,
            fold_timeout: DEFAULT_FOLD_TIMEOUT,
        }
    }

    /// Sets the compression method used for level files' bloom filters.
    ///
    /// Defaults to [`CompressionType::None`].
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the nursery's record count bound before it is flushed to a
    /// level-0 file.
    ///
    /// Defaults to [`NURSERY_MAX`].
    #[must_use]
    pub fn nursery_max(mut self, n: usize) -> Self {
        self.nursery_max = n;
        self
    }

    /// Sets the chunk size an asynchronous range fold emits per step.
    ///
    /// Defaults to [`ASYNC_CHUNK_SIZE`].
    #[must_use]
    pub fn async_chunk_size(mut self, n: usize) -> Self {
        self.async_chunk_size = n;
        self
    }

    /// Sets how long a fold worker waits for its next chunk request before
    /// giving up with [`crate::Error::Timeout`].
    ///
    /// Defaults to 3 seconds.
    #[must_use]
    pub fn fold_timeout(mut self, timeout: Duration) -> Self {
        self.fold_timeout = timeout;
        self
    }

    /// Opens a tree using this config, recovering any existing directory
    /// contents.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the directory cannot be created or an existing
    /// level file fails to parse.
    pub fn open(self) -> crate::Result<Tree> {
        Tree::open(self)
    }
}
