// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, ordered key-value storage engine built as a log-structured
//! merge-tree of immutable B-tree level files.
//!
//! Writes go through a single writer actor: inserts land in an in-memory
//! nursery backed by a write-ahead log, and are flushed to a level-0 file
//! once the nursery fills up. Level files are merged pairwise into deeper
//! levels on background threads as each level's file bag fills. Point
//! lookups and range folds over already-materialized level files run
//! concurrently with the writer.
//!
//! # Example
//!
//! ```
//! use lsm_tree::Config;
//!
//! # let dir = tempfile::tempdir()?;
//! let tree = Config::new(dir.path()).open()?;
//!
//! tree.put(b"a".to_vec(), b"hello".to_vec())?;
//! assert_eq!(Some(b"hello".to_vec().into()), tree.lookup(b"a".to_vec())?);
//!
//! tree.delete(b"a".to_vec())?;
//! assert_eq!(None, tree.lookup(b"a".to_vec())?);
//! #
//! # Ok::<(), lsm_tree::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::option_if_let_else)]

mod block;
mod bloom;
mod coding;
mod compression;
mod config;
mod error;
mod fold;
mod levels;
mod merge;
mod nursery;
mod range;
mod segment;
mod slice;
mod stop_signal;
mod tree;
mod value;

pub use compression::CompressionType;
pub use config::Config;
pub use error::Error;
pub use range::{FoldStep, KeyRange, Range};
pub use slice::Slice;
pub use tree::{AsyncFold, Tree};
pub use value::{UserKey, UserValue, ValueType};

/// Result alias for all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;
