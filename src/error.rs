// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};
use std::path::PathBuf;

/// Represents errors that can occur in the LSM-tree
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// A level file's on-disk layout failed to parse
    Corrupt(PathBuf, String),

    /// Operation was attempted after the tree was closed
    Closed,

    /// A fold chunk was not received within the configured deadline
    Timeout,

    /// A fold was aborted by `close`
    Cancelled,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O failure: {e}"),
            Self::Encode(e) => write!(f, "encode failure: {e}"),
            Self::Decode(e) => write!(f, "decode failure: {e}"),
            Self::Corrupt(path, detail) => {
                write!(f, "corrupt level file {}: {detail}", path.display())
            }
            Self::Closed => write!(f, "tree is closed"),
            Self::Timeout => write!(f, "fold chunk receive timed out"),
            Self::Cancelled => write!(f, "fold was cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Corrupt(..) | Self::Closed | Self::Timeout | Self::Cancelled => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}
