// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
pub type UserValue = Slice;

/// Value type (regular value or tombstone)
///
/// A tombstone shadows any value for the same key found in a deeper
/// source (nursery over level 0 over level 1 over ...).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueType {
    /// Existing value
    Value,

    /// Deleted value
    Tombstone,
}

impl TryFrom<u8> for ValueType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Value),
            1 => Ok(Self::Tombstone),
            other => Err(other),
        }
    }
}

impl From<ValueType> for u8 {
    fn from(value: ValueType) -> Self {
        match value {
            ValueType::Value => 0,
            ValueType::Tombstone => 1,
        }
    }
}

/// A single (key, value) pair as it flows through the nursery, level
/// files, and the merge pipeline.
///
/// `value` is meaningless (and empty) when `value_type` is
/// [`ValueType::Tombstone`].
#[derive(Clone, Eq)]
pub struct Record {
    /// The user-supplied key
    pub key: UserKey,

    /// The user-supplied value, or empty for a tombstone
    pub value: UserValue,

    /// Whether this record is a live value or a deletion marker
    pub value_type: ValueType,
}

impl Record {
    /// Creates a new live value record.
    #[must_use]
    pub fn new_value<K: Into<UserKey>, V: Into<UserValue>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            value_type: ValueType::Value,
        }
    }

    /// Creates a new tombstone record.
    #[must_use]
    pub fn new_tombstone<K: Into<UserKey>>(key: K) -> Self {
        Self {
            key: key.into(),
            value: UserValue::empty(),
            value_type: ValueType::Tombstone,
        }
    }

    /// Returns `true` if this record is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value_type == ValueType::Tombstone
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.key.cmp(&other.key))
    }
}

// Order by key only -- within one level file, keys are unique and
// strictly increasing, so ordering by key is the whole contract.
impl Ord for Record {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_tombstone() {
            write!(f, "{:?} => <tombstone>", self.key)
        } else {
            write!(f, "{:?} => {:?}", self.key, self.value)
        }
    }
}
