// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Key ranges and the discriminated result of a paginated range fold.

use crate::value::UserKey;

/// A half-open-or-closed interval of keys, per the `from_inclusive` /
/// `to_inclusive` flags. A missing bound is unbounded on that side.
#[derive(Clone, Debug, Default)]
pub struct KeyRange {
    /// Lower bound, or unbounded if `None`
    pub from_key: Option<UserKey>,

    /// Whether `from_key` itself is included
    pub from_inclusive: bool,

    /// Upper bound, or unbounded if `None`
    pub to_key: Option<UserKey>,

    /// Whether `to_key` itself is included
    pub to_inclusive: bool,
}

impl KeyRange {
    /// The unbounded range `(-inf, +inf)`.
    #[must_use]
    pub fn full() -> Self {
        Self::default()
    }

    /// Constructs `[from, to)`.
    #[must_use]
    pub fn new<K: Into<UserKey>>(from: K, to: K) -> Self {
        Self {
            from_key: Some(from.into()),
            from_inclusive: true,
            to_key: Some(to.into()),
            to_inclusive: false,
        }
    }

    /// Returns `true` if `key` lies within this range.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        if let Some(from) = &self.from_key {
            match (self.from_inclusive, key.cmp(&**from)) {
                (true, std::cmp::Ordering::Less) => return false,
                (false, std::cmp::Ordering::Less | std::cmp::Ordering::Equal) => return false,
                _ => {}
            }
        }

        if let Some(to) = &self.to_key {
            match (self.to_inclusive, key.cmp(&**to)) {
                (true, std::cmp::Ordering::Greater) => return false,
                (false, std::cmp::Ordering::Greater | std::cmp::Ordering::Equal) => return false,
                _ => {}
            }
        }

        true
    }

    /// Returns `true` once `key` has moved strictly past the upper bound,
    /// i.e. iteration may stop.
    #[must_use]
    pub fn is_past_upper_bound(&self, key: &[u8]) -> bool {
        let Some(to) = &self.to_key else { return false };

        match key.cmp(&**to) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => !self.to_inclusive,
            std::cmp::Ordering::Less => false,
        }
    }

    /// Returns a copy of this range with the lower bound advanced to
    /// `(key, inclusive=true)`, used to resume a paginated fold.
    #[must_use]
    pub fn resume_from(&self, key: UserKey) -> Self {
        Self {
            from_key: Some(key),
            from_inclusive: true,
            to_key: self.to_key.clone(),
            to_inclusive: self.to_inclusive,
        }
    }
}

/// A bounded range query: a key interval plus an optional result-count cap.
#[derive(Clone, Debug, Default)]
pub struct Range {
    /// The key interval to scan
    pub key_range: KeyRange,

    /// Maximum number of results to return, or unbounded if `None`
    pub limit: Option<usize>,
}

impl Range {
    /// Constructs an unbounded full-range query.
    #[must_use]
    pub fn full() -> Self {
        Self::default()
    }
}

/// The terminal outcome of a (possibly partial) range fold.
#[derive(Debug)]
pub enum FoldStep<A> {
    /// The scan reached its end (either the range's upper bound or EOF).
    Done(A),

    /// The configured chunk limit was reached; resume with `next_key` as
    /// the new inclusive lower bound.
    Limit(A, UserKey),
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn full_range_contains_everything() {
        let range = KeyRange::full();
        assert!(range.contains(b"anything"));
        assert!(!range.is_past_upper_bound(b"anything"));
    }

    #[test]
    fn half_open_bounds() {
        let range = KeyRange::new(b"b".to_vec(), b"d".to_vec());
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(!range.contains(b"d"));
        assert!(range.is_past_upper_bound(b"d"));
        assert!(!range.is_past_upper_bound(b"c"));
    }

    #[test]
    fn inclusive_to_bound() {
        let range = KeyRange {
            from_key: None,
            from_inclusive: true,
            to_key: Some(b"d".to_vec().into()),
            to_inclusive: true,
        };
        assert!(range.contains(b"d"));
        assert!(!range.is_past_upper_bound(b"d"));
        assert!(range.is_past_upper_bound(b"e"));
    }
}
