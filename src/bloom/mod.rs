// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod bit_array;

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    compression::CompressionType,
};
use bit_array::BitArray;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const MAGIC_BYTES: [u8; 4] = [b'B', b'L', b'O', b'M'];

/// Two hashes that are used for double hashing
pub type CompositeHash = (u64, u64);

/// A standard bloom filter.
///
/// Uses double hashing instead of `k` distinct hash functions, deriving
/// both lanes from a single 128-bit content hash, see:
/// <https://fjall-rs.github.io/post/bloom-filter-hash-sharing>
#[derive(Debug, Eq, PartialEq)]
pub struct BloomFilter {
    inner: BitArray,

    /// Bit count
    m: usize,

    /// Number of hash rounds
    k: usize,
}

impl Encode for BloomFilter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;
        writer.write_u64::<BigEndian>(self.m as u64)?;
        writer.write_u64::<BigEndian>(self.k as u64)?;
        writer.write_all(self.inner.bytes())?;
        Ok(())
    }
}

impl Decode for BloomFilter {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("BloomFilter"));
        }

        let m = reader.read_u64::<BigEndian>()? as usize;
        let k = reader.read_u64::<BigEndian>()? as usize;

        let mut bytes = vec![0; m / 8];
        reader.read_exact(&mut bytes)?;

        Ok(Self {
            inner: BitArray::from_bytes(bytes.into_boxed_slice()),
            m,
            k,
        })
    }
}

impl BloomFilter {
    /// Constructs a bloom filter sized for `n` items at false-positive rate
    /// `fpr` (clamped to a sensible minimum).
    #[must_use]
    pub fn with_fp_rate(n: usize, fpr: f32) -> Self {
        use std::f32::consts::LN_2;

        assert!(n > 0);

        let fpr = fpr.max(0.000_001);
        let m = Self::calculate_m(n, fpr);
        let bpk = m / n.max(1);
        let k = (((bpk as f32) * LN_2) as usize).max(1);

        Self {
            inner: BitArray::with_capacity(m / 8),
            m,
            k,
        }
    }

    fn calculate_m(n: usize, fp_rate: f32) -> usize {
        use std::f32::consts::LN_2;

        let n = n as f32;
        let ln2_squared = LN_2.powi(2);
        let numerator = n * fp_rate.ln();
        let m = -(numerator / ln2_squared);

        // Round up to the next byte
        (((m / 8.0).ceil()) * 8.0) as usize
    }

    /// Serializes, then applies `compression` to, this filter's bytes.
    #[must_use]
    pub fn serialize_compressed(&self, compression: CompressionType) -> Vec<u8> {
        compression.compress(&self.encode_into_vec())
    }

    /// Reverses [`BloomFilter::serialize_compressed`].
    pub fn deserialize_compressed(
        bytes: &[u8],
        compression: CompressionType,
    ) -> crate::Result<Self> {
        let raw = compression.decompress(bytes)?;
        Ok(Self::decode_from(&mut std::io::Cursor::new(raw))?)
    }

    /// Returns `true` if the key may be contained. Never has a false
    /// negative.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.contains_hash(Self::get_hash(key))
    }

    /// Hash variant of [`BloomFilter::contains`].
    #[must_use]
    pub fn contains_hash(&self, (mut h1, mut h2): CompositeHash) -> bool {
        for i in 0..(self.k as u64) {
            let idx = h1 % (self.m as u64);

            if !self.inner.get(idx as usize) {
                return false;
            }

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_add(i);
        }

        true
    }

    /// Adds `key` to the filter.
    pub fn insert(&mut self, key: &[u8]) {
        self.set_with_hash(Self::get_hash(key));
    }

    /// Hash variant of [`BloomFilter::insert`].
    pub fn set_with_hash(&mut self, (mut h1, mut h2): CompositeHash) {
        for i in 0..(self.k as u64) {
            let idx = h1 % (self.m as u64);
            self.inner.enable(idx as usize);

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_add(i);
        }
    }

    /// Computes the composite hash of `key`.
    #[must_use]
    pub fn get_hash(key: &[u8]) -> CompositeHash {
        let h0 = xxhash_rust::xxh3::xxh3_128(key);
        let h1 = (h0 >> 64) as u64;
        let h2 = h0 as u64;
        (h1, h2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn bloom_basic() {
        let mut filter = BloomFilter::with_fp_rate(10, 0.0001);

        for key in [b"item0", b"item1", b"item2"] {
            assert!(!filter.contains(key));
            filter.insert(key);
            assert!(filter.contains(key));
        }
    }

    #[test]
    fn bloom_serde_round_trip() -> crate::Result<()> {
        let mut filter = BloomFilter::with_fp_rate(10, 0.0001);

        for key in [b"item0", b"item1", b"item2"] {
            filter.insert(key);
        }

        let serialized = filter.serialize_compressed(CompressionType::None);
        let decoded = BloomFilter::deserialize_compressed(&serialized, CompressionType::None)?;

        for key in [b"item0", b"item1", b"item2"] {
            assert!(decoded.contains(key));
        }

        Ok(())
    }

    #[test]
    fn bloom_fpr() {
        let item_count = 10_000;
        let wanted_fpr = 0.01;

        let mut filter = BloomFilter::with_fp_rate(item_count, wanted_fpr);

        for key in (0..item_count).map(|_| nanoid::nanoid!()) {
            filter.insert(key.as_bytes());
        }

        let mut false_positives = 0;

        for key in (0..1_000).map(|_| nanoid::nanoid!()) {
            if filter.contains(key.as_bytes()) {
                false_positives += 1;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let fpr = false_positives as f32 / 1_000.0;
        assert!(fpr < 0.05);
    }
}
