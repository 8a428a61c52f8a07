// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Encodes and decodes a single node block (leaf or inner) of a level file.
//!
//! Wire format: `length:u32 || level:u16 || body[length - 2]`, big-endian.
//! A `length` of zero is the sentinel "no further block" used by
//! sequential iteration ([`read_block_header`]).

use crate::{
    coding::DecodeError,
    value::{Record, UserKey, UserValue, ValueType},
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// `level = 0` marks a leaf.
pub const LEAF_LEVEL: u16 = 0;

/// A pointer to a child block: its offset and byte length within the file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHandle {
    /// Byte offset of the child block from the start of the file
    pub offset: u64,

    /// Byte length of the child block, including its own header
    pub size: u32,
}

/// An inner-node entry: the smallest key reachable through `child`.
#[derive(Clone, Debug)]
pub struct InnerEntry {
    /// Smallest key reachable through `child`
    pub separator: UserKey,

    /// Pointer to the child block
    pub child: BlockHandle,
}

/// A decoded node block.
#[derive(Clone, Debug)]
pub enum Block {
    /// A leaf holding a sorted run of records
    Leaf(Vec<Record>),

    /// An inner node holding a sorted run of (separator, child) entries.
    /// `level` is the node's height above the leaves (always >= 1).
    Inner { level: u16, entries: Vec<InnerEntry> },
}

impl Block {
    /// The `level` field this block would be written with.
    #[must_use]
    pub fn level(&self) -> u16 {
        match self {
            Self::Leaf(_) => LEAF_LEVEL,
            Self::Inner { level, .. } => *level,
        }
    }

    /// Serializes the block's body (everything after the `level` field).
    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();

        match self {
            Self::Leaf(records) => {
                for record in records {
                    #[allow(clippy::cast_possible_truncation)]
                    body.write_u32::<BigEndian>(record.key.len() as u32)
                        .expect("writing to a Vec cannot fail");
                    body.write_all(&record.key)
                        .expect("writing to a Vec cannot fail");

                    body.write_u8(u8::from(record.value_type))
                        .expect("writing to a Vec cannot fail");

                    #[allow(clippy::cast_possible_truncation)]
                    body.write_u32::<BigEndian>(record.value.len() as u32)
                        .expect("writing to a Vec cannot fail");
                    body.write_all(&record.value)
                        .expect("writing to a Vec cannot fail");
                }
            }
            Self::Inner { entries, .. } => {
                for entry in entries {
                    #[allow(clippy::cast_possible_truncation)]
                    body.write_u32::<BigEndian>(entry.separator.len() as u32)
                        .expect("writing to a Vec cannot fail");
                    body.write_all(&entry.separator)
                        .expect("writing to a Vec cannot fail");

                    body.write_u64::<BigEndian>(entry.child.offset)
                        .expect("writing to a Vec cannot fail");
                    body.write_u32::<BigEndian>(entry.child.size)
                        .expect("writing to a Vec cannot fail");
                }
            }
        }

        body
    }

    /// Writes `length:u32 || level:u16 || body` to `writer`, returning the
    /// number of bytes written.
    pub fn encode_into<W: Write>(&self, writer: &mut W) -> Result<usize, crate::coding::EncodeError> {
        let body = self.encode_body();

        // NOTE: +2 for the level field that the length covers
        #[allow(clippy::cast_possible_truncation)]
        let length = (body.len() + 2) as u32;

        writer.write_u32::<BigEndian>(length)?;
        writer.write_u16::<BigEndian>(self.level())?;
        writer.write_all(&body)?;

        Ok(4 + body.len() + 2)
    }

    /// Decodes a block whose header (`length`, `level`) has already been
    /// consumed, given the remaining `body_len = length - 2` bytes.
    fn decode_body<R: Read>(
        reader: &mut R,
        level: u16,
        body_len: usize,
    ) -> Result<Self, DecodeError> {
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body)?;
        let mut cursor = std::io::Cursor::new(body);

        if level == LEAF_LEVEL {
            let mut records = Vec::new();

            while (cursor.position() as usize) < cursor.get_ref().len() {
                let klen = cursor.read_u32::<BigEndian>()? as usize;
                let mut key = vec![0u8; klen];
                cursor.read_exact(&mut key)?;

                let vtag = cursor.read_u8()?;
                let value_type = ValueType::try_from(vtag)
                    .map_err(|tag| DecodeError::InvalidTag(("ValueType", tag)))?;

                let vlen = cursor.read_u32::<BigEndian>()? as usize;
                let mut value = vec![0u8; vlen];
                cursor.read_exact(&mut value)?;

                records.push(Record {
                    key: key.into(),
                    value: value.into(),
                    value_type,
                });
            }

            Ok(Self::Leaf(records))
        } else {
            let mut entries = Vec::new();

            while (cursor.position() as usize) < cursor.get_ref().len() {
                let klen = cursor.read_u32::<BigEndian>()? as usize;
                let mut key = vec![0u8; klen];
                cursor.read_exact(&mut key)?;

                let offset = cursor.read_u64::<BigEndian>()?;
                let size = cursor.read_u32::<BigEndian>()?;

                entries.push(InnerEntry {
                    separator: key.into(),
                    child: BlockHandle { offset, size },
                });
            }

            Ok(Self::Inner { level, entries })
        }
    }
}

/// Result of reading a block header: either the next block's `level` and
/// body length, or [`None`] for the `length = 0` end-of-sequence sentinel.
pub fn read_block_header<R: Read>(reader: &mut R) -> Result<Option<(u16, usize)>, DecodeError> {
    let length = reader.read_u32::<BigEndian>()?;

    if length == 0 {
        return Ok(None);
    }

    if length < 2 {
        return Err(DecodeError::InvalidHeader("block length shorter than level field"));
    }

    let level = reader.read_u16::<BigEndian>()?;
    let body_len = (length - 2) as usize;

    Ok(Some((level, body_len)))
}

/// Reads one full block (header + body) from `reader`, or `None` at the
/// end-of-sequence sentinel.
pub fn decode_block<R: Read>(reader: &mut R) -> Result<Option<Block>, DecodeError> {
    match read_block_header(reader)? {
        None => Ok(None),
        Some((level, body_len)) => Block::decode_body(reader, level, body_len).map(Some),
    }
}

/// Writes the `length = 0` end-of-sequence sentinel.
pub fn write_eof_marker<W: Write>(writer: &mut W) -> Result<(), std::io::Error> {
    writer.write_u32::<BigEndian>(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn leaf_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let block = Block::Leaf(vec![
            Record::new_value(b"a".to_vec(), b"1".to_vec()),
            Record::new_tombstone(b"b".to_vec()),
            Record::new_value(b"c".to_vec(), vec![]),
        ]);

        let mut buf = Vec::new();
        block.encode_into(&mut buf)?;

        let decoded = decode_block(&mut std::io::Cursor::new(buf))?.expect("not eof");

        let Block::Leaf(records) = decoded else {
            panic!("expected a leaf block");
        };

        assert_eq!(3, records.len());
        assert_eq!(&*records[0].key, b"a");
        assert_eq!(&*records[0].value, b"1");
        assert!(records[1].is_tombstone());
        assert_eq!(&*records[2].key, b"c");
        assert!(records[2].value.is_empty());

        Ok(())
    }

    #[test]
    fn inner_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let block = Block::Inner {
            level: 1,
            entries: vec![
                InnerEntry {
                    separator: b"a".to_vec().into(),
                    child: BlockHandle { offset: 0, size: 40 },
                },
                InnerEntry {
                    separator: b"m".to_vec().into(),
                    child: BlockHandle { offset: 40, size: 55 },
                },
            ],
        };

        let mut buf = Vec::new();
        block.encode_into(&mut buf)?;

        let decoded = decode_block(&mut std::io::Cursor::new(buf))?.expect("not eof");

        let Block::Inner { level, entries } = decoded else {
            panic!("expected an inner block");
        };

        assert_eq!(1, level);
        assert_eq!(2, entries.len());
        assert_eq!(&*entries[1].separator, b"m");
        assert_eq!(40, entries[1].child.offset);

        Ok(())
    }

    #[test]
    fn eof_sentinel() -> Result<(), Box<dyn std::error::Error>> {
        let mut buf = Vec::new();
        write_eof_marker(&mut buf)?;

        let decoded = decode_block(&mut std::io::Cursor::new(buf))?;
        assert!(decoded.is_none());

        Ok(())
    }

    #[test]
    fn corrupt_short_header() {
        let buf = vec![0, 0, 0, 1]; // length=1, shorter than the level field
        let err = decode_block(&mut std::io::Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidHeader(_)));
    }
}
