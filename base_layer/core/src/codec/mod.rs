// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! The consensus byte codec shared by the disk and wire formats.
//!
//! All integers are little-endian. Integers that are usually small use the Bitcoin serialized
//! VARINT (base-128, most-significant group first, continuation bit, minus-one bias per
//! continuation byte). Vector lengths use the compact-size prefix (0xFD u16 / 0xFE u32 /
//! 0xFF u64). Hashes are fixed 32 bytes.

use epic_common_types::Hash;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unexpected end of data (wanted {wanted} more bytes, {remaining} left)")]
    UnexpectedEof { wanted: usize, remaining: usize },
    #[error("Non-canonical compact size")]
    NonCanonicalCompactSize,
    #[error("Varint overflows 64 bits")]
    VarIntOverflow,
    #[error("Invalid field: {0}")]
    InvalidField(&'static str),
}

/// Types that can write themselves in the consensus encoding.
pub trait Encodable {
    fn encode_into(&self, buf: &mut Vec<u8>);

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }
}

/// Types that can read themselves back from the consensus encoding.
pub trait Decodable: Sized {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError>;

    /// Decode from a complete buffer, requiring every byte to be consumed.
    fn decode_exact(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let value = Self::decode(&mut reader)?;
        if !reader.is_empty() {
            return Err(CodecError::InvalidField("trailing bytes"));
        }
        Ok(value)
    }
}

/// Cursor over a byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                wanted: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, CodecError> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn read_hash(&mut self) -> Result<Hash, CodecError> {
        let bytes = self.take(Hash::SIZE)?;
        Ok(Hash::try_from_slice(bytes).expect("32 bytes"))
    }

    pub fn read_compact_size(&mut self) -> Result<u64, CodecError> {
        let first = self.read_u8()?;
        let value = match first {
            0xFD => {
                let v = u64::from(self.read_u16()?);
                if v < 0xFD {
                    return Err(CodecError::NonCanonicalCompactSize);
                }
                v
            },
            0xFE => {
                let v = u64::from(self.read_u32()?);
                if v <= u64::from(u16::MAX) {
                    return Err(CodecError::NonCanonicalCompactSize);
                }
                v
            },
            0xFF => {
                let v = self.read_u64()?;
                if v <= u64::from(u32::MAX) {
                    return Err(CodecError::NonCanonicalCompactSize);
                }
                v
            },
            v => u64::from(v),
        };
        Ok(value)
    }

    /// Bitcoin serialized VARINT: 7 bits per byte, most significant group first, high bit set on
    /// every byte except the last, and each continuation adds one.
    pub fn read_var_int(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        loop {
            let byte = self.read_u8()?;
            if value > (u64::MAX >> 7) {
                return Err(CodecError::VarIntOverflow);
            }
            value = (value << 7) | u64::from(byte & 0x7F);
            if byte & 0x80 != 0 {
                if value == u64::MAX {
                    return Err(CodecError::VarIntOverflow);
                }
                value += 1;
            } else {
                return Ok(value);
            }
        }
    }

    /// A compact-size-prefixed byte blob.
    pub fn read_sized_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_compact_size()?;
        let len = usize::try_from(len).map_err(|_| CodecError::InvalidField("blob length"))?;
        self.read_bytes(len)
    }

    pub fn read_vec<T: Decodable>(&mut self) -> Result<Vec<T>, CodecError> {
        let len = self.read_compact_size()?;
        // guard against absurd prefixes before allocating
        let cap = std::cmp::min(len as usize, 1 + self.remaining());
        let mut items = Vec::with_capacity(cap);
        for _ in 0..len {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }
}

/// Little-endian write helpers over `Vec<u8>`.
pub trait WriteExt {
    fn put_u8(&mut self, v: u8);
    fn put_u16(&mut self, v: u16);
    fn put_u32(&mut self, v: u32);
    fn put_u64(&mut self, v: u64);
    fn put_hash(&mut self, h: &Hash);
    fn put_compact_size(&mut self, n: u64);
    fn put_var_int(&mut self, n: u64);
    fn put_sized_bytes(&mut self, bytes: &[u8]);
    fn put_vec<T: Encodable>(&mut self, items: &[T]);
}

impl WriteExt for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_hash(&mut self, h: &Hash) {
        self.extend_from_slice(h.as_bytes());
    }

    fn put_compact_size(&mut self, n: u64) {
        if n < 0xFD {
            self.put_u8(n as u8);
        } else if n <= u64::from(u16::MAX) {
            self.put_u8(0xFD);
            self.put_u16(n as u16);
        } else if n <= u64::from(u32::MAX) {
            self.put_u8(0xFE);
            self.put_u32(n as u32);
        } else {
            self.put_u8(0xFF);
            self.put_u64(n);
        }
    }

    fn put_var_int(&mut self, mut n: u64) {
        let mut groups = [0u8; 10];
        let mut i = 0;
        loop {
            groups[i] = (n & 0x7F) as u8 | if i > 0 { 0x80 } else { 0x00 };
            if n <= 0x7F {
                break;
            }
            n = (n >> 7) - 1;
            i += 1;
        }
        while i > 0 {
            self.push(groups[i]);
            i -= 1;
        }
        self.push(groups[0]);
    }

    fn put_sized_bytes(&mut self, bytes: &[u8]) {
        self.put_compact_size(bytes.len() as u64);
        self.extend_from_slice(bytes);
    }

    fn put_vec<T: Encodable>(&mut self, items: &[T]) {
        self.put_compact_size(items.len() as u64);
        for item in items {
            item.encode_into(self);
        }
    }
}

/// Size of the compact-size prefix for `n` elements.
pub fn size_of_compact_size(n: u64) -> usize {
    if n < 0xFD {
        1
    } else if n <= u64::from(u16::MAX) {
        3
    } else if n <= u64::from(u32::MAX) {
        5
    } else {
        9
    }
}

/// Size of the serialized VARINT form of `n`.
pub fn size_of_var_int(mut n: u64) -> usize {
    let mut size = 1;
    while n > 0x7F {
        n = (n >> 7) - 1;
        size += 1;
    }
    size
}

impl Encodable for Hash {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_hash(self);
    }
}

impl Decodable for Hash {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        reader.read_hash()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn var_int_round_trip(n: u64) {
        let mut buf = Vec::new();
        buf.put_var_int(n);
        assert_eq!(buf.len(), size_of_var_int(n));
        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_var_int().unwrap(), n);
        assert!(reader.is_empty());
    }

    #[test]
    fn var_int_known_vectors() {
        // Bitcoin serialize.h VARINT examples
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7F]),
            (128, &[0x80, 0x00]),
            (255, &[0x80, 0x7F]),
            (16511, &[0xFF, 0x7F]),
            (65535, &[0x82, 0xFE, 0x7F]),
        ];
        for (n, bytes) in cases {
            let mut buf = Vec::new();
            buf.put_var_int(*n);
            assert_eq!(&buf, bytes, "encoding of {}", n);
            var_int_round_trip(*n);
        }
        var_int_round_trip(u64::MAX);
    }

    #[test]
    fn compact_size_boundaries() {
        for n in [0u64, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, 0x1_0000_0000] {
            let mut buf = Vec::new();
            buf.put_compact_size(n);
            assert_eq!(buf.len(), size_of_compact_size(n));
            let mut reader = ByteReader::new(&buf);
            assert_eq!(reader.read_compact_size().unwrap(), n);
        }
    }

    #[test]
    fn compact_size_rejects_non_canonical() {
        // 0xFD prefix carrying a value that fits a single byte
        let mut reader = ByteReader::new(&[0xFD, 0x10, 0x00]);
        assert_eq!(
            reader.read_compact_size(),
            Err(CodecError::NonCanonicalCompactSize)
        );
    }

    #[test]
    fn eof_is_reported() {
        let mut reader = ByteReader::new(&[0x01]);
        assert!(matches!(
            reader.read_u32(),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn sized_bytes_round_trip() {
        let mut buf = Vec::new();
        buf.put_sized_bytes(b"hello");
        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_sized_bytes().unwrap(), b"hello");
    }
}
