// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::fmt;

use epic_common_types::Hash;

use crate::codec::{ByteReader, CodecError, Decodable, Encodable, WriteExt};

/// The fixed-size block header. A block names three parents: the anchoring milestone, the
/// previous block on its own peer chain and an arbitrary tip of another chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub version: u16,
    pub milestone_hash: Hash,
    pub prev_hash: Hash,
    pub tip_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    /// Difficulty target in Bitcoin compact form.
    pub diff_target: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn new(version: u16) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }
}

impl Encodable for BlockHeader {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_u16(self.version);
        buf.put_hash(&self.milestone_hash);
        buf.put_hash(&self.prev_hash);
        buf.put_hash(&self.tip_hash);
        buf.put_hash(&self.merkle_root);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.diff_target);
        buf.put_u32(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            version: reader.read_u16()?,
            milestone_hash: reader.read_hash()?,
            prev_hash: reader.read_hash()?,
            tip_hash: reader.read_hash()?,
            merkle_root: reader.read_hash()?,
            timestamp: reader.read_u32()?,
            diff_target: reader.read_u32()?,
            nonce: reader.read_u32()?,
        })
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "      version: {}", self.version)?;
        writeln!(f, "      milestone block: {}", self.milestone_hash)?;
        writeln!(f, "      previous block: {}", self.prev_hash)?;
        writeln!(f, "      tip block: {}", self.tip_hash)?;
        writeln!(f, "      merkle root: {}", self.merkle_root)?;
        writeln!(f, "      time: {}", self.timestamp)?;
        writeln!(f, "      difficulty target: {}", self.diff_target)?;
        writeln!(f, "      nonce: {}", self.nonce)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blocks::HEADER_SIZE;

    #[test]
    fn encoding_is_header_size() {
        let header = BlockHeader::new(10);
        assert_eq!(header.encode().len(), HEADER_SIZE);
    }

    #[test]
    fn codec_round_trip() {
        let header = BlockHeader {
            version: 10,
            milestone_hash: Hash::sha256(b"ms"),
            prev_hash: Hash::sha256(b"prev"),
            tip_hash: Hash::sha256(b"tip"),
            merkle_root: Hash::sha256(b"merkle"),
            timestamp: 1_650_000_000,
            diff_target: 0x2100ffff,
            nonce: 7,
        };
        let decoded = BlockHeader::decode_exact(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }
}
