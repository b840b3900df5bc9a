// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use epic_common_types::Hash;

use crate::{
    codec::{ByteReader, CodecError, Decodable, Encodable, WriteExt},
    transactions::transaction::TxOutput,
};

/// The 256-bit UTXO index key: the producing block hash XORed with the output position packed
/// into the high 64 bits of the integer. Position entropy lands on already uniformly random
/// bytes, so no further hashing is required.
pub fn compute_utxo_key(block_hash: &Hash, tx_index: u32, out_index: u32) -> Hash {
    let position = (u64::from(tx_index) << 32) | u64::from(out_index);
    let mut bytes = *block_hash.as_bytes();
    // the high 64 bits of a little-endian 256-bit integer are the trailing 8 bytes
    for (b, p) in bytes[24..].iter_mut().zip(position.to_le_bytes()) {
        *b ^= p;
    }
    Hash::from_bytes(bytes)
}

/// An unspent output together with its position in the producing block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub output: TxOutput,
    pub tx_index: u32,
    pub out_index: u32,
}

impl Utxo {
    pub fn new(output: TxOutput, tx_index: u32, out_index: u32) -> Self {
        Self {
            output,
            tx_index,
            out_index,
        }
    }

    /// Key of this UTXO given the block that produced it.
    pub fn key(&self, block_hash: &Hash) -> Hash {
        compute_utxo_key(block_hash, self.tx_index, self.out_index)
    }
}

impl Encodable for Utxo {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.output.encode_into(buf);
        buf.put_u32(self.tx_index);
        buf.put_u32(self.out_index);
    }
}

impl Decodable for Utxo {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            output: TxOutput::decode(reader)?,
            tx_index: reader.read_u32()?,
            out_index: reader.read_u32()?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transactions::{Coin, Listing};

    #[test]
    fn key_depends_on_position() {
        let block = Hash::sha256(b"block");
        let a = compute_utxo_key(&block, 0, 0);
        let b = compute_utxo_key(&block, 0, 1);
        let c = compute_utxo_key(&block, 1, 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        // zero position keeps the block hash untouched
        assert_eq!(a, block);
    }

    #[test]
    fn key_xor_is_involutive() {
        let block = Hash::sha256(b"block");
        let key = compute_utxo_key(&block, 3, 7);
        // applying the same position twice restores the block hash
        let restored = compute_utxo_key(&key, 3, 7);
        assert_eq!(restored, block);
    }

    #[test]
    fn codec_round_trip() {
        let utxo = Utxo::new(
            crate::transactions::TxOutput::new(Coin(99), Listing::from_data(vec![5, 6])),
            2,
            1,
        );
        let decoded = Utxo::decode_exact(&utxo.encode()).unwrap();
        assert_eq!(decoded, utxo);
    }
}
