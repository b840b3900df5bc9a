// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::fmt;

use epic_common_types::{Address, Hash};

use crate::{
    codec::{size_of_compact_size, size_of_var_int, ByteReader, CodecError, Decodable, Encodable, WriteExt},
    transactions::tasm::Listing,
};

/// Index value marking an unconnected outpoint (registration and redemption inputs).
pub const UNCONNECTED: u32 = u32::MAX;

/// A monetary amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Coin(pub u64);

impl Coin {
    pub const ZERO: Coin = Coin(0);

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, rhs: Coin) -> Option<Coin> {
        self.0.checked_add(rhs.0).map(Coin)
    }
}

impl std::iter::Sum for Coin {
    fn sum<I: Iterator<Item = Coin>>(iter: I) -> Self {
        Coin(iter.map(|c| c.0).sum())
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Points at the output that an input spends: the block that produced it, the transaction index
/// within that block and the output index within that transaction.
///
/// The distinguished unconnected outpoint (both indices `UNCONNECTED`) is carried by registration
/// inputs; its block hash field names the previous redemption anchor instead of a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxOutPoint {
    pub block_hash: Hash,
    pub tx_index: u32,
    pub out_index: u32,
}

impl TxOutPoint {
    pub fn new(block_hash: Hash, tx_index: u32, out_index: u32) -> Self {
        Self {
            block_hash,
            tx_index,
            out_index,
        }
    }

    /// The unconnected outpoint anchored at `anchor` (zero for a first registration).
    pub fn unconnected(anchor: Hash) -> Self {
        Self {
            block_hash: anchor,
            tx_index: UNCONNECTED,
            out_index: UNCONNECTED,
        }
    }

    pub fn is_unconnected(&self) -> bool {
        self.tx_index == UNCONNECTED && self.out_index == UNCONNECTED
    }

    /// Key of the UTXO this outpoint refers to.
    pub fn utxo_key(&self) -> Hash {
        super::utxo::compute_utxo_key(&self.block_hash, self.tx_index, self.out_index)
    }
}

impl Encodable for TxOutPoint {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_hash(&self.block_hash);
        buf.put_u32(self.tx_index);
        buf.put_u32(self.out_index);
    }
}

impl Decodable for TxOutPoint {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            block_hash: reader.read_hash()?,
            tx_index: reader.read_u32()?,
            out_index: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub outpoint: TxOutPoint,
    pub listing: Listing,
}

impl TxInput {
    pub fn new(outpoint: TxOutPoint, listing: Listing) -> Self {
        Self { outpoint, listing }
    }

    /// A registration input anchored at `anchor`.
    pub fn registration(anchor: Hash) -> Self {
        Self {
            outpoint: TxOutPoint::unconnected(anchor),
            listing: Listing::default(),
        }
    }

    pub fn is_registration(&self) -> bool {
        self.outpoint.is_unconnected()
    }

    pub fn is_first_registration(&self) -> bool {
        self.is_registration() && self.outpoint.block_hash.is_zero()
    }

    pub fn encoded_size(&self) -> usize {
        Hash::SIZE + 4 + 4 + self.listing.encoded_size()
    }
}

impl Encodable for TxInput {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.outpoint.encode_into(buf);
        self.listing.encode_into(buf);
    }
}

impl Decodable for TxInput {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            outpoint: TxOutPoint::decode(reader)?,
            listing: Listing::decode(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: Coin,
    pub listing: Listing,
}

impl TxOutput {
    pub fn new(value: Coin, listing: Listing) -> Self {
        Self { value, listing }
    }

    /// An output of `value` locked to `addr`.
    pub fn to_address(value: Coin, addr: &Address) -> Self {
        Self {
            value,
            listing: Listing::pay_to_address(addr),
        }
    }

    pub fn encoded_size(&self) -> usize {
        size_of_var_int(self.value.0) + self.listing.encoded_size()
    }
}

impl Encodable for TxOutput {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_var_int(self.value.0);
        self.listing.encode_into(buf);
    }
}

impl Decodable for TxOutput {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            value: Coin(reader.read_var_int()?),
            listing: Listing::decode(reader)?,
        })
    }
}

/// An immutable transaction. The hash is materialized on construction as a single SHA-256 over
/// the canonical encoding.
#[derive(Clone)]
pub struct Transaction {
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    hash: Hash,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Self {
            inputs,
            outputs,
            hash: Hash::zero(),
        };
        tx.hash = Hash::sha256(&tx.encode_body());
        tx
    }

    /// The canonical first registration: one unconnected input with a zero anchor and one
    /// zero-value output to `addr`.
    pub fn first_registration(addr: &Address) -> Self {
        Self::new(
            vec![TxInput::registration(Hash::zero())],
            vec![TxOutput::to_address(Coin::ZERO, addr)],
        )
    }

    /// A redemption advancing the peer chain whose previous redemption anchor is `prev_anchor`,
    /// realizing `value` to `addr`.
    pub fn redemption(prev_anchor: Hash, value: Coin, addr: &Address) -> Self {
        Self::new(
            vec![TxInput::registration(prev_anchor)],
            vec![TxOutput::to_address(value, addr)],
        )
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn cheap_hash(&self) -> u64 {
        self.hash.cheap_hash()
    }

    pub fn inputs(&self) -> &[TxInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOutput] {
        &self.outputs
    }

    /// True for both first registrations and redemptions.
    pub fn is_registration(&self) -> bool {
        self.inputs.len() == 1 && self.outputs.len() == 1 && self.inputs[0].is_registration()
    }

    pub fn is_first_registration(&self) -> bool {
        self.is_registration() &&
            self.inputs[0].is_first_registration() &&
            self.outputs[0].value == Coin::ZERO
    }

    pub fn output_value_sum(&self) -> Coin {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Stateless format checks: non-empty sides, no duplicated outpoints, registration shape.
    pub fn verify(&self) -> bool {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return false;
        }
        for (i, input) in self.inputs.iter().enumerate() {
            if input.is_registration() && !self.is_registration() {
                // unconnected outpoints are only allowed in the single-input registration shape
                return false;
            }
            for other in &self.inputs[i + 1..] {
                if input.outpoint == other.outpoint {
                    return false;
                }
            }
        }
        true
    }

    pub fn encoded_size(&self) -> usize {
        size_of_compact_size(self.inputs.len() as u64)
            + self.inputs.iter().map(TxInput::encoded_size).sum::<usize>()
            + size_of_compact_size(self.outputs.len() as u64)
            + self.outputs.iter().map(TxOutput::encoded_size).sum::<usize>()
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_vec(&self.inputs);
        buf.put_vec(&self.outputs);
        buf
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Transaction {}

impl std::hash::Hash for Transaction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.cheap_hash());
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("hash", &self.hash.to_substr())
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

impl Encodable for Transaction {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_vec(&self.inputs);
        buf.put_vec(&self.outputs);
    }
}

impl Decodable for Transaction {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let inputs = reader.read_vec()?;
        let outputs = reader.read_vec()?;
        Ok(Self::new(inputs, outputs))
    }
}

#[cfg(test)]
mod test {
    use epic_common_types::PrivateKey;

    use super::*;

    fn some_address() -> Address {
        PrivateKey::random().public_key().to_address()
    }

    #[test]
    fn first_registration_shape() {
        let tx = Transaction::first_registration(&some_address());
        assert!(tx.is_registration());
        assert!(tx.is_first_registration());
        assert!(tx.verify());
    }

    #[test]
    fn redemption_is_registration_but_not_first() {
        let anchor = Hash::sha256(b"prev redemption");
        let tx = Transaction::redemption(anchor, Coin(5), &some_address());
        assert!(tx.is_registration());
        assert!(!tx.is_first_registration());
        assert_eq!(tx.inputs()[0].outpoint.block_hash, anchor);
    }

    #[test]
    fn ordinary_tx_round_trip() {
        let producer = Hash::sha256(b"block");
        let tx = Transaction::new(
            vec![TxInput::new(
                TxOutPoint::new(producer, 0, 1),
                Listing::from_data(vec![1, 2, 3]),
            )],
            vec![TxOutput::to_address(Coin(42), &some_address())],
        );
        assert!(tx.verify());
        assert!(!tx.is_registration());

        let encoded = tx.encode();
        assert_eq!(encoded.len(), tx.encoded_size());
        let decoded = Transaction::decode_exact(&encoded).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.hash(), tx.hash());
    }

    #[test]
    fn duplicate_inputs_fail_verify() {
        let op = TxOutPoint::new(Hash::sha256(b"b"), 0, 0);
        let tx = Transaction::new(
            vec![
                TxInput::new(op, Listing::default()),
                TxInput::new(op, Listing::default()),
            ],
            vec![TxOutput::to_address(Coin(1), &some_address())],
        );
        assert!(!tx.verify());
    }

    #[test]
    fn zero_input_tx_fails_verify() {
        let tx = Transaction::new(vec![], vec![TxOutput::to_address(Coin(1), &some_address())]);
        assert!(!tx.verify());
    }

    #[test]
    fn mixed_unconnected_input_fails_verify() {
        let tx = Transaction::new(
            vec![
                TxInput::registration(Hash::zero()),
                TxInput::new(TxOutPoint::new(Hash::sha256(b"b"), 0, 0), Listing::default()),
            ],
            vec![TxOutput::to_address(Coin(1), &some_address())],
        );
        assert!(!tx.verify());
    }
}
