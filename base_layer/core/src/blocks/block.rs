// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    collections::HashSet,
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use epic_common::{get_params, Params};
use epic_common_types::Hash;
use log::*;
use primitive_types::U256;

use crate::{
    blocks::{block_header::BlockHeader, genesis::genesis_block, merkle::compute_merkle_root, MAX_BLOCK_SIZE},
    codec::{size_of_compact_size, ByteReader, CodecError, Decodable, Encodable, WriteExt},
    proof_of_work::{blake2b_256, compact_to_target, siphash_keys_from_header, verify_proof},
    transactions::Transaction,
};

const LOG_TARGET: &str = "c::blocks";

/// Where a block entered the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockSource {
    #[default]
    Unknown,
    Network,
    Miner,
}

/// A block: header, PoW proof cycle and transaction vector. The identity hash is a single
/// SHA-256 over header‖proof; the proof hash (compared against targets) is BLAKE2b-256 over the
/// raw proof words.
#[derive(Clone)]
pub struct Block {
    header: BlockHeader,
    proof: Vec<u32>,
    transactions: Vec<Arc<Transaction>>,
    hash: Hash,
    proof_hash: Hash,
    optimal_encoding_size: usize,
    pub source: BlockSource,
}

impl Block {
    pub fn new(version: u16) -> Self {
        Self {
            header: BlockHeader::new(version),
            proof: Vec::new(),
            transactions: Vec::new(),
            hash: Hash::zero(),
            proof_hash: Hash::zero(),
            optimal_encoding_size: 0,
            source: BlockSource::Unknown,
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn version(&self) -> u16 {
        self.header.version
    }

    pub fn milestone_hash(&self) -> Hash {
        self.header.milestone_hash
    }

    pub fn prev_hash(&self) -> Hash {
        self.header.prev_hash
    }

    pub fn tip_hash(&self) -> Hash {
        self.header.tip_hash
    }

    pub fn merkle_root(&self) -> Hash {
        self.header.merkle_root
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn diff_target(&self) -> u32 {
        self.header.diff_target
    }

    pub fn nonce(&self) -> u32 {
        self.header.nonce
    }

    pub fn proof(&self) -> &[u32] {
        &self.proof
    }

    pub fn transactions(&self) -> &[Arc<Transaction>] {
        &self.transactions
    }

    pub fn has_transactions(&self) -> bool {
        !self.transactions.is_empty()
    }

    pub fn set_milestone_hash(&mut self, hash: Hash) {
        self.uncache();
        self.header.milestone_hash = hash;
    }

    pub fn set_prev_hash(&mut self, hash: Hash) {
        self.uncache();
        self.header.prev_hash = hash;
    }

    pub fn set_tip_hash(&mut self, hash: Hash) {
        self.uncache();
        self.header.tip_hash = hash;
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.uncache();
        self.header.timestamp = timestamp;
    }

    pub fn set_diff_target(&mut self, compact: u32) {
        self.uncache();
        self.header.diff_target = compact;
    }

    pub fn set_nonce(&mut self, nonce: u32) {
        self.hash = Hash::zero();
        self.header.nonce = nonce;
    }

    pub fn set_proof(&mut self, proof: Vec<u32>) {
        self.hash = Hash::zero();
        self.proof = proof;
    }

    pub fn add_transaction(&mut self, tx: Arc<Transaction>) {
        self.uncache();
        self.transactions.push(tx);
    }

    pub fn add_transactions(&mut self, txns: impl IntoIterator<Item = Arc<Transaction>>) {
        self.uncache();
        self.transactions.extend(txns);
    }

    /// Recompute the merkle root from the current transactions.
    pub fn set_merkle(&mut self) {
        self.header.merkle_root = compute_merkle_root(&self.tx_hashes()).0;
    }

    fn uncache(&mut self) {
        self.hash = Hash::zero();
        self.optimal_encoding_size = 0;
        self.header.merkle_root = Hash::zero();
    }

    /// Materialize the identity hash, proof hash and optimal encoding size. Idempotent.
    pub fn finalize_hash(&mut self) {
        if !self.hash.is_zero() {
            return;
        }
        if self.has_transactions() && self.header.merkle_root.is_zero() {
            self.set_merkle();
        }
        let mut bytes = self.header.encode();
        bytes.put_compact_size(self.proof.len() as u64);
        for word in &self.proof {
            bytes.put_u32(*word);
        }
        self.hash = Hash::sha256(&bytes);

        let mut proof_bytes = Vec::with_capacity(self.proof.len() * 4);
        for word in &self.proof {
            proof_bytes.put_u32(*word);
        }
        self.proof_hash = blake2b_256(&proof_bytes);
        self.optimal_encoding_size = self.compute_optimal_encoding_size();
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn proof_hash(&self) -> &Hash {
        &self.proof_hash
    }

    /// The value compared against block and milestone targets: the proof hash under cycle PoW, or
    /// a BLAKE2b of the header when the network runs without cycles.
    pub fn pow_hash(&self) -> Hash {
        if get_params().cycle_len > 0 {
            self.proof_hash
        } else {
            blake2b_256(&self.header.encode())
        }
    }

    pub fn tx_hashes(&self) -> Vec<Hash> {
        self.transactions.iter().map(|tx| *tx.hash()).collect()
    }

    pub fn optimal_encoding_size(&self) -> usize {
        debug_assert!(self.optimal_encoding_size > 0, "hash not finalized");
        self.optimal_encoding_size
    }

    fn compute_optimal_encoding_size(&self) -> usize {
        crate::blocks::HEADER_SIZE
            + size_of_compact_size(self.proof.len() as u64)
            + self.proof.len() * 4
            + size_of_compact_size(self.transactions.len() as u64)
            + self.transactions.iter().map(|tx| tx.encoded_size()).sum::<usize>()
    }

    pub fn is_registration(&self) -> bool {
        self.transactions.first().map(|tx| tx.is_registration()).unwrap_or(false)
    }

    pub fn is_first_registration(&self) -> bool {
        self.prev_hash() == *genesis_block().hash() &&
            self.transactions
                .first()
                .map(|tx| tx.is_first_registration())
                .unwrap_or(false)
    }

    /// The 256-bit target this block claims, decoded from its compact form.
    pub fn target(&self) -> Option<U256> {
        compact_to_target(self.header.diff_target)
    }

    /// Chainwork contributed by this block: `max_target / target`.
    pub fn chain_work(&self) -> U256 {
        let params = get_params();
        match self.target() {
            Some(target) if !target.is_zero() => params.max_target / target,
            _ => U256::zero(),
        }
    }

    /// Verify the proof of work claimed by the header: proof size, cycle validity, target bounds
    /// and proof hash against the target.
    pub fn check_pow(&self) -> bool {
        debug_assert!(!self.hash.is_zero(), "hash not finalized");
        let params = get_params();

        if self.proof.len() != params.cycle_len {
            info!(
                target: LOG_TARGET,
                "Bad proof size: {} [{}]",
                self.proof.len(),
                self.hash.to_substr()
            );
            return false;
        }

        if params.cycle_len > 0 {
            let keys = siphash_keys_from_header(&self.header.encode());
            if let Err(e) = verify_proof(&self.proof, &keys, params.edge_bits) {
                info!(target: LOG_TARGET, "Invalid proof of edges: {} [{}]", e, self.hash.to_substr());
                return false;
            }
        }

        let target = match self.target() {
            Some(t) if !t.is_zero() && t <= params.max_target => t,
            _ => {
                info!(target: LOG_TARGET, "Bad difficulty target [{}]", self.hash.to_substr());
                return false;
            },
        };

        if self.pow_hash().to_u256() > target {
            info!(
                target: LOG_TARGET,
                "Proof hash is higher than target {} [{}]",
                target,
                self.hash.to_substr()
            );
            return false;
        }
        true
    }

    /// Whether the proof also meets the stricter milestone target.
    pub fn check_milestone_pow(&self, ms_target: U256) -> bool {
        self.pow_hash().to_u256() <= ms_target
    }

    /// Full syntax verification per the admission pipeline: version, PoW, merkle root, timestamp
    /// drift, encoded size, transaction well-formedness/uniqueness and the first-registration
    /// rule.
    pub fn verify(&self) -> bool {
        let params: &Params = get_params();
        if self.header.version != params.version {
            info!(
                target: LOG_TARGET,
                "Block with wrong version {} v.s. expected {} [{}]",
                self.header.version,
                params.version,
                self.hash.to_substr()
            );
            return false;
        }

        if !self.check_pow() {
            return false;
        }

        let (root, mutated) = compute_merkle_root(&self.tx_hashes());
        if mutated {
            info!(
                target: LOG_TARGET,
                "Block contains duplicated transactions in a merkle tree branch [{}]",
                self.hash.to_substr()
            );
            return false;
        }
        if root != self.header.merkle_root {
            info!(target: LOG_TARGET, "Block contains invalid merkle root [{}]", self.hash.to_substr());
            return false;
        }

        let now = unix_time();
        if u64::from(self.header.timestamp) > now + u64::from(crate::blocks::ALLOWED_TIME_DRIFT) {
            info!(
                target: LOG_TARGET,
                "Block too advanced in the future: {} v.s. allowed {} [{}]",
                self.header.timestamp,
                now + u64::from(crate::blocks::ALLOWED_TIME_DRIFT),
                self.hash.to_substr()
            );
            return false;
        }

        if self.transactions.len() > params.block_capacity {
            info!(
                target: LOG_TARGET,
                "Block with {} transactions larger than its capacity ({}) [{}]",
                self.transactions.len(),
                params.block_capacity,
                self.hash.to_substr()
            );
        }

        if self.optimal_encoding_size() > MAX_BLOCK_SIZE {
            info!(
                target: LOG_TARGET,
                "Block with size {} larger than MAX_BLOCK_SIZE [{}]",
                self.optimal_encoding_size,
                self.hash.to_substr()
            );
            return false;
        }

        if self.has_transactions() {
            let mut tx_hashes = HashSet::with_capacity(self.transactions.len());
            for tx in &self.transactions {
                if !tx.verify() {
                    return false;
                }
                tx_hashes.insert(*tx.hash());
            }
            if tx_hashes.len() != self.transactions.len() {
                info!(target: LOG_TARGET, "Block contains duplicated transactions [{}]", self.hash.to_substr());
                return false;
            }
        }

        if self.prev_hash() == *genesis_block().hash() {
            if !self.has_transactions() {
                info!(
                    target: LOG_TARGET,
                    "Block is the first registration but does not contain a tx [{}]",
                    self.hash.to_substr()
                );
                return false;
            }
            if !self.transactions[0].is_first_registration() {
                info!(
                    target: LOG_TARGET,
                    "Block is the first registration but contains invalid tx [{}]",
                    self.hash.to_substr()
                );
                return false;
            }
        }
        true
    }
}

pub(crate) fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        !self.hash.is_zero() && self.hash == other.hash
    }
}

impl Eq for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("hash", &self.hash.to_substr())
            .field("ms", &self.header.milestone_hash.to_substr())
            .field("prev", &self.header.prev_hash.to_substr())
            .field("tip", &self.header.tip_hash.to_substr())
            .field("txns", &self.transactions.len())
            .finish()
    }
}

impl Encodable for Block {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.header.encode_into(buf);
        buf.put_compact_size(self.proof.len() as u64);
        for word in &self.proof {
            buf.put_u32(*word);
        }
        buf.put_compact_size(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(buf);
        }
    }
}

impl Decodable for Block {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let header = BlockHeader::decode(reader)?;
        let proof_len = reader.read_compact_size()? as usize;
        let mut proof = Vec::with_capacity(proof_len.min(1024));
        for _ in 0..proof_len {
            proof.push(reader.read_u32()?);
        }
        let tx_len = reader.read_compact_size()? as usize;
        let mut transactions = Vec::with_capacity(tx_len.min(1024));
        for _ in 0..tx_len {
            transactions.push(Arc::new(Transaction::decode(reader)?));
        }
        let mut block = Block {
            header,
            proof,
            transactions,
            hash: Hash::zero(),
            proof_hash: Hash::zero(),
            optimal_encoding_size: 0,
            source: BlockSource::Unknown,
        };
        block.finalize_hash();
        Ok(block)
    }
}

#[cfg(test)]
mod test {
    use epic_common_types::PrivateKey;

    use super::*;
    use crate::test_helpers::{solve_block, zero_block};

    #[test]
    fn codec_round_trip_preserves_hash_and_size() {
        let addr = PrivateKey::random().public_key().to_address();
        let mut block = zero_block();
        block.add_transaction(Arc::new(Transaction::first_registration(&addr)));
        block.finalize_hash();

        let encoded = block.encode();
        assert_eq!(encoded.len(), block.optimal_encoding_size());
        let decoded = Block::decode_exact(&encoded).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.optimal_encoding_size(), block.optimal_encoding_size());
    }

    #[test]
    fn solved_zero_cycle_block_passes_pow() {
        let mut block = zero_block();
        solve_block(&mut block);
        assert!(block.check_pow());
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let mut block = zero_block();
        block.set_timestamp((unix_time() + 1) as u32);
        solve_block(&mut block);
        assert!(block.verify());

        let mut late = zero_block();
        late.set_timestamp((unix_time() + 5) as u32);
        solve_block(&mut late);
        assert!(!late.verify());
    }

    #[test]
    fn wrong_merkle_root_is_rejected() {
        let addr = PrivateKey::random().public_key().to_address();
        let mut block = zero_block();
        block.add_transaction(Arc::new(Transaction::first_registration(&addr)));
        solve_block(&mut block);
        // corrupt the root after solving
        block.header.merkle_root = Hash::sha256(b"garbage");
        block.hash = Hash::zero();
        block.finalize_hash();
        assert!(!block.verify());
    }
}
