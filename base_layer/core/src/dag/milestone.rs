// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::collections::HashMap;

use epic_common::get_params;
use epic_common_types::Hash;
use parking_lot::RwLock;
use primitive_types::U256;

use crate::{
    codec::{ByteReader, CodecError, Decodable, Encodable, WriteExt},
    dag::{reg_change::RegChange, vertex::Vertex},
    proof_of_work::{block_target_for, next_targets},
    transactions::Utxo,
};

/// A milestone snapshot: the difficulty state at this point of the milestone chain, the level
/// set it confirms and the ledger deltas the confirmation produced.
///
/// Snapshots are shared between forked chains up to their fork point; vertices inside them are
/// individually lockable because a later redemption flips the registration vertex of an earlier,
/// already shared snapshot. All such mutation happens on the DAG verify thread.
pub struct Milestone {
    pub height: u64,
    pub chainwork: U256,
    pub block_target: U256,
    pub milestone_target: U256,
    pub hash_rate: u64,
    /// Timestamp anchoring the current retarget window.
    pub last_update_time: u32,
    /// Hashes of the confirmed blocks, the milestone first.
    pub level_set: Vec<Hash>,
    /// Vertices for every block in the level set, keyed by block hash.
    pub vertices: HashMap<Hash, RwLock<Vertex>>,
    /// Peer-chain head movements in this level set.
    pub reg_change: RegChange,
    /// UTXOs created here, keyed by UTXO key. Kept for fork replay within the cached window.
    pub created_utxos: HashMap<Hash, Utxo>,
    /// UTXOs spent here, keyed by UTXO key, with the full record for rollback.
    pub spent_utxos: HashMap<Hash, Utxo>,
}

impl Milestone {
    /// The snapshot for the genesis block.
    pub fn genesis(mut genesis_vertex: Vertex) -> Self {
        let params = get_params();
        let hash = *genesis_vertex.block.hash();
        let timestamp = genesis_vertex.block.timestamp();
        genesis_vertex.is_milestone = true;
        genesis_vertex.height = 0;
        let mut vertices = HashMap::new();
        vertices.insert(hash, RwLock::new(genesis_vertex));
        Self {
            height: 0,
            chainwork: U256::zero(),
            block_target: block_target_for(params.initial_ms_target, params),
            milestone_target: params.initial_ms_target,
            hash_rate: 1,
            last_update_time: timestamp,
            level_set: vec![hash],
            vertices,
            reg_change: RegChange::new(),
            created_utxos: HashMap::new(),
            spent_utxos: HashMap::new(),
        }
    }

    /// Create the successor snapshot anchored by a block with timestamp `ms_time`. Difficulty
    /// retargets on every `interval` boundary; chainwork always accumulates the inverse of the
    /// new milestone target.
    pub fn next(parent: &Milestone, ms_time: u32) -> Self {
        let params = get_params();
        let height = parent.height + 1;

        let (milestone_target, block_target, hash_rate, last_update_time) = if height % params.interval == 0 {
            let actual = ms_time.saturating_sub(parent.last_update_time);
            let retarget = next_targets(parent.milestone_target, actual, params);
            (
                retarget.milestone_target,
                retarget.block_target,
                retarget.hash_rate,
                ms_time,
            )
        } else {
            (
                parent.milestone_target,
                parent.block_target,
                parent.hash_rate,
                parent.last_update_time,
            )
        };

        let chainwork = parent.chainwork + params.max_target / milestone_target;

        Self {
            height,
            chainwork,
            block_target,
            milestone_target,
            hash_rate,
            last_update_time,
            level_set: Vec::new(),
            vertices: HashMap::new(),
            reg_change: RegChange::new(),
            created_utxos: HashMap::new(),
            spent_utxos: HashMap::new(),
        }
    }

    pub fn hash(&self) -> Hash {
        self.level_set.first().copied().unwrap_or_default()
    }

    pub fn contains(&self, block_hash: &Hash) -> bool {
        self.vertices.contains_key(block_hash)
    }
}

/// The difficulty/ledger portion of a snapshot as persisted inside the milestone's vertex
/// record. The level set itself is reconstructed from the stored vertices at the same height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MilestoneRecord {
    pub height: u64,
    pub chainwork: U256,
    pub block_target: U256,
    pub milestone_target: U256,
    pub hash_rate: u64,
    pub last_update_time: u32,
    pub reg_change: RegChange,
}

impl From<&Milestone> for MilestoneRecord {
    fn from(ms: &Milestone) -> Self {
        Self {
            height: ms.height,
            chainwork: ms.chainwork,
            block_target: ms.block_target,
            milestone_target: ms.milestone_target,
            hash_rate: ms.hash_rate,
            last_update_time: ms.last_update_time,
            reg_change: ms.reg_change.clone(),
        }
    }
}

fn put_u256(buf: &mut Vec<u8>, value: &U256) {
    let mut bytes = [0u8; 32];
    value.to_little_endian(&mut bytes);
    buf.extend_from_slice(&bytes);
}

fn read_u256(reader: &mut ByteReader<'_>) -> Result<U256, CodecError> {
    let bytes = reader.read_bytes(32)?;
    Ok(U256::from_little_endian(&bytes))
}

impl Encodable for MilestoneRecord {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_var_int(self.height);
        put_u256(buf, &self.chainwork);
        put_u256(buf, &self.block_target);
        put_u256(buf, &self.milestone_target);
        buf.put_var_int(self.hash_rate);
        buf.put_u32(self.last_update_time);
        self.reg_change.encode_into(buf);
    }
}

impl Decodable for MilestoneRecord {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            height: reader.read_var_int()?,
            chainwork: read_u256(reader)?,
            block_target: read_u256(reader)?,
            milestone_target: read_u256(reader)?,
            hash_rate: reader.read_var_int()?,
            last_update_time: reader.read_u32()?,
            reg_change: RegChange::decode(reader)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blocks::genesis_block;

    fn genesis_ms() -> Milestone {
        Milestone::genesis(Vertex::new(std::sync::Arc::new(genesis_block().clone())))
    }

    #[test]
    fn chainwork_accumulates_inverse_target() {
        let params = get_params();
        let genesis = genesis_ms();
        let next = Milestone::next(&genesis, genesis.last_update_time + 10);
        assert_eq!(
            next.chainwork,
            genesis.chainwork + params.max_target / next.milestone_target
        );
        assert_eq!(next.height, 1);
    }

    #[test]
    fn retarget_only_on_interval_boundary() {
        let genesis = genesis_ms();
        let mut ms = Milestone::next(&genesis, genesis.last_update_time + 1);
        let initial_update_time = genesis.last_update_time;
        while ms.height % get_params().interval != 0 {
            assert_eq!(ms.last_update_time, initial_update_time);
            ms = Milestone::next(&ms, initial_update_time + ms.height as u32 + 1);
        }
        // the boundary snapshot re-anchors the window
        assert_ne!(ms.last_update_time, initial_update_time);
    }

    #[test]
    fn record_round_trip() {
        let genesis = genesis_ms();
        let record = MilestoneRecord::from(&genesis);
        let decoded = MilestoneRecord::decode_exact(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }
}
