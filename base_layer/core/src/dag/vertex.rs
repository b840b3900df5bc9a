// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::Arc;

use crate::{
    blocks::Block,
    codec::{ByteReader, CodecError, Encodable, WriteExt},
    transactions::Coin,
};

/// Ledger verdict for one transaction inside a confirmed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxValidity {
    Unknown = 0,
    Valid = 1,
    Invalid = 2,
}

impl TxValidity {
    pub fn from_byte(b: u8) -> Result<Self, CodecError> {
        match b {
            0 => Ok(TxValidity::Unknown),
            1 => Ok(TxValidity::Valid),
            2 => Ok(TxValidity::Invalid),
            _ => Err(CodecError::InvalidField("tx validity")),
        }
    }
}

/// Redemption lifecycle of a registration block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RedemptionStatus {
    /// The block carries no registration.
    NotRedemption = 0,
    /// A registration whose reward has not been redeemed yet.
    NotYet = 1,
    /// A later redemption consumed this registration.
    IsRedeemed = 2,
}

impl RedemptionStatus {
    pub fn from_byte(b: u8) -> Result<Self, CodecError> {
        match b {
            0 => Ok(RedemptionStatus::NotRedemption),
            1 => Ok(RedemptionStatus::NotYet),
            2 => Ok(RedemptionStatus::IsRedeemed),
            _ => Err(CodecError::InvalidField("redemption status")),
        }
    }
}

/// The DAG's annotation of a confirmed block.
#[derive(Debug, Clone)]
pub struct Vertex {
    pub block: Arc<Block>,
    /// Height of the anchoring milestone.
    pub height: u64,
    /// Reward accumulated along the peer chain up to this block.
    pub cumulative_reward: Coin,
    /// Number of blocks on the miner's own peer chain up to this one.
    pub miner_chain_height: u64,
    pub validity: Vec<TxValidity>,
    pub is_milestone: bool,
    pub redemption_status: RedemptionStatus,
}

impl Vertex {
    pub fn new(block: Arc<Block>) -> Self {
        let tx_count = block.transactions().len();
        Self {
            block,
            height: 0,
            cumulative_reward: Coin::ZERO,
            miner_chain_height: 0,
            validity: vec![TxValidity::Unknown; tx_count],
            is_milestone: false,
            redemption_status: RedemptionStatus::NotRedemption,
        }
    }

    /// Whether the block's leading transaction was admitted as a valid registration.
    pub fn has_valid_registration(&self) -> bool {
        self.block.is_registration() && self.validity.first() == Some(&TxValidity::Valid)
    }

    /// Encoded size of the vertex record. Mutations that keep this size may be patched in place
    /// in the vertex file.
    pub fn optimal_storage_size(&self) -> usize {
        use crate::codec::{size_of_compact_size, size_of_var_int};
        size_of_var_int(self.height)
            + size_of_var_int(self.cumulative_reward.value())
            + size_of_var_int(self.miner_chain_height)
            + 1 // is_milestone
            + 1 // redemption status
            + size_of_compact_size(self.validity.len() as u64)
            + self.validity.len()
    }
}

/// The vertex record as stored in VTX files. The block itself is stored separately in the BLK
/// file at the paired offset.
impl Encodable for Vertex {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_var_int(self.height);
        buf.put_var_int(self.cumulative_reward.value());
        buf.put_var_int(self.miner_chain_height);
        buf.put_u8(self.is_milestone as u8);
        buf.put_u8(self.redemption_status as u8);
        buf.put_compact_size(self.validity.len() as u64);
        for v in &self.validity {
            buf.put_u8(*v as u8);
        }
    }
}

impl Vertex {
    /// Decode a vertex record; the caller attaches the block read from the BLK file.
    pub fn decode_with_block(reader: &mut ByteReader<'_>, block: Arc<Block>) -> Result<Self, CodecError> {
        let height = reader.read_var_int()?;
        let cumulative_reward = Coin(reader.read_var_int()?);
        let miner_chain_height = reader.read_var_int()?;
        let is_milestone = match reader.read_u8()? {
            0 => false,
            1 => true,
            _ => return Err(CodecError::InvalidField("is_milestone")),
        };
        let redemption_status = RedemptionStatus::from_byte(reader.read_u8()?)?;
        let validity_len = reader.read_compact_size()? as usize;
        let mut validity = Vec::with_capacity(validity_len.min(1024));
        for _ in 0..validity_len {
            validity.push(TxValidity::from_byte(reader.read_u8()?)?);
        }
        Ok(Self {
            block,
            height,
            cumulative_reward,
            miner_chain_height,
            validity,
            is_milestone,
            redemption_status,
        })
    }
}
