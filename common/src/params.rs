// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::fmt;

use once_cell::sync::OnceCell;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

/// The networks an Epic node can join. Localnet uses a tiny proof size and permissive targets so
/// tests can mine blocks in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    Mainnet,
    Testnet,
    Localnet,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Mainnet => write!(f, "mainnet"),
            NetworkType::Testnet => write!(f, "testnet"),
            NetworkType::Localnet => write!(f, "localnet"),
        }
    }
}

/// Consensus parameters for one network.
#[derive(Debug, Clone)]
pub struct Params {
    pub network: NetworkType,
    /// Expected block version.
    pub version: u16,
    /// Network magic prefixed to every wire frame.
    pub magic: u32,
    /// Largest admissible target; also the unit of chainwork (`chainwork += max_target / target`).
    pub max_target: U256,
    /// Initial milestone target used by the genesis snapshot.
    pub initial_ms_target: U256,
    /// Milestone target / block target ratio numerator: a block qualifies as a milestone when its
    /// proof hash also meets the (stricter) milestone target.
    pub sortition_coefficient: u64,
    /// Difficulty retarget period, in milestones.
    pub interval: u64,
    /// Desired time spacing between milestones, in seconds.
    pub target_timespan: u32,
    /// Cuckaroo edge index bits.
    pub edge_bits: u8,
    /// Cuckaroo cycle length. Zero disables cycle PoW entirely (hash-only targets, used by
    /// localnet tests).
    pub cycle_len: usize,
    /// Maximum transactions per block.
    pub block_capacity: usize,
    /// Base block reward credited to a registration, per confirmed block on the peer chain.
    pub reward: u64,
    /// Minimum fee for an ordinary transaction.
    pub min_fee: u64,
    /// Hard ceiling on any single output value.
    pub max_money: u64,
    /// Number of recent milestone snapshots a chain keeps in memory.
    pub cache_window: usize,
    /// Base58Check version byte for pay-to-key-hash addresses.
    pub pubkey_address_prefix: u8,
    /// Base58Check version byte for WIF secrets.
    pub secret_key_prefix: u8,
    /// Base58Check version bytes for BIP32 extended keys.
    pub ext_public_key_prefix: u8,
    pub ext_secret_key_prefix: u8,
}

impl Params {
    pub fn mainnet() -> Self {
        Self {
            network: NetworkType::Mainnet,
            version: 10,
            magic: 0x4550_4943, // "EPIC"
            max_target: U256::MAX >> 16,
            initial_ms_target: U256::MAX >> 20,
            sortition_coefficient: 100,
            interval: 5,
            target_timespan: 100,
            edge_bits: 29,
            cycle_len: 42,
            block_capacity: 128,
            reward: 1,
            min_fee: 1,
            max_money: 9_999_999_999,
            cache_window: 100,
            pubkey_address_prefix: 0x21,
            secret_key_prefix: 0x80,
            ext_public_key_prefix: 0x42,
            ext_secret_key_prefix: 0x6b,
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: NetworkType::Testnet,
            magic: 0x54_45_53_54,
            max_target: U256::MAX >> 4,
            initial_ms_target: U256::MAX >> 8,
            target_timespan: 50,
            ..Self::mainnet()
        }
    }

    /// Unit-test parameters: no cycle PoW, permissive targets, and a retarget interval long
    /// enough that difficulty never moves under test workloads.
    pub fn localnet() -> Self {
        Self {
            network: NetworkType::Localnet,
            magic: 0x4c_4f_43_4c,
            max_target: U256::MAX,
            initial_ms_target: U256::MAX >> 1,
            sortition_coefficient: 2,
            interval: 1000,
            target_timespan: 10,
            edge_bits: 15,
            cycle_len: 0,
            block_capacity: 32,
            reward: 100,
            cache_window: 10,
            ..Self::mainnet()
        }
    }

    pub fn for_network(network: NetworkType) -> Self {
        match network {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Localnet => Self::localnet(),
        }
    }
}

static PARAMS: OnceCell<Params> = OnceCell::new();

/// Install the global parameter set. Later calls are ignored; tests and the node both go through
/// this so everything below params sees one consistent network.
pub fn set_params(network: NetworkType) -> &'static Params {
    PARAMS.get_or_init(|| Params::for_network(network))
}

/// The installed parameter set, defaulting to localnet when nothing was installed (unit tests).
pub fn get_params() -> &'static Params {
    PARAMS.get_or_init(Params::localnet)
}
