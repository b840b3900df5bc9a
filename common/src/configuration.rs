// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::params::NetworkType;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkType,
    pub storage: StorageConfig,
    pub mempool: MempoolConfig,
    pub miner: MinerConfig,
    pub comms: CommsConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: NetworkType::Mainnet,
            storage: StorageConfig::default(),
            mempool: MempoolConfig::default(),
            miner: MinerConfig::default(),
            comms: CommsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for BLK/VTX files and the key-value catalog.
    pub data_dir: PathBuf,
    /// Maximum bytes per BLK/VTX file before the name advances.
    pub file_capacity: u32,
    /// Files per epoch directory before the epoch advances.
    pub epoch_capacity: u32,
    /// LMDB memory map size, in MB.
    pub db_size_mb: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            file_capacity: 1 << 28,
            epoch_capacity: 1 << 16,
            db_size_mb: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Soft cap on pending transactions; inserts beyond it are refused.
    pub capacity: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self { capacity: 100_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// Number of solver worker threads. Zero selects the number of physical cores.
    pub solver_threads: usize,
    /// Trimming rounds per solve attempt.
    pub trim_rounds: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            solver_threads: 0,
            trim_rounds: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    pub bind_address: String,
    pub serialize_workers: usize,
    pub deserialize_workers: usize,
    /// Maximum simultaneous inbound connections.
    pub max_inbound: usize,
    /// Maximum simultaneous outbound connections.
    pub max_outbound: usize,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7877".into(),
            serialize_workers: 2,
            deserialize_workers: 2,
            max_inbound: 125,
            max_outbound: 8,
        }
    }
}
