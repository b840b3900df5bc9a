// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! Shared node-wide definitions: per-network consensus parameters, subsystem configuration
//! structs and process exit codes.

pub mod configuration;
pub mod exit_codes;
pub mod params;

pub use configuration::{CommsConfig, MempoolConfig, MinerConfig, NodeConfig, StorageConfig};
pub use exit_codes::ExitCode;
pub use params::{get_params, set_params, NetworkType, Params};
