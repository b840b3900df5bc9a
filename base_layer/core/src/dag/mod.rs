// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! The milestone-anchored DAG: vertices annotating confirmed blocks, milestone snapshots with
//! their level sets, candidate chains and the fork container, the orphan buffer and the manager
//! that drives admission, confirmation and callbacks.

mod chain;
mod chains;
mod error;
mod manager;
mod milestone;
mod obc;
mod reg_change;
mod vertex;

pub use chain::Chain;
pub use chains::Chains;
pub use error::DagError;
pub use manager::{DagCallbacks, DagManager, LevelSetEvent};
pub use milestone::{Milestone, MilestoneRecord};
pub use obc::{MissingMask, OrphanBlocksContainer};
pub use reg_change::RegChange;
pub use vertex::{RedemptionStatus, TxValidity, Vertex};
