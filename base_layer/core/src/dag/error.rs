// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

use crate::chain_storage::ChainStorageError;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Erasing the best chain is not allowed")]
    CannotEraseBest,
    #[error("Chain {0} not found in the fork container")]
    UnknownChain(usize),
    #[error("Storage failure: {0}")]
    Storage(#[from] ChainStorageError),
}
