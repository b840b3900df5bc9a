// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Cannot create LMDB environment: {0}")]
    InternalError(String),
    #[error("An error occurred with the underlying data store implementation: {0}")]
    DataStoreError(#[from] lmdb_zero::Error),
    #[error("The database '{0}' does not exist")]
    UnknownDatabase(String),
    #[error("An IO error occurred: {0}")]
    IoError(#[from] std::io::Error),
}
