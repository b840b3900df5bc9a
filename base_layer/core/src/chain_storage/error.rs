// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum ChainStorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Key-value store error: {0}")]
    KeyValue(#[from] epic_storage::StorageError),
    #[error("Corrupt record: {0}")]
    Codec(#[from] CodecError),
    #[error("File checksum mismatch in {0}")]
    ChecksumMismatch(String),
    #[error("Record not found: {0}")]
    NotFound(&'static str),
    #[error("In-place modification would change the record length ({old} -> {new})")]
    LengthChanged { old: usize, new: usize },
}
