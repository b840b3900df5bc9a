// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! Persistent storage: append-only BLK/VTX files partitioned by milestone height, and the
//! LMDB-backed catalog mapping hashes and heights to file positions, UTXOs, registrations and
//! recovery info.

mod block_store;
mod db_store;
mod error;
mod file_utils;

pub use block_store::BlockStore;
pub use db_store::{info_keys, DbStore};
pub use error::ChainStorageError;
pub use file_utils::{
    delete_invalid_files, file_path, validate_checksum, write_checksum, FileModifier, FilePos, FileReader, FileType,
    FileWriter, CHECKSUM_SIZE,
};
