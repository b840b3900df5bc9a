// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! The catalog: five LMDB tables backing the file store and the ledger.
//!
//! | table   | key                  | value                                               |
//! |---------|----------------------|-----------------------------------------------------|
//! | default | block hash           | VARINT height ‖ u32 blk offset ‖ u32 vtx offset     |
//! | ms      | u64 height (BE)      | milestone hash ‖ FilePos(BLK) ‖ FilePos(VTX)        |
//! | utxo    | UTXO key             | encoded UTXO                                        |
//! | reg     | peer-chain head hash | last registration hash                              |
//! | info    | ASCII name           | variable                                            |
//!
//! Offsets in the default table are relative to the position of the milestone anchoring the
//! block's level set; a block is a milestone iff both offsets are zero.

use std::{collections::HashMap, path::Path};

use epic_common_types::Hash;
use epic_storage::{LMDBBuilder, LMDBDatabase, LMDBStore};

use crate::{
    chain_storage::{error::ChainStorageError, file_utils::FilePos},
    codec::{ByteReader, Decodable, Encodable, WriteExt},
    dag::RegChange,
    transactions::Utxo,
};

/// Names of the recovery records in the info table.
pub mod info_keys {
    pub const BLK_EPOCH: &str = "blkE";
    pub const BLK_NAME: &str = "blkN";
    pub const BLK_SIZE: &str = "blkS";
    pub const VTX_EPOCH: &str = "vtxE";
    pub const VTX_NAME: &str = "vtxN";
    pub const VTX_SIZE: &str = "vtxS";
    pub const HEAD_HEIGHT: &str = "headHeight";
    pub const CHAINWORK: &str = "chainwork";
    pub const MINER_HEAD: &str = "minerHead";
}

const TABLE_DEFAULT: &str = "default";
const TABLE_MS: &str = "ms";
const TABLE_UTXO: &str = "utxo";
const TABLE_REG: &str = "reg";
const TABLE_INFO: &str = "info";

pub struct DbStore {
    store: LMDBStore,
    default: LMDBDatabase,
    ms: LMDBDatabase,
    utxo: LMDBDatabase,
    reg: LMDBDatabase,
    info: LMDBDatabase,
}

impl DbStore {
    pub fn open(path: &Path, size_mb: usize) -> Result<Self, ChainStorageError> {
        std::fs::create_dir_all(path)?;
        let store = LMDBBuilder::new()
            .set_path(path)
            .set_environment_size(size_mb)
            .add_database(TABLE_DEFAULT)
            .add_database(TABLE_MS)
            .add_database(TABLE_UTXO)
            .add_database(TABLE_REG)
            .add_database(TABLE_INFO)
            .build()?;
        Ok(Self {
            default: store.get_handle(TABLE_DEFAULT)?,
            ms: store.get_handle(TABLE_MS)?,
            utxo: store.get_handle(TABLE_UTXO)?,
            reg: store.get_handle(TABLE_REG)?,
            info: store.get_handle(TABLE_INFO)?,
            store,
        })
    }

    /// Force the environment buffers to disk.
    pub fn flush(&self) -> Result<(), ChainStorageError> {
        self.store.flush()?;
        Ok(())
    }

    // --- default table ---

    pub fn exists(&self, block_hash: &Hash) -> Result<bool, ChainStorageError> {
        Ok(self.default.contains_key(block_hash.as_bytes())?)
    }

    pub fn write_vertex_pos(
        &self,
        block_hash: &Hash,
        height: u64,
        blk_offset: u32,
        vtx_offset: u32,
    ) -> Result<(), ChainStorageError> {
        let mut value = Vec::with_capacity(16);
        value.put_var_int(height);
        value.put_u32(blk_offset);
        value.put_u32(vtx_offset);
        self.default.insert(block_hash.as_bytes(), &value)?;
        Ok(())
    }

    /// `(height, blk offset, vtx offset)` of a stored block, offsets relative to its milestone.
    pub fn get_vertex_offsets(&self, block_hash: &Hash) -> Result<Option<(u64, u32, u32)>, ChainStorageError> {
        let value = match self.default.get(block_hash.as_bytes())? {
            Some(v) => v,
            None => return Ok(None),
        };
        let mut reader = ByteReader::new(&value);
        let height = reader.read_var_int()?;
        let blk_offset = reader.read_u32()?;
        let vtx_offset = reader.read_u32()?;
        Ok(Some((height, blk_offset, vtx_offset)))
    }

    pub fn get_height(&self, block_hash: &Hash) -> Result<Option<u64>, ChainStorageError> {
        Ok(self.get_vertex_offsets(block_hash)?.map(|(h, _, _)| h))
    }

    pub fn is_milestone(&self, block_hash: &Hash) -> Result<bool, ChainStorageError> {
        Ok(self
            .get_vertex_offsets(block_hash)?
            .map(|(_, blk, vtx)| blk == 0 && vtx == 0)
            .unwrap_or(false))
    }

    pub fn delete_vertex_pos(&self, block_hash: &Hash) -> Result<(), ChainStorageError> {
        self.default.delete(block_hash.as_bytes())?;
        Ok(())
    }

    /// Absolute file positions of a stored block, resolved through its milestone entry.
    pub fn get_vertex_pos(&self, block_hash: &Hash) -> Result<Option<(FilePos, FilePos)>, ChainStorageError> {
        let (height, blk_offset, vtx_offset) = match self.get_vertex_offsets(block_hash)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let (_, mut blk_pos, mut vtx_pos) = match self.get_ms_pos(height)? {
            Some(v) => v,
            None => return Ok(None),
        };
        blk_pos.offset += blk_offset;
        vtx_pos.offset += vtx_offset;
        Ok(Some((blk_pos, vtx_pos)))
    }

    // --- ms table ---

    pub fn write_ms_pos(
        &self,
        height: u64,
        ms_hash: &Hash,
        blk_pos: &FilePos,
        vtx_pos: &FilePos,
    ) -> Result<(), ChainStorageError> {
        let mut value = Vec::with_capacity(Hash::SIZE + 12);
        value.put_hash(ms_hash);
        blk_pos.encode_into(&mut value);
        vtx_pos.encode_into(&mut value);
        self.ms.insert(&height.to_be_bytes(), &value)?;
        Ok(())
    }

    pub fn get_ms_pos(&self, height: u64) -> Result<Option<(Hash, FilePos, FilePos)>, ChainStorageError> {
        let value = match self.ms.get(&height.to_be_bytes())? {
            Some(v) => v,
            None => return Ok(None),
        };
        let mut reader = ByteReader::new(&value);
        let hash = reader.read_hash()?;
        let blk_pos = FilePos::decode(&mut reader)?;
        let vtx_pos = FilePos::decode(&mut reader)?;
        Ok(Some((hash, blk_pos, vtx_pos)))
    }

    pub fn get_ms_hash_at(&self, height: u64) -> Result<Option<Hash>, ChainStorageError> {
        Ok(self.get_ms_pos(height)?.map(|(hash, _, _)| hash))
    }

    /// Remove a milestone entry; the default entry of the milestone block cascades.
    pub fn delete_ms_pos(&self, height: u64) -> Result<(), ChainStorageError> {
        if let Some((hash, _, _)) = self.get_ms_pos(height)? {
            self.default.delete(hash.as_bytes())?;
        }
        self.ms.delete(&height.to_be_bytes())?;
        Ok(())
    }

    // --- utxo table ---

    pub fn exists_utxo(&self, key: &Hash) -> Result<bool, ChainStorageError> {
        Ok(self.utxo.contains_key(key.as_bytes())?)
    }

    pub fn get_utxo(&self, key: &Hash) -> Result<Option<Utxo>, ChainStorageError> {
        match self.utxo.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(Utxo::decode_exact(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn write_utxo(&self, key: &Hash, utxo: &Utxo) -> Result<(), ChainStorageError> {
        self.utxo.insert(key.as_bytes(), &utxo.encode())?;
        Ok(())
    }

    pub fn remove_utxo(&self, key: &Hash) -> Result<(), ChainStorageError> {
        self.utxo.delete(key.as_bytes())?;
        Ok(())
    }

    // --- reg table ---

    pub fn get_last_reg(&self, head: &Hash) -> Result<Option<Hash>, ChainStorageError> {
        match self.reg.get(head.as_bytes())? {
            Some(bytes) => Ok(Some(Hash::try_from_slice(&bytes).map_err(|_| {
                ChainStorageError::Codec(crate::codec::CodecError::InvalidField("reg value"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn get_all_reg(&self) -> Result<HashMap<Hash, Hash>, ChainStorageError> {
        let mut result = HashMap::new();
        let mut bad = false;
        self.reg.for_each(|k, v| {
            match (Hash::try_from_slice(k), Hash::try_from_slice(v)) {
                (Ok(key), Ok(value)) => {
                    result.insert(key, value);
                },
                _ => bad = true,
            }
        })?;
        if bad {
            return Err(ChainStorageError::Codec(crate::codec::CodecError::InvalidField(
                "reg table entry",
            )));
        }
        Ok(result)
    }

    /// Apply a registration delta: removed pairs deleted, created pairs written.
    pub fn update_reg(&self, change: &RegChange) -> Result<(), ChainStorageError> {
        for (head, _) in change.removed() {
            self.reg.delete(head.as_bytes())?;
        }
        for (head, last) in change.created() {
            self.reg.insert(head.as_bytes(), last.as_bytes())?;
        }
        Ok(())
    }

    /// Reverse a previously applied registration delta exactly.
    pub fn roll_back_reg(&self, change: &RegChange) -> Result<(), ChainStorageError> {
        self.update_reg(&change.inverted())
    }

    // --- info table ---

    pub fn write_info(&self, key: &str, value: &[u8]) -> Result<(), ChainStorageError> {
        self.info.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn get_info(&self, key: &str) -> Result<Option<Vec<u8>>, ChainStorageError> {
        Ok(self.info.get(key.as_bytes())?)
    }

    pub fn write_info_u32(&self, key: &str, value: u32) -> Result<(), ChainStorageError> {
        self.write_info(key, &value.to_le_bytes())
    }

    pub fn get_info_u32(&self, key: &str) -> Result<u32, ChainStorageError> {
        Ok(self
            .get_info(key)?
            .and_then(|b| b.try_into().ok().map(u32::from_le_bytes))
            .unwrap_or(0))
    }

    pub fn write_info_u64(&self, key: &str, value: u64) -> Result<(), ChainStorageError> {
        self.write_info(key, &value.to_le_bytes())
    }

    pub fn get_info_u64(&self, key: &str) -> Result<u64, ChainStorageError> {
        Ok(self
            .get_info(key)?
            .and_then(|b| b.try_into().ok().map(u64::from_le_bytes))
            .unwrap_or(0))
    }

    pub fn write_info_hash(&self, key: &str, value: &Hash) -> Result<(), ChainStorageError> {
        self.write_info(key, value.as_bytes())
    }

    pub fn get_info_hash(&self, key: &str) -> Result<Hash, ChainStorageError> {
        Ok(self
            .get_info(key)?
            .and_then(|b| Hash::try_from_slice(&b).ok())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn open_db() -> (tempfile::TempDir, DbStore) {
        let tmp = tempfile::tempdir().unwrap();
        let db = DbStore::open(tmp.path(), 16).unwrap();
        (tmp, db)
    }

    #[test]
    fn vertex_offsets_round_trip() {
        let (_tmp, db) = open_db();
        let hash = Hash::sha256(b"block");
        db.write_vertex_pos(&hash, 42, 100, 24).unwrap();
        assert_eq!(db.get_vertex_offsets(&hash).unwrap(), Some((42, 100, 24)));
        assert_eq!(db.get_height(&hash).unwrap(), Some(42));
        assert!(!db.is_milestone(&hash).unwrap());
        assert!(db.exists(&hash).unwrap());
    }

    #[test]
    fn milestone_detection_and_cascade_delete() {
        let (_tmp, db) = open_db();
        let ms_hash = Hash::sha256(b"milestone");
        db.write_vertex_pos(&ms_hash, 7, 0, 0).unwrap();
        db.write_ms_pos(7, &ms_hash, &FilePos::new(0, 0, 4), &FilePos::new(0, 0, 4))
            .unwrap();
        assert!(db.is_milestone(&ms_hash).unwrap());
        assert_eq!(db.get_ms_hash_at(7).unwrap(), Some(ms_hash));

        db.delete_ms_pos(7).unwrap();
        assert_eq!(db.get_ms_pos(7).unwrap(), None);
        assert!(!db.exists(&ms_hash).unwrap());
    }

    #[test]
    fn absolute_positions_resolve_through_milestone() {
        let (_tmp, db) = open_db();
        let ms_hash = Hash::sha256(b"ms");
        let blk_hash = Hash::sha256(b"blk");
        db.write_ms_pos(3, &ms_hash, &FilePos::new(0, 1, 4), &FilePos::new(0, 2, 8))
            .unwrap();
        db.write_vertex_pos(&blk_hash, 3, 50, 10).unwrap();
        let (blk_pos, vtx_pos) = db.get_vertex_pos(&blk_hash).unwrap().unwrap();
        assert_eq!(blk_pos, FilePos::new(0, 1, 54));
        assert_eq!(vtx_pos, FilePos::new(0, 2, 18));
    }

    #[test]
    fn reg_apply_then_rollback_restores_state() {
        let (_tmp, db) = open_db();
        let head = Hash::sha256(b"head");
        let old = Hash::sha256(b"old");
        let new = Hash::sha256(b"new");
        db.update_reg(&{
            let mut c = RegChange::new();
            c.create(head, old);
            c
        })
        .unwrap();

        let mut advance = RegChange::new();
        advance.remove(head, old);
        advance.create(head, new);
        db.update_reg(&advance).unwrap();
        assert_eq!(db.get_last_reg(&head).unwrap(), Some(new));

        db.roll_back_reg(&advance).unwrap();
        assert_eq!(db.get_last_reg(&head).unwrap(), Some(old));
    }

    #[test]
    fn info_round_trips() {
        let (_tmp, db) = open_db();
        db.write_info_u32(info_keys::BLK_NAME, 9).unwrap();
        db.write_info_u64(info_keys::HEAD_HEIGHT, 1234).unwrap();
        let hash = Hash::sha256(b"miner");
        db.write_info_hash(info_keys::MINER_HEAD, &hash).unwrap();

        assert_eq!(db.get_info_u32(info_keys::BLK_NAME).unwrap(), 9);
        assert_eq!(db.get_info_u64(info_keys::HEAD_HEIGHT).unwrap(), 1234);
        assert_eq!(db.get_info_hash(info_keys::MINER_HEAD).unwrap(), hash);
        // absent keys default to zero values
        assert_eq!(db.get_info_u32(info_keys::VTX_NAME).unwrap(), 0);
    }
}
