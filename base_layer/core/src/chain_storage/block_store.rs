// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::{path::PathBuf, sync::Arc};

use epic_common::StorageConfig;
use epic_common_types::Hash;
use log::*;
use parking_lot::Mutex;
use primitive_types::U256;

use crate::{
    blocks::Block,
    chain_storage::{
        db_store::{info_keys, DbStore},
        error::ChainStorageError,
        file_utils::{
            delete_invalid_files, FileModifier, FilePos, FileReader, FileType, FileWriter, CHECKSUM_SIZE,
        },
    },
    codec::{ByteReader, Decodable, Encodable},
    dag::{Milestone, MilestoneRecord, RegChange, Vertex},
    transactions::Utxo,
};

const LOG_TARGET: &str = "c::storage::block_store";

/// How many files past the last known milestone a boundless range read will visit.
const MAX_TAIL_FILES: usize = 20;

struct Cursors {
    blk: FilePos,
    vtx: FilePos,
}

/// The persistent block/vertex store: append-only level-set files plus the catalog.
///
/// Writes are serialized on the DAG verify thread; the cursor lock only guards against readers
/// observing a half-advanced cursor pair.
pub struct BlockStore {
    root: PathBuf,
    file_capacity: u32,
    epoch_capacity: u32,
    db: DbStore,
    cursors: Mutex<Cursors>,
}

impl BlockStore {
    /// Open the store, restore the write cursors and run the truncation sweep: any file beyond
    /// the committed cursors is removed and the tail file is truncated to the committed offset.
    pub fn open(config: &StorageConfig) -> Result<Self, ChainStorageError> {
        let root = config.data_dir.clone();
        std::fs::create_dir_all(&root)?;
        let db = DbStore::open(&root.join("db"), config.db_size_mb)?;

        let blk = FilePos::new(
            db.get_info_u32(info_keys::BLK_EPOCH)?,
            db.get_info_u32(info_keys::BLK_NAME)?,
            db.get_info_u32(info_keys::BLK_SIZE)?.max(CHECKSUM_SIZE),
        );
        let vtx = FilePos::new(
            db.get_info_u32(info_keys::VTX_EPOCH)?,
            db.get_info_u32(info_keys::VTX_NAME)?,
            db.get_info_u32(info_keys::VTX_SIZE)?.max(CHECKSUM_SIZE),
        );

        delete_invalid_files(&root, FileType::Blk, &blk)?;
        delete_invalid_files(&root, FileType::Vtx, &vtx)?;

        // after the sweep the tail files must be internally consistent; if they still fail the
        // checksum the committed region itself is damaged and there is nothing left to repair to
        for (file_type, pos) in [(FileType::Blk, &blk), (FileType::Vtx, &vtx)] {
            let path = crate::chain_storage::file_utils::file_path(&root, file_type, pos);
            if path.exists() && !crate::chain_storage::file_utils::validate_checksum(&root, file_type, pos)? {
                return Err(ChainStorageError::ChecksumMismatch(path.display().to_string()));
            }
        }

        info!(
            target: LOG_TARGET,
            "Block store opened at {} (blk cursor {}, vtx cursor {})",
            root.display(),
            blk,
            vtx
        );
        Ok(Self {
            root,
            file_capacity: config.file_capacity,
            epoch_capacity: config.epoch_capacity,
            db,
            cursors: Mutex::new(Cursors { blk, vtx }),
        })
    }

    pub fn db(&self) -> &DbStore {
        &self.db
    }

    pub fn exists(&self, block_hash: &Hash) -> bool {
        self.db.exists(block_hash).unwrap_or(false)
    }

    pub fn is_milestone(&self, block_hash: &Hash) -> bool {
        self.db.is_milestone(block_hash).unwrap_or(false)
    }

    pub fn get_height(&self, block_hash: &Hash) -> Option<u64> {
        self.db.get_height(block_hash).ok().flatten()
    }

    // --- level set writes ---

    /// Append a confirmed level set: the milestone block first, then the remaining blocks in the
    /// snapshot's canonical order. Per-block catalog entries carry offsets relative to the
    /// milestone's position; the milestone entry itself is written last so a crash before it
    /// leaves no reachable partial level set. The snapshot's UTXO and registration deltas are
    /// committed to the catalog in the same pass.
    pub fn store_level_set(&self, ms: &Milestone) -> Result<(), ChainStorageError> {
        let mut cursors = self.cursors.lock();

        // size up the batch to decide on file carry-over
        let mut blk_total: u32 = 0;
        let mut vtx_total: u32 = 0;
        for hash in &ms.level_set {
            let vertex = ms
                .vertices
                .get(hash)
                .ok_or(ChainStorageError::NotFound("level set vertex"))?
                .read();
            blk_total += vertex.block.optimal_encoding_size() as u32;
            vtx_total += self.vertex_record_size(&vertex, ms) as u32;
        }
        cursors.blk = self.carry_over(cursors.blk, blk_total, FileType::Blk, info_keys::BLK_EPOCH, info_keys::BLK_NAME)?;
        cursors.vtx = self.carry_over(cursors.vtx, vtx_total, FileType::Vtx, info_keys::VTX_EPOCH, info_keys::VTX_NAME)?;

        let ms_blk_pos = cursors.blk;
        let ms_vtx_pos = cursors.vtx;
        let mut blk_writer = FileWriter::open(&self.root, FileType::Blk, &ms_blk_pos)?;
        let mut vtx_writer = FileWriter::open(&self.root, FileType::Vtx, &ms_vtx_pos)?;

        for hash in &ms.level_set {
            let vertex = ms.vertices.get(hash).expect("checked above").read();
            let blk_offset = blk_writer.offset() - ms_blk_pos.offset;
            let vtx_offset = vtx_writer.offset() - ms_vtx_pos.offset;

            blk_writer.append(&vertex.block.encode())?;
            vtx_writer.append(&self.encode_vertex_record(&vertex, ms))?;

            self.db.write_vertex_pos(hash, ms.height, blk_offset, vtx_offset)?;
        }
        blk_writer.flush()?;
        vtx_writer.flush()?;

        self.db.write_ms_pos(ms.height, &ms.hash(), &ms_blk_pos, &ms_vtx_pos)?;

        cursors.blk.offset = blk_writer.offset();
        cursors.vtx.offset = vtx_writer.offset();
        drop(blk_writer);
        drop(vtx_writer);

        self.db.write_info_u32(info_keys::BLK_SIZE, cursors.blk.offset)?;
        self.db.write_info_u32(info_keys::VTX_SIZE, cursors.vtx.offset)?;
        self.save_head_height(ms.height)?;
        self.save_chainwork(ms.chainwork)?;

        // ledger deltas exit the cached window together with the level set
        for key in ms.spent_utxos.keys() {
            self.db.remove_utxo(key)?;
        }
        for (key, utxo) in &ms.created_utxos {
            self.db.write_utxo(key, utxo)?;
        }
        self.db.update_reg(&ms.reg_change)?;

        trace!(
            target: LOG_TARGET,
            "Storing LVS with MS hash {} of height {} at {}",
            ms.hash().to_substr(),
            ms.height,
            ms_blk_pos
        );
        Ok(())
    }

    fn carry_over(
        &self,
        pos: FilePos,
        addition: u32,
        _file_type: FileType,
        epoch_key: &str,
        name_key: &str,
    ) -> Result<FilePos, ChainStorageError> {
        if pos.offset > CHECKSUM_SIZE && pos.offset + addition > self.file_capacity {
            let next = pos.next_file(self.epoch_capacity);
            self.db.write_info_u32(epoch_key, next.epoch)?;
            self.db.write_info_u32(name_key, next.name)?;
            return Ok(next);
        }
        Ok(pos)
    }

    fn vertex_record_size(&self, vertex: &Vertex, ms: &Milestone) -> usize {
        let mut size = vertex.optimal_storage_size();
        if vertex.is_milestone {
            size += MilestoneRecord::from(ms).encode().len();
        }
        size
    }

    fn encode_vertex_record(&self, vertex: &Vertex, ms: &Milestone) -> Vec<u8> {
        let mut buf = vertex.encode();
        if vertex.is_milestone {
            MilestoneRecord::from(ms).encode_into(&mut buf);
        }
        buf
    }

    // --- reads ---

    /// Raw concatenated BLK or VTX bytes covering heights `[lo, hi]`.
    pub fn read_range(&self, lo: u64, hi: u64, file_type: FileType) -> Result<Vec<u8>, ChainStorageError> {
        debug_assert!(lo <= hi);
        let pick = |entry: (Hash, FilePos, FilePos)| match file_type {
            FileType::Blk => entry.1,
            FileType::Vtx => entry.2,
        };
        let left = match self.db.get_ms_pos(lo)? {
            Some(entry) => pick(entry),
            None => return Ok(Vec::new()),
        };
        let right = self.db.get_ms_pos(hi + 1)?.map(pick);

        let mut result = Vec::new();
        let mut reader = FileReader::open(&self.root, file_type, &left)?;
        match right {
            Some(right) if left.same_file_as(&right) => {
                result.extend(reader.read_exact((right.offset - left.offset) as usize)?);
            },
            Some(right) => {
                result.extend(reader.read_to_end()?);
                let mut file = left.next_file(self.epoch_capacity);
                while !file.same_file_as(&right) {
                    let mut cursor = FileReader::open(&self.root, file_type, &file)?;
                    result.extend(cursor.read_to_end()?);
                    file = file.next_file(self.epoch_capacity);
                }
                let mut cursor = FileReader::open(&self.root, file_type, &FilePos::new(right.epoch, right.name, CHECKSUM_SIZE))?;
                result.extend(cursor.read_exact((right.offset - CHECKSUM_SIZE) as usize)?);
            },
            None => {
                result.extend(reader.read_to_end()?);
                let mut file = left.next_file(self.epoch_capacity);
                let mut visited = 0;
                while visited < MAX_TAIL_FILES {
                    match FileReader::open(&self.root, file_type, &file) {
                        Ok(mut cursor) => result.extend(cursor.read_to_end()?),
                        Err(_) => break,
                    }
                    file = file.next_file(self.epoch_capacity);
                    visited += 1;
                }
            },
        }
        Ok(result)
    }

    /// All blocks of the level set at `height`, milestone first.
    pub fn get_level_set_blocks_at(&self, height: u64) -> Result<Vec<Arc<Block>>, ChainStorageError> {
        let bytes = self.read_range(height, height, FileType::Blk)?;
        let mut reader = ByteReader::new(&bytes);
        let mut blocks = Vec::new();
        while !reader.is_empty() {
            blocks.push(Arc::new(Block::decode(&mut reader)?));
        }
        Ok(blocks)
    }

    /// All vertices of the level set at `height`, paired with their blocks, milestone first.
    pub fn get_level_set_vertices_at(
        &self,
        height: u64,
    ) -> Result<Vec<(Vertex, Option<MilestoneRecord>)>, ChainStorageError> {
        let blocks = self.get_level_set_blocks_at(height)?;
        let bytes = self.read_range(height, height, FileType::Vtx)?;
        let mut reader = ByteReader::new(&bytes);
        let mut vertices = Vec::with_capacity(blocks.len());
        for block in blocks {
            let vertex = Vertex::decode_with_block(&mut reader, block)?;
            let record = if vertex.is_milestone {
                Some(MilestoneRecord::decode(&mut reader)?)
            } else {
                None
            };
            vertices.push((vertex, record));
        }
        Ok(vertices)
    }

    /// A single stored vertex with its block.
    pub fn get_vertex(&self, block_hash: &Hash) -> Result<Option<(Vertex, Option<MilestoneRecord>)>, ChainStorageError> {
        let (blk_pos, vtx_pos) = match self.db.get_vertex_pos(block_hash)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let mut blk_reader = FileReader::open(&self.root, FileType::Blk, &blk_pos)?;
        let blk_bytes = blk_reader.read_to_end()?;
        let mut reader = ByteReader::new(&blk_bytes);
        let block = Arc::new(Block::decode(&mut reader)?);

        let mut vtx_reader = FileReader::open(&self.root, FileType::Vtx, &vtx_pos)?;
        let vtx_bytes = vtx_reader.read_to_end()?;
        let mut reader = ByteReader::new(&vtx_bytes);
        let vertex = Vertex::decode_with_block(&mut reader, block)?;
        let record = if vertex.is_milestone {
            Some(MilestoneRecord::decode(&mut reader)?)
        } else {
            None
        };
        Ok(Some((vertex, record)))
    }

    pub fn get_block(&self, block_hash: &Hash) -> Result<Option<Arc<Block>>, ChainStorageError> {
        Ok(self.get_vertex(block_hash)?.map(|(v, _)| v.block))
    }

    /// Patch a stored vertex in place. Only mutations that keep the encoded length (redemption
    /// status, validity bits) are admissible; anything else is rejected.
    pub fn modify_vertex(
        &self,
        block_hash: &Hash,
        mutate: impl FnOnce(&mut Vertex),
    ) -> Result<(), ChainStorageError> {
        let (_, vtx_pos) = self
            .db
            .get_vertex_pos(block_hash)?
            .ok_or(ChainStorageError::NotFound("vertex to modify"))?;

        let (mut vertex, record) = self
            .get_vertex(block_hash)?
            .ok_or(ChainStorageError::NotFound("vertex to modify"))?;
        let mut old = vertex.encode();
        if let Some(ref r) = record {
            r.encode_into(&mut old);
        }
        mutate(&mut vertex);
        let mut new = vertex.encode();
        if let Some(ref r) = record {
            r.encode_into(&mut new);
        }
        let mut modifier = FileModifier::open(&self.root, FileType::Vtx, &vtx_pos)?;
        modifier.rewrite(old.len(), &new)
    }

    // --- info passthrough ---

    pub fn head_height(&self) -> u64 {
        self.db.get_info_u64(info_keys::HEAD_HEIGHT).unwrap_or(0)
    }

    pub fn save_head_height(&self, height: u64) -> Result<(), ChainStorageError> {
        self.db.write_info_u64(info_keys::HEAD_HEIGHT, height)
    }

    pub fn best_chainwork(&self) -> U256 {
        self.db
            .get_info_hash(info_keys::CHAINWORK)
            .map(|h| h.to_u256())
            .unwrap_or_default()
    }

    pub fn save_chainwork(&self, chainwork: U256) -> Result<(), ChainStorageError> {
        self.db
            .write_info_hash(info_keys::CHAINWORK, &Hash::from_u256(chainwork))
    }

    pub fn miner_chain_head(&self) -> Hash {
        self.db.get_info_hash(info_keys::MINER_HEAD).unwrap_or_default()
    }

    pub fn save_miner_chain_head(&self, head: &Hash) -> Result<(), ChainStorageError> {
        self.db.write_info_hash(info_keys::MINER_HEAD, head)
    }

    // --- ledger passthrough ---

    pub fn get_utxo(&self, key: &Hash) -> Option<Utxo> {
        self.db.get_utxo(key).ok().flatten()
    }

    pub fn exists_utxo(&self, key: &Hash) -> bool {
        self.db.exists_utxo(key).unwrap_or(false)
    }

    pub fn get_last_reg(&self, head: &Hash) -> Option<Hash> {
        self.db.get_last_reg(head).ok().flatten()
    }

    pub fn update_reg(&self, change: &RegChange) -> Result<(), ChainStorageError> {
        self.db.update_reg(change)
    }

    /// Spawn the periodic backup thread: syncs the catalog to disk every `interval` until the
    /// shutdown signal fires.
    pub fn start_periodic_backup(
        self: &Arc<Self>,
        interval: std::time::Duration,
        shutdown: epic_shutdown::ShutdownSignal,
    ) -> std::thread::JoinHandle<()> {
        let store = self.clone();
        std::thread::Builder::new()
            .name("storage-backup".into())
            .spawn(move || {
                while !shutdown.wait_timeout(interval) {
                    if let Err(e) = store.db.flush() {
                        warn!(target: LOG_TARGET, "Periodic catalog sync failed: {}", e);
                    } else {
                        trace!(target: LOG_TARGET, "Catalog synced to disk");
                    }
                }
            })
            .expect("spawn storage-backup")
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use parking_lot::RwLock;

    use super::*;
    use crate::{
        blocks::genesis_block,
        dag::RedemptionStatus,
        test_helpers::build_block,
    };

    fn store() -> (tempfile::TempDir, BlockStore) {
        let tmp = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let store = BlockStore::open(&config).unwrap();
        (tmp, store)
    }

    /// A synthetic one-milestone snapshot over the given blocks (first is the milestone).
    fn level_set(height: u64, blocks: Vec<Arc<Block>>) -> Milestone {
        let genesis_vertex = Vertex::new(Arc::new(genesis_block().clone()));
        let mut ms = Milestone::genesis(genesis_vertex);
        ms.height = height;
        ms.level_set.clear();
        ms.vertices = HashMap::new();
        for (i, block) in blocks.into_iter().enumerate() {
            let hash = *block.hash();
            let mut vertex = Vertex::new(block);
            vertex.height = height;
            vertex.is_milestone = i == 0;
            ms.level_set.push(hash);
            ms.vertices.insert(hash, RwLock::new(vertex));
        }
        ms
    }

    #[test]
    fn store_and_reload_level_set() {
        let (_tmp, store) = store();
        let g = *genesis_block().hash();
        let ms_block = build_block(g, g, g, vec![]);
        let other = build_block(g, *ms_block.hash(), g, vec![]);
        let ms = level_set(1, vec![ms_block.clone(), other.clone()]);

        store.store_level_set(&ms).unwrap();

        assert!(store.exists(ms_block.hash()));
        assert!(store.is_milestone(ms_block.hash()));
        assert!(store.exists(other.hash()));
        assert!(!store.is_milestone(other.hash()));
        assert_eq!(store.head_height(), 1);

        let blocks = store.get_level_set_blocks_at(1).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].hash(), ms_block.hash());
        assert_eq!(blocks[1].hash(), other.hash());

        let vertices = store.get_level_set_vertices_at(1).unwrap();
        assert!(vertices[0].0.is_milestone);
        assert!(vertices[0].1.is_some());
        assert!(vertices[1].1.is_none());
    }

    #[test]
    fn single_vertex_lookup() {
        let (_tmp, store) = store();
        let g = *genesis_block().hash();
        let ms_block = build_block(g, g, g, vec![]);
        let ms = level_set(1, vec![ms_block.clone()]);
        store.store_level_set(&ms).unwrap();

        let (vertex, record) = store.get_vertex(ms_block.hash()).unwrap().unwrap();
        assert_eq!(vertex.block.hash(), ms_block.hash());
        assert_eq!(record.unwrap().height, 1);
    }

    #[test]
    fn modify_vertex_flips_redemption_in_place() {
        let (_tmp, store) = store();
        let g = *genesis_block().hash();
        let ms_block = build_block(g, g, g, vec![]);
        let ms = level_set(1, vec![ms_block.clone()]);
        ms.vertices
            .get(ms_block.hash())
            .unwrap()
            .write()
            .redemption_status = RedemptionStatus::NotYet;
        store.store_level_set(&ms).unwrap();

        store
            .modify_vertex(ms_block.hash(), |v| {
                v.redemption_status = RedemptionStatus::IsRedeemed;
            })
            .unwrap();
        let (vertex, _) = store.get_vertex(ms_block.hash()).unwrap().unwrap();
        assert_eq!(vertex.redemption_status, RedemptionStatus::IsRedeemed);
    }

    #[test]
    fn cursors_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let g = *genesis_block().hash();
        let ms_block = build_block(g, g, g, vec![]);
        {
            let store = BlockStore::open(&config).unwrap();
            let ms = level_set(1, vec![ms_block.clone()]);
            store.store_level_set(&ms).unwrap();
        }
        let store = BlockStore::open(&config).unwrap();
        assert!(store.exists(ms_block.hash()));
        assert_eq!(store.head_height(), 1);

        // a second level set appends after the first
        let next = build_block(*ms_block.hash(), g, g, vec![]);
        let ms2 = level_set(2, vec![next.clone()]);
        store.store_level_set(&ms2).unwrap();
        assert_eq!(store.get_level_set_blocks_at(2).unwrap().len(), 1);
        // the first level set is still intact
        assert_eq!(store.get_level_set_blocks_at(1).unwrap().len(), 1);
    }

    #[test]
    fn read_range_spans_heights() {
        let (_tmp, store) = store();
        let g = *genesis_block().hash();
        let b1 = build_block(g, g, g, vec![]);
        let b2 = build_block(*b1.hash(), g, g, vec![]);
        store.store_level_set(&level_set(1, vec![b1.clone()])).unwrap();
        store.store_level_set(&level_set(2, vec![b2.clone()])).unwrap();

        let bytes = store.read_range(1, 2, FileType::Blk).unwrap();
        let mut reader = ByteReader::new(&bytes);
        let first = Block::decode(&mut reader).unwrap();
        let second = Block::decode(&mut reader).unwrap();
        assert!(reader.is_empty());
        assert_eq!(first.hash(), b1.hash());
        assert_eq!(second.hash(), b2.hash());
    }

    #[test]
    fn truncation_sweep_runs_on_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let g = *genesis_block().hash();
        let b1 = build_block(g, g, g, vec![]);
        {
            let store = BlockStore::open(&config).unwrap();
            store.store_level_set(&level_set(1, vec![b1.clone()])).unwrap();
        }
        // simulate a crash that appended bytes after the committed cursor
        {
            let committed = FilePos::new(0, 0, 0);
            let path = super::super::file_utils::file_path(tmp.path(), FileType::Blk, &committed);
            let mut bytes = std::fs::read(&path).unwrap();
            let committed_len = bytes.len();
            bytes.extend_from_slice(b"partial garbage record");
            std::fs::write(&path, bytes).unwrap();

            let store = BlockStore::open(&config).unwrap();
            assert_eq!(
                std::fs::metadata(&path).unwrap().len(),
                committed_len as u64
            );
            // and the level set still decodes
            assert_eq!(store.get_level_set_blocks_at(1).unwrap().len(), 1);
        }
    }
}
