// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! BLK/VTX file plumbing. Files live under `<root>/<TYPE>/E<epoch>/<TYPE><name>.dat`; the first
//! four bytes of every file are a CRC32 over all subsequent bytes. The checksum may only be
//! extended by appending bytes; any rewrite that changes payload length is refused.

use std::{
    fs,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::*;

use crate::{
    chain_storage::error::ChainStorageError,
    codec::{ByteReader, CodecError, Decodable, Encodable, WriteExt},
};

const LOG_TARGET: &str = "c::storage::file";

/// Bytes reserved for the leading checksum.
pub const CHECKSUM_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Blk,
    Vtx,
}

impl FileType {
    pub fn dir_name(self) -> &'static str {
        match self {
            FileType::Blk => "BLK",
            FileType::Vtx => "VTX",
        }
    }
}

/// Position of a record: epoch directory, file name within the epoch, byte offset in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilePos {
    pub epoch: u32,
    pub name: u32,
    pub offset: u32,
}

impl FilePos {
    pub fn new(epoch: u32, name: u32, offset: u32) -> Self {
        Self { epoch, name, offset }
    }

    pub fn same_file_as(&self, other: &FilePos) -> bool {
        self.epoch == other.epoch && self.name == other.name
    }

    /// Advance to the first record slot of the next file.
    pub fn next_file(mut self, epoch_capacity: u32) -> FilePos {
        if self.name + 1 >= epoch_capacity {
            self.name = 0;
            self.epoch += 1;
        } else {
            self.name += 1;
        }
        self.offset = CHECKSUM_SIZE;
        self
    }
}

impl std::fmt::Display for FilePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ epoch {}, name {}, offset {} }}", self.epoch, self.name, self.offset)
    }
}

impl Encodable for FilePos {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_var_int(u64::from(self.epoch));
        buf.put_var_int(u64::from(self.name));
        buf.put_var_int(u64::from(self.offset));
    }
}

impl Decodable for FilePos {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let epoch = u32::try_from(reader.read_var_int()?).map_err(|_| CodecError::InvalidField("epoch"))?;
        let name = u32::try_from(reader.read_var_int()?).map_err(|_| CodecError::InvalidField("name"))?;
        let offset = u32::try_from(reader.read_var_int()?).map_err(|_| CodecError::InvalidField("offset"))?;
        Ok(Self { epoch, name, offset })
    }
}

pub fn epoch_path(root: &Path, file_type: FileType, epoch: u32) -> PathBuf {
    root.join(file_type.dir_name()).join(format!("E{:06}", epoch))
}

pub fn file_path(root: &Path, file_type: FileType, pos: &FilePos) -> PathBuf {
    epoch_path(root, file_type, pos.epoch).join(format!("{}{:06}.dat", file_type.dir_name(), pos.name))
}

fn crc32_of(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Sequential reader positioned inside one file.
pub struct FileReader {
    file: File,
    path: PathBuf,
}

impl FileReader {
    pub fn open(root: &Path, file_type: FileType, pos: &FilePos) -> Result<Self, ChainStorageError> {
        let path = file_path(root, file_type, pos);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(u64::from(pos.offset)))?;
        Ok(Self { file, path })
    }

    pub fn size(&mut self) -> Result<u64, ChainStorageError> {
        let current = self.file.stream_position()?;
        let size = self.file.seek(SeekFrom::End(0))?;
        self.file.seek(SeekFrom::Start(current))?;
        Ok(size)
    }

    /// Read exactly `n` bytes; a short read means a record was cut off and is surfaced as
    /// corruption to trigger recovery.
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ChainStorageError> {
        let mut buf = vec![0u8; n];
        self.file
            .read_exact(&mut buf)
            .map_err(|_| ChainStorageError::ChecksumMismatch(self.path.display().to_string()))?;
        Ok(buf)
    }

    /// Read all bytes from the current offset to the end of the file.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, ChainStorageError> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Appender for one file. Tracks the running offset; the checksum is restamped on drop.
pub struct FileWriter {
    file: File,
    path: PathBuf,
    offset: u32,
}

impl FileWriter {
    /// Open (creating directories and the checksum slot as needed) for appending at `pos`.
    pub fn open(root: &Path, file_type: FileType, pos: &FilePos) -> Result<Self, ChainStorageError> {
        let dir = epoch_path(root, file_type, pos.epoch);
        fs::create_dir_all(&dir)?;
        let path = file_path(root, file_type, pos);
        let mut file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < u64::from(CHECKSUM_SIZE) {
            file.write_all(&[0u8; CHECKSUM_SIZE as usize])?;
        }
        let offset = pos.offset.max(CHECKSUM_SIZE);
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        Ok(Self { file, path, offset })
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), ChainStorageError> {
        self.file.write_all(bytes)?;
        self.offset += bytes.len() as u32;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ChainStorageError> {
        self.file.flush()?;
        Ok(())
    }

    /// Recompute and stamp the leading CRC over everything after it.
    pub fn restamp_checksum(&mut self) -> Result<(), ChainStorageError> {
        self.file.flush()?;
        self.file.seek(SeekFrom::Start(u64::from(CHECKSUM_SIZE)))?;
        let mut payload = Vec::new();
        self.file.read_to_end(&mut payload)?;
        let checksum = crc32_of(&payload);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&checksum.to_le_bytes())?;
        self.file.seek(SeekFrom::Start(u64::from(self.offset)))?;
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Err(e) = self.restamp_checksum() {
            error!(target: LOG_TARGET, "Failed to restamp checksum on {}: {}", self.path.display(), e);
        }
    }
}

/// Rewrites a record in place. Only same-length rewrites are allowed, and the checksum over the
/// whole file is recomputed afterwards.
pub struct FileModifier {
    file: File,
    pos: FilePos,
}

impl FileModifier {
    pub fn open(root: &Path, file_type: FileType, pos: &FilePos) -> Result<Self, ChainStorageError> {
        let path = file_path(root, file_type, pos);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self { file, pos: *pos })
    }

    /// Overwrite `old_len` bytes at the record offset with `bytes` of the same length.
    pub fn rewrite(&mut self, old_len: usize, bytes: &[u8]) -> Result<(), ChainStorageError> {
        if bytes.len() != old_len {
            return Err(ChainStorageError::LengthChanged {
                old: old_len,
                new: bytes.len(),
            });
        }
        self.file.seek(SeekFrom::Start(u64::from(self.pos.offset)))?;
        self.file.write_all(bytes)?;
        // full recompute: a CRC can only be extended incrementally for appended bytes
        self.file.seek(SeekFrom::Start(u64::from(CHECKSUM_SIZE)))?;
        let mut payload = Vec::new();
        self.file.read_to_end(&mut payload)?;
        let checksum = crc32_of(&payload);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&checksum.to_le_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

/// Validate the leading CRC of the file holding `pos`. Files holding nothing but the checksum
/// slot are vacuously valid.
pub fn validate_checksum(root: &Path, file_type: FileType, pos: &FilePos) -> Result<bool, ChainStorageError> {
    let start = FilePos::new(pos.epoch, pos.name, 0);
    let mut reader = FileReader::open(root, file_type, &start)?;
    let bytes = reader.read_to_end()?;
    if bytes.len() <= CHECKSUM_SIZE as usize {
        return Ok(true);
    }
    let stored = u32::from_le_bytes(bytes[..4].try_into().expect("4 bytes"));
    Ok(stored == crc32_of(&bytes[4..]))
}

/// Stamp the leading CRC of the file holding `pos` from its current contents.
pub fn write_checksum(root: &Path, file_type: FileType, pos: &FilePos) -> Result<(), ChainStorageError> {
    let mut writer = FileWriter::open(root, file_type, &FilePos::new(pos.epoch, pos.name, CHECKSUM_SIZE))?;
    writer.restamp_checksum()
}

/// Startup truncation sweep: delete every file and epoch directory strictly beyond the last
/// committed position, truncate the committed file to the committed offset and restamp its CRC.
pub fn delete_invalid_files(root: &Path, file_type: FileType, committed: &FilePos) -> Result<(), ChainStorageError> {
    let type_dir = root.join(file_type.dir_name());
    if !type_dir.exists() {
        return Ok(());
    }
    for epoch_entry in fs::read_dir(&type_dir)? {
        let epoch_entry = epoch_entry?;
        let epoch_name = epoch_entry.file_name().to_string_lossy().into_owned();
        let epoch: u32 = match epoch_name.strip_prefix('E').and_then(|s| s.parse().ok()) {
            Some(e) => e,
            None => continue,
        };
        if epoch > committed.epoch {
            debug!(target: LOG_TARGET, "Delete invalid directory {}", epoch_name);
            fs::remove_dir_all(epoch_entry.path())?;
            continue;
        }
        if epoch < committed.epoch {
            continue;
        }
        for file_entry in fs::read_dir(epoch_entry.path())? {
            let file_entry = file_entry?;
            let file_name = file_entry.file_name().to_string_lossy().into_owned();
            let name: u32 = match file_name
                .strip_prefix(file_type.dir_name())
                .and_then(|s| s.strip_suffix(".dat"))
                .and_then(|s| s.parse().ok())
            {
                Some(n) => n,
                None => continue,
            };
            if name > committed.name {
                debug!(target: LOG_TARGET, "Delete invalid file {}", file_name);
                fs::remove_file(file_entry.path())?;
            } else if name == committed.name {
                if committed.offset <= CHECKSUM_SIZE {
                    debug!(target: LOG_TARGET, "Delete invalid file {}", file_name);
                    fs::remove_file(file_entry.path())?;
                } else {
                    let actual = file_entry.metadata()?.len();
                    if u64::from(committed.offset) < actual {
                        debug!(target: LOG_TARGET, "Truncate file {} and update its checksum", file_name);
                        let file = OpenOptions::new().write(true).open(file_entry.path())?;
                        file.set_len(u64::from(committed.offset))?;
                        drop(file);
                        write_checksum(root, file_type, committed)?;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_and_validate_checksum() {
        let tmp = tempfile::tempdir().unwrap();
        let pos = FilePos::new(0, 0, CHECKSUM_SIZE);
        {
            let mut writer = FileWriter::open(tmp.path(), FileType::Blk, &pos).unwrap();
            writer.append(b"record one").unwrap();
            writer.append(b"record two").unwrap();
        }
        assert!(validate_checksum(tmp.path(), FileType::Blk, &pos).unwrap());

        // corrupt one payload byte
        let path = file_path(tmp.path(), FileType::Blk, &pos);
        let mut bytes = fs::read(&path).unwrap();
        bytes[6] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        assert!(!validate_checksum(tmp.path(), FileType::Blk, &pos).unwrap());
    }

    #[test]
    fn appending_extends_checksum() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pos = FilePos::new(0, 0, CHECKSUM_SIZE);
        {
            let mut writer = FileWriter::open(tmp.path(), FileType::Blk, &pos).unwrap();
            writer.append(b"first").unwrap();
            pos.offset = writer.offset();
        }
        {
            let mut writer = FileWriter::open(tmp.path(), FileType::Blk, &pos).unwrap();
            writer.append(b"second").unwrap();
        }
        assert!(validate_checksum(tmp.path(), FileType::Blk, &pos).unwrap());
    }

    #[test]
    fn modifier_rejects_length_change() {
        let tmp = tempfile::tempdir().unwrap();
        let pos = FilePos::new(0, 0, CHECKSUM_SIZE);
        {
            let mut writer = FileWriter::open(tmp.path(), FileType::Vtx, &pos).unwrap();
            writer.append(b"abcdef").unwrap();
        }
        let mut modifier = FileModifier::open(tmp.path(), FileType::Vtx, &pos).unwrap();
        assert!(matches!(
            modifier.rewrite(6, b"toolonger"),
            Err(ChainStorageError::LengthChanged { .. })
        ));
        modifier.rewrite(6, b"ABCDEF").unwrap();
        assert!(validate_checksum(tmp.path(), FileType::Vtx, &pos).unwrap());

        let mut reader = FileReader::open(tmp.path(), FileType::Vtx, &pos).unwrap();
        assert_eq!(reader.read_exact(6).unwrap(), b"ABCDEF");
    }

    #[test]
    fn truncation_sweep_removes_uncommitted_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let committed = {
            let mut writer = FileWriter::open(tmp.path(), FileType::Blk, &FilePos::new(0, 0, CHECKSUM_SIZE)).unwrap();
            writer.append(b"committed").unwrap();
            FilePos::new(0, 0, writer.offset())
        };
        // a later write that was never committed to the catalog
        {
            let mut writer = FileWriter::open(tmp.path(), FileType::Blk, &committed).unwrap();
            writer.append(b"uncommitted tail").unwrap();
        }
        // plus a whole uncommitted file and epoch
        FileWriter::open(tmp.path(), FileType::Blk, &FilePos::new(0, 1, CHECKSUM_SIZE))
            .unwrap()
            .append(b"x")
            .unwrap();
        FileWriter::open(tmp.path(), FileType::Blk, &FilePos::new(1, 0, CHECKSUM_SIZE))
            .unwrap()
            .append(b"y")
            .unwrap();

        delete_invalid_files(tmp.path(), FileType::Blk, &committed).unwrap();

        let path = file_path(tmp.path(), FileType::Blk, &committed);
        assert_eq!(fs::metadata(&path).unwrap().len(), u64::from(committed.offset));
        assert!(validate_checksum(tmp.path(), FileType::Blk, &committed).unwrap());
        assert!(!file_path(tmp.path(), FileType::Blk, &FilePos::new(0, 1, 0)).exists());
        assert!(!epoch_path(tmp.path(), FileType::Blk, 1).exists());
    }

    #[test]
    fn next_file_carries_epoch() {
        let pos = FilePos::new(0, 9, 100);
        let next = pos.next_file(10);
        assert_eq!((next.epoch, next.name, next.offset), (1, 0, CHECKSUM_SIZE));
        let next = FilePos::new(0, 3, 7).next_file(10);
        assert_eq!((next.epoch, next.name), (0, 4));
    }
}
