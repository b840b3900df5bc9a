// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::{collections::HashMap, path::Path, sync::Arc};

use lmdb_zero as lmdb;
use lmdb_zero::{db, open, put, LmdbResultExt, ReadTransaction, WriteTransaction};
use log::*;

use crate::error::StorageError;

const LOG_TARGET: &str = "storage::lmdb";
const MB: usize = 1024 * 1024;

/// Builder for an [`LMDBStore`]. Databases must be declared up front; LMDB cannot add
/// named databases after the environment is opened with a fixed `maxdbs`.
pub struct LMDBBuilder {
    path: String,
    env_size_mb: usize,
    db_names: Vec<String>,
}

impl LMDBBuilder {
    pub fn new() -> Self {
        Self {
            path: "./store".into(),
            env_size_mb: 64,
            db_names: Vec::new(),
        }
    }

    /// Set the directory the environment lives in. It must exist.
    pub fn set_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = path.as_ref().to_string_lossy().into_owned();
        self
    }

    /// Set the maximum size of the memory map, in MB.
    pub fn set_environment_size(mut self, size_mb: usize) -> Self {
        self.env_size_mb = size_mb;
        self
    }

    pub fn add_database(mut self, name: &str) -> Self {
        self.db_names.push(name.to_string());
        self
    }

    pub fn build(self) -> Result<LMDBStore, StorageError> {
        let env = unsafe {
            let mut builder = lmdb::EnvBuilder::new()?;
            builder.set_mapsize(self.env_size_mb * MB)?;
            builder.set_maxdbs(self.db_names.len() as u32 + 1)?;
            builder.open(&self.path, open::Flags::empty(), 0o600)?
        };
        let env = Arc::new(env);
        let mut databases = HashMap::with_capacity(self.db_names.len());
        for name in &self.db_names {
            let db = lmdb::Database::open(
                env.clone(),
                Some(name),
                &lmdb::DatabaseOptions::new(db::CREATE),
            )?;
            databases.insert(
                name.clone(),
                LMDBDatabase {
                    name: name.clone(),
                    env: env.clone(),
                    db: Arc::new(db),
                },
            );
        }
        debug!(
            target: LOG_TARGET,
            "LMDB environment opened at {} ({} MB, {} databases)",
            self.path,
            self.env_size_mb,
            databases.len()
        );
        Ok(LMDBStore { env, databases })
    }
}

impl Default for LMDBBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An opened LMDB environment holding a set of named databases.
pub struct LMDBStore {
    env: Arc<lmdb::Environment>,
    databases: HashMap<String, LMDBDatabase>,
}

impl LMDBStore {
    pub fn get_handle(&self, name: &str) -> Result<LMDBDatabase, StorageError> {
        self.databases
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownDatabase(name.to_string()))
    }

    /// Flush the environment buffers to disk synchronously.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.env.sync(true)?;
        Ok(())
    }
}

/// Handle to a single named database. Clones share the environment; LMDB serializes
/// writers internally so handles may be used from any thread.
#[derive(Clone)]
pub struct LMDBDatabase {
    name: String,
    env: Arc<lmdb::Environment>,
    db: Arc<lmdb::Database<'static>>,
}

impl LMDBDatabase {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let txn = WriteTransaction::new(self.env.clone())?;
        {
            let mut access = txn.access();
            access.put(&self.db, key, value, put::Flags::empty())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Insert a batch of records in a single write transaction.
    pub fn insert_batch<'a, I>(&self, records: I) -> Result<(), StorageError>
    where I: IntoIterator<Item = (&'a [u8], &'a [u8])> {
        let txn = WriteTransaction::new(self.env.clone())?;
        {
            let mut access = txn.access();
            for (key, value) in records {
                access.put(&self.db, key, value, put::Flags::empty())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = ReadTransaction::new(self.env.clone())?;
        let access = txn.access();
        let value: Option<&[u8]> = access.get(&self.db, key).to_opt()?;
        Ok(value.map(|v| v.to_vec()))
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Delete the record. Missing keys are not an error.
    pub fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        let txn = WriteTransaction::new(self.env.clone())?;
        {
            let mut access = txn.access();
            access.del_key(&self.db, key).to_opt()?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        let txn = ReadTransaction::new(self.env.clone())?;
        let stat = txn.db_stat(&self.db)?;
        Ok(stat.entries)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Visit every record in key order.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), StorageError>
    where F: FnMut(&[u8], &[u8]) {
        let txn = ReadTransaction::new(self.env.clone())?;
        let access = txn.access();
        let mut cursor = txn.cursor(self.db.clone())?;
        let mut row: Option<(&[u8], &[u8])> = cursor.first(&access).to_opt()?;
        while let Some((k, v)) = row {
            f(k, v);
            row = cursor.next(&access).to_opt()?;
        }
        Ok(())
    }

    /// Remove every record in this database.
    pub fn clear(&self) -> Result<(), StorageError> {
        let txn = WriteTransaction::new(self.env.clone())?;
        {
            let mut access = txn.access();
            access.clear_db(&self.db)?;
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn init(dir: &Path) -> LMDBStore {
        LMDBBuilder::new()
            .set_path(dir)
            .set_environment_size(10)
            .add_database("test_a")
            .add_database("test_b")
            .build()
            .unwrap()
    }

    #[test]
    fn insert_get_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = init(tmp.path());
        let db = store.get_handle("test_a").unwrap();

        db.insert(b"alpha", b"1").unwrap();
        db.insert(b"beta", b"2").unwrap();
        assert_eq!(db.get(b"alpha").unwrap().unwrap(), b"1");
        assert!(db.contains_key(b"beta").unwrap());
        assert_eq!(db.len().unwrap(), 2);

        db.delete(b"alpha").unwrap();
        assert!(db.get(b"alpha").unwrap().is_none());
        // Deleting a missing key is fine
        db.delete(b"alpha").unwrap();
    }

    #[test]
    fn databases_are_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let store = init(tmp.path());
        let a = store.get_handle("test_a").unwrap();
        let b = store.get_handle("test_b").unwrap();
        a.insert(b"k", b"in_a").unwrap();
        assert!(b.get(b"k").unwrap().is_none());
        assert!(store.get_handle("nope").is_err());
    }

    #[test]
    fn iterate_in_key_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = init(tmp.path());
        let db = store.get_handle("test_a").unwrap();
        db.insert(b"b", b"2").unwrap();
        db.insert(b"a", b"1").unwrap();
        db.insert(b"c", b"3").unwrap();

        let mut keys = Vec::new();
        db.for_each(|k, _| keys.push(k.to_vec())).unwrap();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
