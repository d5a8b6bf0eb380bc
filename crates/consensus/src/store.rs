//! Key-value stores backing proposer snapshots
//!
//! `SledStore` keeps records on disk across restarts, `MemoryStore` is used for tests
//! and ephemeral nodes.

use crate::error::Result;
use parking_lot::RwLock;
use sled::Db;
use std::collections::BTreeMap;
use std::path::Path;

/// Ordered byte-key store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Greatest entry whose key is `<= key`
    fn seek_at_or_before(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
}

/// Persistent store on a sled tree
pub struct SledStore {
    db: Db,
    proposers: sled::Tree,
}

impl SledStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(&path)?;
        let proposers = db.open_tree("proposers")?;

        tracing::info!("Opened snapshot store at {:?}", path.as_ref());

        Ok(Self { db, proposers })
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.proposers.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.proposers.insert(key, value)?;
        Ok(())
    }

    fn seek_at_or_before(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.proposers.range(..=key).next_back() {
            Some(entry) => {
                let (k, v) = entry?;
                Ok(Some((k.to_vec(), v.to_vec())))
            }
            None => Ok(None),
        }
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn seek_at_or_before(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .range(..=key.to_vec())
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(store: &dyn KeyValueStore) {
        store.put(b"k-02", b"two").unwrap();
        store.put(b"k-05", b"five").unwrap();

        assert_eq!(store.get(b"k-02").unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.get(b"k-03").unwrap(), None);

        let (k, v) = store.seek_at_or_before(b"k-04").unwrap().unwrap();
        assert_eq!(k, b"k-02".to_vec());
        assert_eq!(v, b"two".to_vec());

        let (k, _) = store.seek_at_or_before(b"k-05").unwrap().unwrap();
        assert_eq!(k, b"k-05".to_vec());

        assert!(store.seek_at_or_before(b"k-01").unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_sled_store() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        exercise(&store);
        store.flush().unwrap();
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.put(b"key", b"value").unwrap();
            store.flush().unwrap();
        }

        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"key").unwrap(), Some(b"value".to_vec()));
    }
}
