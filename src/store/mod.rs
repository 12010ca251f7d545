//! Indexed Storage
//!
//! The ordered key/value store a cache persists into once its lock is held.
//! The coordinator only needs `get/put/remove/close` on a store opened from a
//! cache file path, so the store is pluggable through [`IndexedStoreFactory`].
//!
//! # Default store
//!
//! [`AppendLogStore`] keeps the whole index in memory and appends one record
//! per mutation to `<name>.bin`:
//!
//! ```text
//! ┌──────┬──────────────┬─────────┬────────────────┬───────────┐
//! │ op   │ key len (u32)│ key     │ value len (u32)│ value     │  op 1 = put
//! ├──────┼──────────────┼─────────┼────────────────┴───────────┤
//! │ op   │ key len (u32)│ key     │                            │  op 2 = remove
//! └──────┴──────────────┴─────────┴────────────────────────────┘
//! ```
//!
//! Opening replays the log; a torn trailing record (crash mid-append) is
//! dropped. The log is compacted on close once dead records dominate.

mod serializer;

pub use serializer::{BytesSerializer, JsonSerializer, Serializer, StringSerializer};

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;

const OP_PUT: u8 = 1;
const OP_REMOVE: u8 = 2;

/// Compact when the log holds this many records per live entry
const COMPACTION_RATIO: usize = 4;

/// Byte-level store backing one indexed cache
pub trait ByteStore: Send {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn remove(&mut self, key: &[u8]) -> Result<()>;

    /// Drop all content
    fn clear(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Opens stores for cache files
pub trait IndexedStoreFactory: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn ByteStore>>;
}

/// Factory for [`AppendLogStore`]
#[derive(Debug, Default, Clone, Copy)]
pub struct AppendLogStoreFactory;

impl IndexedStoreFactory for AppendLogStoreFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn ByteStore>> {
        Ok(Box::new(AppendLogStore::open(path)?))
    }
}

/// Append-only log store
pub struct AppendLogStore {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    index: HashMap<Vec<u8>, Vec<u8>>,
    records: usize,
}

impl std::fmt::Debug for AppendLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendLogStore")
            .field("path", &self.path)
            .field("entries", &self.index.len())
            .field("records", &self.records)
            .finish()
    }
}

impl AppendLogStore {
    /// Open the store at `path`, replaying existing records
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut index = HashMap::new();
        let mut records = 0;
        let mut valid_len = 0u64;
        if path.exists() {
            let mut data = Vec::new();
            File::open(path)?.read_to_end(&mut data)?;
            let mut cursor = 0usize;
            while let Some((record, next)) = decode_record(&data, cursor) {
                match record {
                    Record::Put(key, value) => {
                        index.insert(key, value);
                    }
                    Record::Remove(key) => {
                        index.remove(&key);
                    }
                }
                records += 1;
                cursor = next;
            }
            if cursor < data.len() {
                warn!(
                    "Dropping {} bytes of torn records from {}",
                    data.len() - cursor,
                    path.display()
                );
            }
            valid_len = cursor as u64;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.set_len(valid_len)?;
        let file = OpenOptions::new().append(true).open(path)?;
        debug!(
            "Opened store {} with {} entries ({} records)",
            path.display(),
            index.len(),
            records
        );
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            index,
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn append(&mut self, record: &[u8]) -> Result<()> {
        if self.writer.is_none() {
            let file = OpenOptions::new().append(true).create(true).open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(record)?;
        }
        self.records += 1;
        Ok(())
    }

    fn rewrite(&mut self) -> Result<()> {
        self.writer.take();
        let tmp = self.path.with_extension("bin.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for (key, value) in &self.index {
                out.write_all(&encode_put(key, value))?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        self.records = self.index.len();
        Ok(())
    }
}

impl ByteStore for AppendLogStore {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.index.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(&encode_put(key, value))?;
        self.index.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<()> {
        if self.index.remove(key).is_some() {
            self.append(&encode_remove(key))?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.index.clear();
        self.rewrite()
    }

    fn close(&mut self) -> Result<()> {
        if self.records > self.index.len().max(1) * COMPACTION_RATIO {
            debug!("Compacting {}", self.path.display());
            return self.rewrite();
        }
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl Drop for AppendLogStore {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

enum Record {
    Put(Vec<u8>, Vec<u8>),
    Remove(Vec<u8>),
}

fn encode_put(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + key.len() + value.len());
    out.push(OP_PUT);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn encode_remove(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + key.len());
    out.push(OP_REMOVE);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out
}

fn read_chunk(data: &[u8], at: usize) -> Option<(&[u8], usize)> {
    let len_end = at.checked_add(4)?;
    let len_bytes: [u8; 4] = data.get(at..len_end)?.try_into().ok()?;
    let end = len_end.checked_add(u32::from_be_bytes(len_bytes) as usize)?;
    Some((data.get(len_end..end)?, end))
}

fn decode_record(data: &[u8], at: usize) -> Option<(Record, usize)> {
    let op = *data.get(at)?;
    let (key, next) = read_chunk(data, at + 1)?;
    match op {
        OP_PUT => {
            let (value, next) = read_chunk(data, next)?;
            Some((Record::Put(key.to_vec(), value.to_vec()), next))
        }
        OP_REMOVE => Some((Record::Remove(key.to_vec()), next)),
        _ => None,
    }
}

// =============================================================================
// Typed store
// =============================================================================

/// A [`ByteStore`] with key and value serializers
pub struct IndexedStore<K, V> {
    store: Box<dyn ByteStore>,
    key_serializer: Arc<dyn Serializer<K>>,
    value_serializer: Arc<dyn Serializer<V>>,
}

impl<K: 'static, V: 'static> IndexedStore<K, V> {
    pub fn new(
        store: Box<dyn ByteStore>,
        key_serializer: Arc<dyn Serializer<K>>,
        value_serializer: Arc<dyn Serializer<V>>,
    ) -> Self {
        Self {
            store,
            key_serializer,
            value_serializer,
        }
    }

    pub fn get(&mut self, key: &K) -> Result<Option<V>> {
        let key = self.key_serializer.write(key)?;
        match self.store.get(&key)? {
            Some(bytes) => Ok(Some(self.value_serializer.read(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&mut self, key: &K, value: &V) -> Result<()> {
        let key = self.key_serializer.write(key)?;
        let value = self.value_serializer.write(value)?;
        self.store.put(&key, &value)
    }

    pub fn remove(&mut self, key: &K) -> Result<()> {
        let key = self.key_serializer.write(key)?;
        self.store.remove(&key)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.store.clear()
    }

    pub fn close(&mut self) -> Result<()> {
        self.store.close()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashes.bin");
        {
            let mut store = AppendLogStore::open(&path).unwrap();
            store.put(b"a", b"1").unwrap();
            store.put(b"b", b"2").unwrap();
            store.put(b"a", b"3").unwrap();
            store.remove(b"b").unwrap();
            store.close().unwrap();
        }
        let mut store = AppendLogStore::open(&path).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_torn_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashes.bin");
        {
            let mut store = AppendLogStore::open(&path).unwrap();
            store.put(b"kept", b"yes").unwrap();
            store.close().unwrap();
        }
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&encode_put(b"lost", b"value")[..7]).unwrap();
        drop(raw);

        let mut store = AppendLogStore::open(&path).unwrap();
        assert_eq!(store.get(b"kept").unwrap(), Some(b"yes".to_vec()));
        assert_eq!(store.get(b"lost").unwrap(), None);
        store.put(b"after", b"1").unwrap();
        store.close().unwrap();

        let mut store = AppendLogStore::open(&path).unwrap();
        assert_eq!(store.get(b"after").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_close_compacts_dead_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashes.bin");
        let mut store = AppendLogStore::open(&path).unwrap();
        for i in 0..20u8 {
            store.put(b"k", &[i]).unwrap();
        }
        store.close().unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len() as usize,
            encode_put(b"k", &[19]).len()
        );
        let mut store = AppendLogStore::open(&path).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(vec![19]));
    }

    #[test]
    fn test_clear_empties_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashes.bin");
        let mut store = AppendLogStore::open(&path).unwrap();
        store.put(b"k", b"v").unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());
        store.put(b"x", b"y").unwrap();
        store.close().unwrap();
        let mut store = AppendLogStore::open(&path).unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
        assert_eq!(store.get(b"x").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn test_typed_store() {
        let dir = tempfile::tempdir().unwrap();
        let raw = AppendLogStoreFactory.open(&dir.path().join("t.bin")).unwrap();
        let mut store: IndexedStore<String, u64> =
            IndexedStore::new(raw, Arc::new(StringSerializer), Arc::new(JsonSerializer::new()));
        store.put(&"answer".to_string(), &42).unwrap();
        assert_eq!(store.get(&"answer".to_string()).unwrap(), Some(42));
        store.remove(&"answer".to_string()).unwrap();
        assert_eq!(store.get(&"answer".to_string()).unwrap(), None);
    }
}
