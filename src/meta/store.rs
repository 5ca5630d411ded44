//! Embedded per-root key/value metadata store
//!
//! An append-only log of checksummed records replayed into an in-memory index
//! on open. One instance per storage root, shared by every tablet on that
//! root; readers and writers on distinct keys proceed concurrently.
//!
//! ## Checksum protection
//! - Every record carries a CRC32 checksum
//! - A torn tail from a crash is detected and replay stops there

use crate::{EngineError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

const META_LOG_NAME: &str = "meta.log";

#[derive(Debug, Clone, Serialize, Deserialize)]
enum MetaRecord {
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

/// Write counters, exposed for tests and admin introspection.
#[derive(Debug, Clone, Default)]
pub struct MetaStoreStats {
    pub puts: u64,
    pub removes: u64,
    pub live_keys: usize,
}

/// Durable key/value store for one storage root.
pub struct MetaStore {
    root: PathBuf,
    index: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    log: Mutex<File>,
    puts: AtomicU64,
    removes: AtomicU64,
}

impl MetaStore {
    /// Open the store under a storage root, replaying any existing log.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let log_path = root.join(META_LOG_NAME);

        let mut index = BTreeMap::new();
        if log_path.exists() {
            let mut buffer = Vec::new();
            File::open(&log_path)?.read_to_end(&mut buffer)?;
            Self::replay(&buffer, &mut index);
        }

        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
        Ok(Self {
            root,
            index: RwLock::new(index),
            log: Mutex::new(log),
            puts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replay the record log into the index.
    ///
    /// Record framing: u32 payload length, u32 CRC32 of the payload, payload.
    /// A truncated or checksum-failing tail is treated as a torn final write:
    /// replay stops and everything before it stays usable.
    fn replay(buffer: &[u8], index: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        let mut offset = 0usize;
        while offset < buffer.len() {
            if offset + 8 > buffer.len() {
                warn!(offset, "truncated record header in meta log, stopping replay");
                break;
            }
            let len = u32::from_le_bytes(buffer[offset..offset + 4].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(buffer[offset + 4..offset + 8].try_into().unwrap());
            let start = offset + 8;
            if start + len > buffer.len() {
                warn!(offset, len, "truncated record payload in meta log, stopping replay");
                break;
            }
            let payload = &buffer[start..start + len];
            if crc32fast::hash(payload) != crc {
                warn!(offset, "checksum mismatch in meta log, stopping replay");
                break;
            }
            match bincode::deserialize::<MetaRecord>(payload) {
                Ok(MetaRecord::Put { key, value }) => {
                    index.insert(key, value);
                }
                Ok(MetaRecord::Remove { key }) => {
                    index.remove(&key);
                }
                Err(e) => {
                    warn!(offset, error = %e, "undecodable record in meta log, stopping replay");
                    break;
                }
            }
            offset = start + len;
        }
    }

    fn append(&self, record: &MetaRecord) -> Result<()> {
        let payload = bincode::serialize(record)?;
        let crc = crc32fast::hash(&payload);
        let mut framed = Vec::with_capacity(payload.len() + 8);
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(&crc.to_le_bytes());
        framed.extend_from_slice(&payload);

        let mut log = self.log.lock();
        log.write_all(&framed)?;
        log.sync_data()?;
        Ok(())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(&MetaRecord::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        self.index.write().insert(key.to_vec(), value.to_vec());
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.index
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(String::from_utf8_lossy(key).into_owned()))
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.read().contains_key(key)
    }

    /// Removing an absent key is a success and writes nothing.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        if !self.contains(key) {
            return Ok(());
        }
        self.append(&MetaRecord::Remove { key: key.to_vec() })?;
        self.index.write().remove(key);
        self.removes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Visit every live key under `prefix` exactly once, in key order.
    /// The visitor returns false to stop early.
    ///
    /// The index read guard is held across the visits, so the visitor must
    /// not call back into this store.
    pub fn scan_prefix<F>(&self, prefix: &[u8], mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let index = self.index.read();
        for (key, value) in index.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if !visit(key, value) {
                break;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> MetaStoreStats {
        MetaStoreStats {
            puts: self.puts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            live_keys: self.index.read().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        store.put(b"k1", b"v1").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), b"v1");
        assert!(store.contains(b"k1"));

        store.put(b"k1", b"v2").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), b"v2");

        store.remove(b"k1").unwrap();
        assert!(!store.contains(b"k1"));
        assert!(store.get(b"k1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_absent_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        store.remove(b"never-written").unwrap();
        assert_eq!(store.stats().removes, 0);
    }

    #[test]
    fn test_reopen_replays_log() {
        let dir = TempDir::new().unwrap();
        {
            let store = MetaStore::open(dir.path()).unwrap();
            store.put(b"a", b"1").unwrap();
            store.put(b"b", b"2").unwrap();
            store.put(b"a", b"3").unwrap();
            store.remove(b"b").unwrap();
        }
        let store = MetaStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"a").unwrap(), b"3");
        assert!(!store.contains(b"b"));
        assert_eq!(store.stats().live_keys, 1);
    }

    #[test]
    fn test_torn_tail_is_skipped() {
        let dir = TempDir::new().unwrap();
        {
            let store = MetaStore::open(dir.path()).unwrap();
            store.put(b"a", b"1").unwrap();
        }
        // Simulate a crash in the middle of the next record
        let log_path = dir.path().join(META_LOG_NAME);
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[0xfe, 0xed, 0xfa]).unwrap();

        let store = MetaStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"a").unwrap(), b"1");
        // New writes after a torn tail still land
        store.put(b"b", b"2").unwrap();
        assert_eq!(store.get(b"b").unwrap(), b"2");
    }

    #[test]
    fn test_scan_prefix_exactly_once() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        store.put(b"rst_a", b"1").unwrap();
        store.put(b"rst_b", b"2").unwrap();
        store.put(b"tbm_c", b"3").unwrap();

        let mut seen = Vec::new();
        store
            .scan_prefix(b"rst_", |k, _| {
                seen.push(k.to_vec());
                true
            })
            .unwrap();
        assert_eq!(seen, vec![b"rst_a".to_vec(), b"rst_b".to_vec()]);
    }

    #[test]
    fn test_scan_prefix_stop() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        for i in 0..5u8 {
            store.put(&[b'p', i], &[i]).unwrap();
        }
        let mut count = 0;
        store
            .scan_prefix(b"p", |_, _| {
                count += 1;
                count < 2
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_stats_counters() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        store.remove(b"a").unwrap();
        let stats = store.stats();
        assert_eq!(stats.puts, 2);
        assert_eq!(stats.removes, 1);
        assert_eq!(stats.live_keys, 1);
    }
}
