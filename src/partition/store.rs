//! Durable storage for offloaded partition nodes
//!
//! One blob per node, addressed by its range bounds:
//! `node_<lower:032x>_<upper:032x>.bin`. A blob is a bincode payload followed
//! by a little-endian CRC32 of that payload. Writes go to a `.tmp` sibling
//! and are renamed into place.
//!
//! Failure policy: a failed write is retried once and then kept in memory for
//! the rest of the process; a missing or corrupt blob is rebuilt from the
//! bounds encoded in its key. Neither is an error for the caller.

use crate::error::{Result, SearchError};
use crate::range::{Key, SearchRange};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

const BLOB_VERSION: u32 = 1;
const BLOB_PREFIX: &str = "node_";
const BLOB_SUFFIX: &str = ".bin";

/// Reference to an offloaded node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageKey(SearchRange);

impl StorageKey {
    pub fn new(range: SearchRange) -> Self {
        Self(range)
    }

    pub fn range(&self) -> SearchRange {
        self.0
    }

    fn file_name(&self) -> String {
        format!(
            "{}{:032x}_{:032x}{}",
            BLOB_PREFIX,
            self.0.lower(),
            self.0.upper(),
            BLOB_SUFFIX
        )
    }

    fn from_file_name(name: &str) -> Option<Self> {
        let body = name.strip_prefix(BLOB_PREFIX)?.strip_suffix(BLOB_SUFFIX)?;
        let (lower, upper) = body.split_once('_')?;
        let lower = Key::from_str_radix(lower, 16).ok()?;
        let upper = Key::from_str_radix(upper, 16).ok()?;
        SearchRange::new(lower, upper).ok().map(Self)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeBlob {
    version: u32,
    range: SearchRange,
    depth: u32,
}

/// Where a loaded node came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobSource {
    Disk,
    Memory,
    Rebuilt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedNode {
    pub range: SearchRange,
    pub depth: u32,
    pub source: BlobSource,
}

/// Directory of node blobs, safe for concurrent use on distinct keys
#[derive(Debug)]
pub struct NodeStore {
    dir: PathBuf,
    memory_only: Mutex<FxHashSet<StorageKey>>,
    offloads: AtomicU64,
}

impl NodeStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| SearchError::storage(&dir, e))?;
        Ok(Self {
            dir,
            memory_only: Mutex::new(FxHashSet::default()),
            offloads: AtomicU64::new(0),
        })
    }

    /// Nodes offloaded through this store since it was opened
    pub fn offloads(&self) -> u64 {
        self.offloads.load(Ordering::Relaxed)
    }

    fn path_for(&self, key: &StorageKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, FxHashSet<StorageKey>> {
        self.memory_only
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn encode(blob: &NodeBlob) -> bincode::Result<Vec<u8>> {
        let mut data = bincode::serialize(blob)?;
        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    fn decode(data: &[u8]) -> Option<NodeBlob> {
        if data.len() < 4 {
            return None;
        }
        let (payload, crc) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if crc32fast::hash(payload) != expected {
            return None;
        }
        bincode::deserialize::<NodeBlob>(payload)
            .ok()
            .filter(|blob| blob.version == BLOB_VERSION)
    }

    fn write_blob(&self, key: &StorageKey, data: &[u8]) -> std::io::Result<()> {
        let path = self.path_for(key);
        let temp = path.with_extension("bin.tmp");
        std::fs::write(&temp, data)?;
        std::fs::rename(&temp, &path)
    }

    /// Persist a node covering `range` and return its reference.
    pub fn offload(&self, range: SearchRange, depth: u32) -> StorageKey {
        let key = StorageKey::new(range);
        self.offloads.fetch_add(1, Ordering::Relaxed);
        let blob = NodeBlob {
            version: BLOB_VERSION,
            range,
            depth,
        };

        let written = Self::encode(&blob)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            .and_then(|data| {
                self.write_blob(&key, &data).or_else(|first| {
                    debug!(node = %key, error = %first, "node write failed, retrying once");
                    self.write_blob(&key, &data)
                })
            });
        match written {
            Ok(()) => {
                self.memory().remove(&key);
            }
            Err(e) => {
                warn!(node = %key, error = %e, "node storage unavailable, keeping node in memory");
                self.memory().insert(key);
            }
        }
        key
    }

    /// Materialize a node. Never fails: unreadable blobs are rebuilt from
    /// the key's bounds.
    pub fn load(&self, key: &StorageKey) -> LoadedNode {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(data) => match Self::decode(&data) {
                Some(blob) if blob.range == key.range() => {
                    return LoadedNode {
                        range: blob.range,
                        depth: blob.depth,
                        source: BlobSource::Disk,
                    };
                }
                _ => warn!(node = %key, "corrupt node blob, rebuilding from bounds"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.memory().contains(key) {
                    return LoadedNode {
                        range: key.range(),
                        depth: 0,
                        source: BlobSource::Memory,
                    };
                }
                warn!(node = %key, "node blob missing, rebuilding from bounds");
            }
            Err(e) => warn!(node = %key, error = %e, "node blob unreadable, rebuilding from bounds"),
        }
        LoadedNode {
            range: key.range(),
            depth: 0,
            source: BlobSource::Rebuilt,
        }
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.path_for(key).exists() || self.memory().contains(key)
    }

    /// Remove a node's blob. Deleting an absent node is a no-op.
    pub fn delete(&self, key: &StorageKey) -> bool {
        let in_memory = self.memory().remove(key);
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => in_memory,
            Err(e) => {
                warn!(node = %key, error = %e, "failed to delete node blob");
                false
            }
        }
    }

    /// Keys of every blob currently on disk
    pub fn list(&self) -> Result<Vec<StorageKey>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| SearchError::storage(&self.dir, e))?;
        let mut keys: Vec<StorageKey> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().and_then(StorageKey::from_file_name))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Delete blobs (and stray temp files) not in `live`. Returns the number
    /// of files removed.
    pub fn sweep(&self, live: &HashSet<StorageKey>) -> Result<usize> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| SearchError::storage(&self.dir, e))?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let stale = if name.ends_with(".tmp") {
                name.starts_with(BLOB_PREFIX)
            } else {
                StorageKey::from_file_name(name).map_or(false, |key| !live.contains(&key))
            };
            if stale && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "swept orphaned node blobs");
        }
        Ok(removed)
    }
}
