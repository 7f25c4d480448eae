//! Checkpoint store and promising-key journal
//!
//! The checkpoint is a single JSON document rewritten atomically (temp file
//! then rename) after every sampling round and every completed window. A
//! missing file means "start from the configured domain"; an unreadable one
//! is logged and treated the same way. A checkpoint is only resumed by a
//! session with the same domain and the same target.

use crate::error::{Result, SearchError};
use crate::oracle::Fingerprint;
use crate::range::{Key, SearchRange};
use crate::target::SearchTarget;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Persisted search progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub lower: Key,
    pub upper: Key,
    /// Target fingerprint this progress was made against
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub prefix_length: usize,
    /// Next key not yet covered by a completed window; `None` once every
    /// window has been passed over
    pub cursor: Option<Key>,
    /// Leaves a triage pass left without a full search, in key order
    #[serde(default)]
    pub deferred: Vec<SearchRange>,
    pub samples_drawn: u64,
    pub sample_rounds: u64,
    pub keys_verified: u64,
    pub windows_completed: u64,
    /// Verified match, once one is confirmed
    #[serde(default)]
    pub found: Option<Key>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Progress at the very start of `domain`
    pub fn fresh(domain: SearchRange, target: &SearchTarget) -> Self {
        Self {
            lower: domain.lower(),
            upper: domain.upper(),
            target: target.fingerprint().to_string(),
            prefix_length: target.prefix_length(),
            cursor: Some(domain.lower()),
            deferred: Vec::new(),
            samples_drawn: 0,
            sample_rounds: 0,
            keys_verified: 0,
            windows_completed: 0,
            found: None,
            saved_at: Utc::now(),
        }
    }

    pub fn domain(&self) -> Result<SearchRange> {
        SearchRange::new(self.lower, self.upper)
    }

    /// Whether this progress was made for `domain` and `target`
    pub fn belongs_to(&self, domain: SearchRange, target: &SearchTarget) -> bool {
        self.lower == domain.lower()
            && self.upper == domain.upper()
            && self.target == target.fingerprint().as_str()
            && self.prefix_length == target.prefix_length()
    }

    /// Every key of the domain has been searched
    pub fn is_exhausted(&self) -> bool {
        self.cursor.is_none() && self.deferred.is_empty()
    }

    /// Keys of the domain not yet covered
    pub fn remaining(&self) -> Option<SearchRange> {
        let cursor = self.cursor?;
        SearchRange::new(cursor, self.upper).ok()
    }

    /// Move the cursor past `window`. `skipped` are the leaves of the window
    /// that were not searched in full; they stay pending.
    pub fn complete_window(&mut self, window: SearchRange, skipped: &[SearchRange]) {
        self.windows_completed += 1;
        self.deferred.extend_from_slice(skipped);
        self.deferred.sort();
        self.cursor = match window.upper().checked_add(1) {
            Some(next) if next <= self.upper => Some(next),
            _ => None,
        };
    }

    /// Drop `leaf` from the deferred list once it has been searched in full.
    pub fn complete_deferred(&mut self, leaf: SearchRange) {
        self.windows_completed += 1;
        self.deferred.retain(|pending| *pending != leaf);
    }

    fn is_consistent(&self) -> bool {
        let within = |key: Key| (self.lower..=self.upper).contains(&key);
        self.lower <= self.upper
            && self.cursor.map_or(true, within)
            && self
                .deferred
                .iter()
                .all(|leaf| within(leaf.lower()) && within(leaf.upper()))
    }
}

/// Where the last save ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Disk,
    /// Storage failed twice; the state lives only in this process
    Memory,
}

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    fallback: Mutex<Option<Checkpoint>>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fallback(&self) -> MutexGuard<'_, Option<Checkpoint>> {
        self.fallback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let temp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SearchError::storage(parent, e))?;
        }
        std::fs::write(&temp, data).map_err(|e| SearchError::storage(&temp, e))?;
        std::fs::rename(&temp, &self.path).map_err(|e| SearchError::storage(&self.path, e))
    }

    /// Persist `checkpoint`, retrying once before falling back to memory.
    pub fn save(&self, checkpoint: &Checkpoint) -> Durability {
        let written = serde_json::to_vec_pretty(checkpoint)
            .map_err(SearchError::from)
            .and_then(|data| {
                self.write(&data).or_else(|first| {
                    debug!(error = %first, "checkpoint write failed, retrying once");
                    self.write(&data)
                })
            });
        match written {
            Ok(()) => {
                *self.fallback() = None;
                Durability::Disk
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint not durable, keeping it in memory");
                *self.fallback() = Some(checkpoint.clone());
                Durability::Memory
            }
        }
    }

    /// Latest saved state, if any. Malformed files read as absent.
    pub fn load(&self) -> Option<Checkpoint> {
        if let Some(checkpoint) = self.fallback().clone() {
            return Some(checkpoint);
        }
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint unreadable, ignoring it");
                return None;
            }
        };
        match serde_json::from_slice::<Checkpoint>(&data) {
            Ok(checkpoint) if checkpoint.is_consistent() => Some(checkpoint),
            Ok(_) => {
                warn!(path = %self.path.display(), "checkpoint bounds are inconsistent, ignoring it");
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "malformed checkpoint, ignoring it");
                None
            }
        }
    }

    /// Resume the saved state when it was made for `domain` and `target`,
    /// otherwise start fresh. The flag reports whether a checkpoint was
    /// resumed.
    pub fn resume_or(&self, domain: SearchRange, target: &SearchTarget) -> (Checkpoint, bool) {
        match self.load() {
            Some(saved) if saved.belongs_to(domain, target) => {
                info!(
                    cursor = ?saved.cursor,
                    deferred = saved.deferred.len(),
                    samples = saved.samples_drawn,
                    windows = saved.windows_completed,
                    "resuming from checkpoint"
                );
                (saved, true)
            }
            Some(saved) => {
                warn!(
                    saved = %format_args!("[{}, {}] {}/{}", saved.lower, saved.upper, saved.target, saved.prefix_length),
                    configured = %format_args!("{} {}/{}", domain, target.fingerprint(), target.prefix_length()),
                    "checkpoint is for a different search, starting fresh"
                );
                (Checkpoint::fresh(domain, target), false)
            }
            None => (Checkpoint::fresh(domain, target), false),
        }
    }
}

/// Mutex-guarded live progress, saved on every update
#[derive(Debug)]
pub struct Progress {
    store: CheckpointStore,
    state: Mutex<Checkpoint>,
}

impl Progress {
    pub fn new(store: CheckpointStore, initial: Checkpoint) -> Self {
        Self {
            store,
            state: Mutex::new(initial),
        }
    }

    fn state(&self) -> MutexGuard<'_, Checkpoint> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Checkpoint {
        self.state().clone()
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Apply `update`, stamp the time and save. The lock is held across the
    /// save so concurrent updates reach disk in order.
    pub fn record<F>(&self, update: F) -> Durability
    where
        F: FnOnce(&mut Checkpoint),
    {
        let mut state = self.state();
        update(&mut state);
        state.saved_at = Utc::now();
        self.store.save(&state)
    }
}

/// One prefix-matching candidate, as journaled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromisingEntry {
    pub key: Key,
    pub fingerprint: Fingerprint,
    /// Hex positions shared with the target fingerprint
    pub shared_positions: usize,
    pub found_at: DateTime<Utc>,
}

/// Append-only JSON-lines journal of promising keys
#[derive(Debug)]
pub struct PromisingLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PromisingLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append entries. Failures are logged; the journal is informational.
    pub fn append(&self, entries: &[PromisingEntry]) {
        if entries.is_empty() {
            return;
        }
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = self.append_locked(entries) {
            warn!(path = %self.path.display(), error = %e, "failed to journal promising keys");
        }
    }

    fn append_locked(&self, entries: &[PromisingEntry]) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SearchError::storage(&self.path, e))?;
        let mut buffer = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buffer, entry)?;
            buffer.push(b'\n');
        }
        file.write_all(&buffer)
            .map_err(|e| SearchError::storage(&self.path, e))
    }

    /// Every well-formed entry in the journal, oldest first
    pub fn read_all(&self) -> Result<Vec<PromisingEntry>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SearchError::storage(&self.path, e)),
        };
        Ok(text
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
